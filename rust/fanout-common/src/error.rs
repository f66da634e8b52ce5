use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<ErrorKind>);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.as_ref()
    }

    pub fn into_kind(self) -> ErrorKind {
        *self.0
    }

    pub fn invalid_arg(name: impl Into<String>, message: impl Into<String>) -> Error {
        Error(
            ErrorKind::InvalidArgument {
                name: name.into(),
                message: message.into(),
            }
            .into(),
        )
    }

    pub fn timed_out(waited: Duration) -> Error {
        Error(ErrorKind::TimedOut { waited }.into())
    }

    pub fn interrupted() -> Error {
        Error(ErrorKind::Interrupted.into())
    }

    pub fn thread_spawn(name: impl Into<String>, source: std::io::Error) -> Error {
        Error(
            ErrorKind::ThreadSpawn {
                name: name.into(),
                source,
            }
            .into(),
        )
    }

    pub fn pool_shutdown() -> Error {
        Error(ErrorKind::PoolShutdown.into())
    }

    /// Returns `true` if this error reports an expired wait deadline.
    pub fn is_timed_out(&self) -> bool {
        matches!(self.kind(), ErrorKind::TimedOut { .. })
    }

    /// Returns `true` if this error reports an interrupted wait.
    pub fn is_interrupted(&self) -> bool {
        matches!(self.kind(), ErrorKind::Interrupted)
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("invalid argument {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("value could not be retrieved within {waited:?}")]
    TimedOut { waited: Duration },

    #[error("wait was interrupted")]
    Interrupted,

    #[error("failed to spawn worker thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        source: std::io::Error,
    },

    #[error("worker pool is shut down")]
    PoolShutdown,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(kind.into())
    }
}
