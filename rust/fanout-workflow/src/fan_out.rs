//! Iterator adapters turning input sequences into [`Task`]s.
//!
//! The adapters are lazy: each task is built when the executor pulls it, and
//! the input is never copied. Exact-size inputs yield exact-size task
//! iterators, which lets an executor learn the task count up front.

use std::sync::Arc;

use crate::executor::Task;

/// Wraps each item into a task that calls `f(item)`.
pub fn tasks<I, F>(items: I, f: F) -> TaskIter<I::IntoIter, F>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) + Send + Sync + 'static,
{
    TaskIter {
        items: items.into_iter(),
        f: Arc::new(f),
    }
}

/// Wraps each item into a task that calls `f(item, index)`, where `index` is
/// the item's zero-based position in the input.
///
/// The index is fixed when the task is built, so it reflects input order no
/// matter in which order the tasks end up running.
pub fn indexed_tasks<I, F>(items: I, f: F) -> IndexedTaskIter<I::IntoIter, F>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item, usize) + Send + Sync + 'static,
{
    IndexedTaskIter {
        items: Counting::new(items.into_iter()),
        f: Arc::new(f),
    }
}

/// Wraps each key/value pair into a task that calls `f(key, value)`.
pub fn entry_tasks<I, K, V, F>(
    entries: I,
    f: F,
) -> TaskIter<I::IntoIter, impl Fn((K, V)) + Send + Sync + 'static>
where
    I: IntoIterator<Item = (K, V)>,
    K: Send + 'static,
    V: Send + 'static,
    F: Fn(K, V) + Send + Sync + 'static,
{
    tasks(entries, move |(key, value)| f(key, value))
}

/// Iterator returned by [`tasks`].
pub struct TaskIter<I, F> {
    items: I,
    f: Arc<F>,
}

impl<I, F> Iterator for TaskIter<I, F>
where
    I: Iterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) + Send + Sync + 'static,
{
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        let item = self.items.next()?;
        let f = self.f.clone();
        Some(Box::new(move || f(item)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl<I, F> ExactSizeIterator for TaskIter<I, F>
where
    I: ExactSizeIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) + Send + Sync + 'static,
{
}

/// Iterator returned by [`indexed_tasks`].
pub struct IndexedTaskIter<I, F> {
    items: Counting<I>,
    f: Arc<F>,
}

impl<I, F> Iterator for IndexedTaskIter<I, F>
where
    I: Iterator,
    I::Item: Send + 'static,
    F: Fn(I::Item, usize) + Send + Sync + 'static,
{
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        let item = self.items.next()?;
        let index = self.items.index()?;
        let f = self.f.clone();
        Some(Box::new(move || f(item, index)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl<I, F> ExactSizeIterator for IndexedTaskIter<I, F>
where
    I: ExactSizeIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item, usize) + Send + Sync + 'static,
{
}

/// Iterator that remembers the position of the item it yielded last.
pub struct Counting<I> {
    inner: I,
    yielded: usize,
}

impl<I: Iterator> Counting<I> {
    pub fn new(inner: I) -> Counting<I> {
        Counting { inner, yielded: 0 }
    }

    /// Zero-based position of the last yielded item, `None` before the first.
    pub fn index(&self) -> Option<usize> {
        self.yielded.checked_sub(1)
    }
}

impl<I: Iterator> Iterator for Counting<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        let item = self.inner.next()?;
        self.yielded += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<I: ExactSizeIterator> ExactSizeIterator for Counting<I> {}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    use super::*;

    fn collector<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (seen.clone(), seen)
    }

    #[test]
    fn test_counting() {
        let mut counting = Counting::new(["a", "b"].into_iter());
        assert_eq!(counting.index(), None);
        assert_eq!(counting.next(), Some("a"));
        assert_eq!(counting.index(), Some(0));
        assert_eq!(counting.next(), Some("b"));
        assert_eq!(counting.index(), Some(1));
        assert_eq!(counting.next(), None);
        assert_eq!(counting.index(), Some(1));
    }

    #[test]
    fn test_tasks_are_lazy_and_exact() {
        let (seen, sink) = collector();
        let tasks = tasks(vec![1, 2, 3], move |i| sink.lock().unwrap().push(i));
        assert_eq!(tasks.len(), 3);
        assert!(seen.lock().unwrap().is_empty());
        for task in tasks {
            task();
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_index_is_fixed_at_construction() {
        let (seen, sink) = collector();
        let tasks: Vec<Task> = indexed_tasks(10usize..20, move |item, index| {
            sink.lock().unwrap().push((item, index))
        })
        .collect();
        // Run in reverse to show execution order does not matter.
        for task in tasks.into_iter().rev() {
            task();
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|&(item, index)| item - 10 == index));
    }

    #[test]
    fn test_entry_tasks() {
        let map = BTreeMap::from([("a", 1), ("b", 2)]);
        let (seen, sink) = collector();
        for task in entry_tasks(map, move |k, v| sink.lock().unwrap().push(format!("{k}={v}"))) {
            task();
        }
        assert_eq!(*seen.lock().unwrap(), vec!["a=1", "b=2"]);
    }
}
