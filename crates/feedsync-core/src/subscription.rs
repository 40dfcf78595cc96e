//! Subscription registry: topics, listeners and debounced fan-out.
//!
//! A [`Topic`] holds the current snapshot of one logical stream and the set of
//! listeners registered on it. Registering a listener delivers the current
//! snapshot synchronously; later snapshots are fanned out either immediately
//! or through a trailing-edge [`Debouncer`], depending on how the topic was
//! built.
//!
//! ```text
//! publish(v) ──► current = v ──► Debouncer (latest value only) ──► listeners
//!                                    └── window restarts on every publish
//! ```
//!
//! Listener identity is the `Arc` allocation: registering the same `Arc` twice
//! fails with `AlreadySubscribed`, removing one that is not registered fails
//! with `NotSubscribed`. A panicking listener is logged and does not affect
//! the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{error, trace};

use crate::error::{FeedError, FeedResult};

/// A snapshot listener.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<T, F>(f: F) -> Listener<T>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_listener<T>(a: &Listener<T>, b: &Listener<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Scheduling half of a trailing-edge debounce.
///
/// Only the latest scheduled value is kept; dropping the `Debouncer` ends the
/// paired [`DebouncedReceiver`].
pub struct Debouncer<T> {
    tx: watch::Sender<Option<T>>,
}

/// Receiving half of a trailing-edge debounce.
pub struct DebouncedReceiver<T> {
    rx: watch::Receiver<Option<T>>,
    window: Duration,
}

/// Create a debounce pair with the given quiet window.
pub fn debounce<T>(window: Duration) -> (Debouncer<T>, DebouncedReceiver<T>) {
    let (tx, rx) = watch::channel(None);
    (Debouncer { tx }, DebouncedReceiver { rx, window })
}

impl<T> Debouncer<T> {
    /// Replace the pending value and restart the window.
    pub fn schedule(&self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

impl<T: Clone> DebouncedReceiver<T> {
    /// Wait for the next value that survived a full quiet window.
    ///
    /// Returns `None` once the [`Debouncer`] is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        let window = self.window;
        loop {
            self.rx.changed().await.ok()?;
            loop {
                tokio::select! {
                    changed = self.rx.changed() => changed.ok()?,
                    _ = tokio::time::sleep(window) => break,
                }
            }
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }
}

/// One logical stream of snapshots.
pub struct Topic<T> {
    name: String,
    current: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
    debouncer: Option<Debouncer<T>>,
    attached: AtomicBool,
}

impl<T> Topic<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A topic that fans out every publish immediately.
    pub fn immediate(name: impl Into<String>, initial: T) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            current: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
            debouncer: None,
            attached: AtomicBool::new(false),
        })
    }

    /// A topic whose fan-out is coalesced over `window`.
    ///
    /// Spawns the fan-out task, so it must be called within a tokio runtime.
    pub fn debounced(name: impl Into<String>, initial: T, window: Duration) -> Arc<Self> {
        let (debouncer, mut rx) = debounce(window);
        let topic = Arc::new(Self {
            name: name.into(),
            current: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
            debouncer: Some(debouncer),
            attached: AtomicBool::new(false),
        });

        let weak: Weak<Self> = Arc::downgrade(&topic);
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                match weak.upgrade() {
                    Some(topic) => topic.fan_out(&value),
                    None => break,
                }
            }
        });

        topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current snapshot.
    pub fn current(&self) -> T {
        self.current.read().clone()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Mark the upstream as attached. Returns `true` only for the first call.
    pub fn attach_once(&self) -> bool {
        !self.attached.swap(true, Ordering::SeqCst)
    }

    /// Replace the current snapshot and schedule its delivery.
    pub fn publish(&self, value: T) {
        *self.current.write() = value.clone();
        match &self.debouncer {
            Some(debouncer) => debouncer.schedule(value),
            None => self.fan_out(&value),
        }
    }

    /// Apply `f` to the current snapshot, then publish the result.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let value = {
            let mut current = self.current.write();
            f(&mut current);
            current.clone()
        };
        match &self.debouncer {
            Some(debouncer) => debouncer.schedule(value),
            None => self.fan_out(&value),
        }
    }

    /// Register `listener` and deliver the current snapshot to it.
    pub fn subscribe(self: &Arc<Self>, listener: Listener<T>) -> FeedResult<Subscription> {
        {
            let mut listeners = self.listeners.lock();
            if listeners.iter().any(|l| same_listener(l, &listener)) {
                return Err(FeedError::AlreadySubscribed(self.name.clone()));
            }
            listeners.push(listener.clone());
        }

        let snapshot = self.current();
        self.deliver(&listener, &snapshot);

        let weak = Arc::downgrade(self);
        let registered = listener;
        Ok(Subscription {
            topic: self.name.clone(),
            remove: Box::new(move || match weak.upgrade() {
                Some(topic) => topic.unsubscribe(&registered),
                None => Ok(()),
            }),
        })
    }

    /// Remove `listener`.
    pub fn unsubscribe(&self, listener: &Listener<T>) -> FeedResult<()> {
        let mut listeners = self.listeners.lock();
        match listeners.iter().position(|l| same_listener(l, listener)) {
            Some(index) => {
                listeners.remove(index);
                Ok(())
            }
            None => Err(FeedError::NotSubscribed(self.name.clone())),
        }
    }

    fn fan_out(&self, value: &T) {
        let listeners = self.listeners.lock().clone();
        trace!(topic = %self.name, listeners = listeners.len(), "Fan-out");
        for listener in &listeners {
            self.deliver(listener, value);
        }
    }

    fn deliver(&self, listener: &Listener<T>, value: &T) {
        if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
            error!(topic = %self.name, "Listener panicked");
        }
    }
}

/// Handle returned by every `subscribe`/`on_*` call.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    topic: String,
    remove: Box<dyn Fn() -> FeedResult<()> + Send + Sync>,
}

impl Subscription {
    /// Topic this subscription belongs to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove the listener. A second call fails with `NotSubscribed`.
    ///
    /// Once the session that owned the topic has ended this is a no-op.
    pub fn unsubscribe(&self) -> FeedResult<()> {
        (self.remove)()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Clone + Send + Sync + 'static>() -> (Listener<T>, Arc<Mutex<Vec<T>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (listener(move |v: &T| sink.lock().push(v.clone())), seen)
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_snapshot_synchronously() {
        let topic = Topic::immediate("address", None::<String>);
        let (l, seen) = recorder();

        topic.subscribe(l).unwrap();
        assert_eq!(*seen.lock(), vec![None]);

        topic.publish(Some("addr".to_string()));
        assert_eq!(seen.lock().last().cloned(), Some(Some("addr".to_string())));
    }

    #[tokio::test]
    async fn test_double_subscribe_and_unsubscribe_rejected() {
        let topic = Topic::immediate("chats", 0u32);
        let (l, _) = recorder();

        let sub = topic.subscribe(l.clone()).unwrap();
        assert!(matches!(
            topic.subscribe(l.clone()),
            Err(FeedError::AlreadySubscribed(name)) if name == "chats"
        ));

        sub.unsubscribe().unwrap();
        assert!(matches!(sub.unsubscribe(), Err(FeedError::NotSubscribed(_))));
        assert!(matches!(topic.unsubscribe(&l), Err(FeedError::NotSubscribed(_))));
    }

    #[tokio::test]
    async fn test_distinct_closures_are_distinct_listeners() {
        let topic = Topic::immediate("t", 0u32);
        let (a, _) = recorder();
        let (b, _) = recorder();
        topic.subscribe(a).unwrap();
        topic.subscribe(b).unwrap();
        assert_eq!(topic.listener_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_topic_coalesces_burst() {
        let topic = Topic::debounced("seed", 0u32, Duration::from_millis(500));
        let (l, seen) = recorder();
        topic.subscribe(l).unwrap();

        for i in 1..=5 {
            topic.publish(i);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(topic.current(), 5);
        assert_eq!(*seen.lock(), vec![0]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*seen.lock(), vec![0, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_topic_separate_windows_deliver_separately() {
        let topic = Topic::debounced("seed", 0u32, Duration::from_millis(500));
        let (l, seen) = recorder();
        topic.subscribe(l).unwrap();

        topic.publish(1);
        tokio::time::sleep(Duration::from_millis(700)).await;
        topic.publish(2);
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let topic = Topic::immediate("t", 0u32);
        topic
            .subscribe(listener(|v: &u32| {
                if *v > 0 {
                    panic!("listener failure");
                }
            }))
            .unwrap();
        let (l, seen) = recorder();
        topic.subscribe(l).unwrap();

        topic.publish(1);
        assert_eq!(*seen.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_attach_once() {
        let topic = Topic::immediate("t", ());
        assert!(topic.attach_once());
        assert!(!topic.attach_once());
    }

    #[tokio::test]
    async fn test_update_mutates_in_place() {
        let topic = Topic::immediate("t", vec![1u32]);
        topic.update(|v| v.push(2));
        assert_eq!(topic.current(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unsubscribe_after_topic_dropped_is_noop() {
        let topic = Topic::immediate("t", 0u32);
        let (l, _) = recorder();
        let sub = topic.subscribe(l).unwrap();
        drop(topic);
        assert!(sub.unsubscribe().is_ok());
    }
}
