//! In-process publish/subscribe for observable documents.
//!
//! [`Observable`] holds the last published value of one document (registry,
//! a directory config, app settings) and hands it to every subscriber, first
//! on subscription and then after every publication. It is a thin layer over
//! [`tokio::sync::watch`]: publishing never blocks, and a subscriber that falls
//! behind only ever sees the newest value.
//!
//! [`EventBus`] carries typed mutation events (see [`StoreEvent`]) to
//! components that react to changes rather than read values, such as the
//! scheduler loop. It wraps [`tokio::sync::broadcast`].

use std::path::PathBuf;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::trace;

const EVENT_BUS_CAPACITY: usize = 256;

/// Named, cached value broadcast to subscribers on every change.
#[derive(Debug)]
pub struct Observable<T> {
    name: String,
    tx: watch::Sender<T>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the cached value and wake every subscriber.
    pub fn publish(&self, value: T) {
        trace!(document = %self.name, subscribers = self.tx.receiver_count(), "Publishing document");
        self.tx.send_replace(value);
    }

    /// Receiver whose `borrow()` yields the current value right away.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Run `callback` with the current value now and again after every change.
    ///
    /// The callback runs on its own task, so it cannot stall publication. It
    /// must not publish to this same observable.
    pub fn on_change<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(&T) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            callback(&rx.borrow_and_update());
            while rx.changed().await.is_ok() {
                callback(&rx.borrow_and_update());
            }
        });
        Subscription { handle }
    }
}

/// Handle for a callback registered with [`Observable::on_change`].
/// Dropping it detaches the callback.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Committed mutation in the config store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    RegistryChanged,
    DirectoryConfigChanged(PathBuf),
    AppSettingsChanged,
}

/// Fire-and-forget broadcast of typed events.
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Events sent with no receivers are dropped.
    pub fn publish(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Receives only events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_get_returns_latest_publication() {
        let observable = Observable::new("counter", 1u32);
        assert_eq!(observable.get(), 1);

        observable.publish(2);
        observable.publish(3);
        assert_eq!(observable.get(), 3);
        assert_eq!(observable.name(), "counter");
    }

    #[tokio::test]
    async fn test_subscriber_sees_current_value_immediately() {
        let observable = Observable::new("registry", vec!["docs".to_string()]);
        let rx = observable.subscribe();

        assert_eq!(*rx.borrow(), vec!["docs".to_string()]);
    }

    #[tokio::test]
    async fn test_subscriber_notified_on_publish() {
        let observable = Observable::new("flag", false);
        let mut rx = observable.subscribe();

        observable.publish(true);

        tokio::time::timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_on_change_receives_initial_and_updates() {
        let observable = Observable::new("value", 0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let subscription = observable.on_change(move |v| sink.lock().unwrap().push(*v));

        tokio::time::sleep(Duration::from_millis(20)).await;
        observable.publish(7);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 7]);

        subscription.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        observable.publish(9);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 7]);
    }

    #[tokio::test]
    async fn test_event_bus_delivers_to_all_receivers() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(StoreEvent::RegistryChanged);

        assert_eq!(first.recv().await.unwrap(), StoreEvent::RegistryChanged);
        assert_eq!(second.recv().await.unwrap(), StoreEvent::RegistryChanged);
    }

    #[test]
    fn test_event_bus_publish_without_receivers() {
        let bus: EventBus<StoreEvent> = EventBus::new(0);
        bus.publish(StoreEvent::AppSettingsChanged);
    }
}
