//! Typed publish/subscribe channel owned by a single emitter.

use tokio::sync::mpsc;

/// Fan-out of events to any number of subscribers.
///
/// Every subscriber gets its own unbounded receiver, so emitting never
/// blocks and events arrive in emission order. Subscribers whose receiver
/// was dropped are pruned on the next emit. [`close`](Self::close) detaches
/// everyone at once; receivers then drain what was already sent and report
/// disconnection.
pub struct EventBus<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<E: Clone> EventBus<E> {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber.
    pub fn emit(&mut self, event: E) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Detaches all subscribers.
    pub fn close(&mut self) {
        self.subscribers.clear();
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[test]
    fn delivers_in_order_to_all_subscribers() {
        let mut bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(1);
        bus.emit(2);

        assert_eq!(a.try_recv().unwrap(), 1);
        assert_eq!(a.try_recv().unwrap(), 2);
        assert_eq!(b.try_recv().unwrap(), 1);
        assert_eq!(b.try_recv().unwrap(), 2);
    }

    #[test]
    fn prunes_dropped_subscribers() {
        let mut bus = EventBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        drop(a);

        bus.emit("x");
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn close_disconnects_after_drain() {
        let mut bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(7u8);
        bus.close();

        assert_eq!(rx.try_recv().unwrap(), 7);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));

        // Nothing reaches a closed bus.
        bus.emit(8);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
