//! Typed notifications and the fan-out bus that carries them.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use ledgerd_chainstate::headerchain::ReorgState;

use crate::zeroconf::{ZcPacket, ZcPurgePacket};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshScope {
    FilterChanged,
    AndRescan,
    AndRescanAndWallet,
}

#[derive(Clone, Debug)]
pub struct NewBlockData {
    pub reorg_state: ReorgState,
    pub zc_purge: Option<ZcPurgePacket>,
}

#[derive(Clone, Debug)]
pub enum Notification {
    /// Cold start: force a full repage over `(0, top)`.
    Init,
    /// A block arrived; ignored when it did not produce a new top.
    NewBlock(NewBlockData),
    /// Mempool delta.
    Zc(ZcPacket),
    /// Forced repage, optionally scoped to one wallet.
    Refresh {
        scope: RefreshScope,
        wallet_id: Option<String>,
        zc: Option<ZcPacket>,
    },
}

/// Single-producer/multi-consumer queue: FIFO per producer, at-most-once
/// per consumer. A consumer that misses a `NewBlock` recovers on the next
/// one, whose range covers the gap.
#[derive(Default)]
pub struct NotificationBus {
    subscribers: Mutex<Vec<Sender<Arc<Notification>>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Arc<Notification>> {
        let (sender, receiver) = unbounded();
        self.subscribers
            .lock()
            .expect("bus lock")
            .push(sender);
        receiver
    }

    pub fn push(&self, notification: Notification) {
        let notification = Arc::new(notification);
        let mut subscribers = self.subscribers.lock().expect("bus lock");
        subscribers.retain(|sender| sender.send(Arc::clone(&notification)).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_reaches_every_subscriber_in_order() {
        let bus = NotificationBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.push(Notification::Init);
        bus.push(Notification::Refresh {
            scope: RefreshScope::FilterChanged,
            wallet_id: None,
            zc: None,
        });

        for receiver in [first, second] {
            assert!(matches!(*receiver.recv().expect("recv"), Notification::Init));
            assert!(matches!(
                *receiver.recv().expect("recv"),
                Notification::Refresh { .. }
            ));
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = NotificationBus::new();
        let receiver = bus.subscribe();
        drop(receiver);
        bus.push(Notification::Init);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
