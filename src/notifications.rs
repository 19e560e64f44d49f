//! Best-effort push notifications
//!
//! The engine publishes `GameEvent`s through `NotificationSink`, which has no
//! return value on purpose: a slow or dead client can never fail or stall a
//! settlement. `ChannelNotifier` fans broadcast events out on a tokio
//! broadcast channel and delivers per-user events to registered connections
//! through bounded mpsc queues with `try_send`.

use crate::config::NotificationConfig;
use crate::games::types::{Amount, Outcome, Phase, RoundId, UserId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

/// Events exposed to the transport layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    /// Emitted on every clock tick
    TimerUpdate {
        round_id: RoundId,
        countdown: u32,
        phase: Phase,
    },

    /// The drawn outcome of a settled round
    NewOutcome { outcome: Outcome },

    /// A bettor's balance after settlement
    BalanceUpdate { user_id: UserId, balance: Amount },

    RoundSettled {
        round_id: RoundId,
        bets_settled: usize,
        total_payout: Amount,
    },
}

/// Fire-and-forget delivery capability
pub trait NotificationSink: Send + Sync {
    fn send_to_user(&self, user_id: &str, event: GameEvent);

    fn broadcast(&self, event: GameEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierStats {
    pub connections: usize,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct ChannelNotifier {
    tx: broadcast::Sender<GameEvent>,
    connections: DashMap<UserId, mpsc::Sender<GameEvent>>,
    per_user_capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelNotifier {
    pub fn new(config: &NotificationConfig) -> Self {
        let (tx, _rx) = broadcast::channel(config.broadcast_capacity);
        Self {
            tx,
            connections: DashMap::new(),
            per_user_capacity: config.per_user_capacity,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Receive every broadcast event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.tx.subscribe()
    }

    /// Register a live connection for `user_id`, replacing any previous one
    pub fn connect(&self, user_id: &str) -> mpsc::Receiver<GameEvent> {
        let (tx, rx) = mpsc::channel(self.per_user_capacity);
        self.connections.insert(user_id.to_string(), tx);
        debug!("User {} connected ({} live)", user_id, self.connections.len());
        rx
    }

    pub fn disconnect(&self, user_id: &str) -> bool {
        self.connections.remove(user_id).is_some()
    }

    /// Drop the registration of `user_id` only if its receiver is gone.
    /// A connection registered again since the failed send is kept.
    fn unregister_closed(&self, user_id: &str) -> bool {
        self.connections
            .remove_if(user_id, |_, sender| sender.is_closed())
            .is_some()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            connections: self.connections.len(),
            delivered: self.delivered.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }
}

impl NotificationSink for ChannelNotifier {
    fn send_to_user(&self, user_id: &str, event: GameEvent) {
        // Resolve the sender first; the map entry must not be borrowed while removing it
        let result = match self.connections.get(user_id) {
            Some(sender) => sender.try_send(event),
            None => {
                trace!("No live connection for {}; event skipped", user_id);
                return;
            }
        };

        match result {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                debug!("Connection queue for {} is full; event dropped", user_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                if self.unregister_closed(user_id) {
                    debug!("Connection for {} closed; unregistered", user_id);
                }
            }
        }
    }

    fn broadcast(&self, event: GameEvent) {
        // Err only means nobody is subscribed
        if let Ok(receivers) = self.tx.send(event) {
            self.delivered.fetch_add(receivers as u64, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(per_user_capacity: usize) -> ChannelNotifier {
        ChannelNotifier::new(&NotificationConfig {
            broadcast_capacity: 16,
            per_user_capacity,
        })
    }

    #[tokio::test]
    async fn test_user_delivery() {
        let notifier = notifier(4);
        let mut rx = notifier.connect("alice");

        notifier.send_to_user(
            "alice",
            GameEvent::BalanceUpdate {
                user_id: "alice".to_string(),
                balance: 2_546,
            },
        );

        let event = rx.recv().await.expect("event");
        assert_eq!(
            event,
            GameEvent::BalanceUpdate {
                user_id: "alice".to_string(),
                balance: 2_546
            }
        );
        assert_eq!(notifier.stats().delivered, 1);
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let notifier = notifier(1);
        let _rx = notifier.connect("bob");

        for balance in 0..3 {
            notifier.send_to_user(
                "bob",
                GameEvent::BalanceUpdate {
                    user_id: "bob".to_string(),
                    balance,
                },
            );
        }

        let stats = notifier.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn test_closed_connection_is_unregistered() {
        let notifier = notifier(4);
        let rx = notifier.connect("carol");
        drop(rx);

        notifier.send_to_user(
            "carol",
            GameEvent::BalanceUpdate {
                user_id: "carol".to_string(),
                balance: 1,
            },
        );
        assert!(!notifier.is_connected("carol"));
    }

    #[tokio::test]
    async fn test_reconnected_user_is_not_unregistered() {
        let notifier = notifier(4);
        let stale = notifier.connect("carol");
        drop(stale);
        let mut rx = notifier.connect("carol");

        // A send that saw the stale sender fail must not evict the new one
        assert!(!notifier.unregister_closed("carol"));
        assert!(notifier.is_connected("carol"));

        notifier.send_to_user(
            "carol",
            GameEvent::BalanceUpdate {
                user_id: "carol".to_string(),
                balance: 7,
            },
        );
        assert!(matches!(
            rx.recv().await,
            Some(GameEvent::BalanceUpdate { balance: 7, .. })
        ));

        drop(rx);
        assert!(notifier.unregister_closed("carol"));
        assert!(!notifier.is_connected("carol"));
    }

    #[test]
    fn test_missing_connection_is_silent() {
        let notifier = notifier(4);
        notifier.send_to_user(
            "ghost",
            GameEvent::BalanceUpdate {
                user_id: "ghost".to_string(),
                balance: 1,
            },
        );
        notifier.broadcast(GameEvent::TimerUpdate {
            round_id: 1,
            countdown: 29,
            phase: Phase::Open,
        });
        assert_eq!(notifier.stats().delivered, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let notifier = notifier(4);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.broadcast(GameEvent::TimerUpdate {
            round_id: 2,
            countdown: 10,
            phase: Phase::Open,
        });

        assert!(matches!(a.recv().await, Ok(GameEvent::TimerUpdate { countdown: 10, .. })));
        assert!(matches!(b.recv().await, Ok(GameEvent::TimerUpdate { countdown: 10, .. })));
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(GameEvent::TimerUpdate {
            round_id: 4,
            countdown: 0,
            phase: Phase::Locked,
        })
        .unwrap();

        assert_eq!(json["type"], "timer_update");
        assert_eq!(json["phase"], "locked");
    }
}
