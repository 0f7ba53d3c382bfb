//! Bookkeeping for client-initiated operations that are still in flight.
//!
//! Receipts and channel bindings live behind a single mutex: together they
//! describe "what this client has asked the broker to do". Every method is a
//! short critical section and none of them touches I/O.

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

pub type ReceiptId = u64;
pub type SubscriptionId = u64;

/// What a receipt confirms once the broker sends it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    Join { destination: String },
    Disconnect,
}

impl fmt::Display for PendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingAction::Join { destination } => write!(f, "Joined channel: {destination}"),
            PendingAction::Disconnect => f.write_str("DISCONNECT"),
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    next_receipt: ReceiptId,
    next_subscription: SubscriptionId,
    receipts: HashMap<ReceiptId, PendingAction>,
    bindings: HashMap<String, SubscriptionId>,
}

impl Pending {
    fn issue_receipt(&mut self, action: PendingAction) -> ReceiptId {
        let id = self.next_receipt;
        self.next_receipt += 1;
        self.receipts.insert(id, action);
        id
    }
}

#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: Mutex<Pending>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // The maps stay consistent even if a holder panicked mid-section.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a receipt and a subscription id for joining `destination`.
    ///
    /// The channel binding is stored right away, before the broker confirms.
    /// Joining a channel again rebinds it to the fresh subscription id.
    pub fn record_join(&self, destination: &str) -> (ReceiptId, SubscriptionId) {
        let mut pending = self.lock();
        let subscription = pending.next_subscription;
        pending.next_subscription += 1;
        let receipt = pending.issue_receipt(PendingAction::Join {
            destination: destination.to_string(),
        });
        pending
            .bindings
            .insert(destination.to_string(), subscription);
        (receipt, subscription)
    }

    pub fn record_disconnect(&self) -> ReceiptId {
        self.lock().issue_receipt(PendingAction::Disconnect)
    }

    /// Removes and returns the action for `receipt`.
    ///
    /// Unknown or already-resolved ids yield `None`.
    pub fn resolve_receipt(&self, receipt: ReceiptId) -> Option<PendingAction> {
        self.lock().receipts.remove(&receipt)
    }

    pub fn binding_for(&self, destination: &str) -> Option<SubscriptionId> {
        self.lock().bindings.get(destination).copied()
    }

    pub fn unbind(&self, destination: &str) -> Option<SubscriptionId> {
        self.lock().bindings.remove(destination)
    }

    pub fn outstanding_receipts(&self) -> usize {
        self.lock().receipts.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn join_records_receipt_and_binding() {
        let registry = CorrelationRegistry::new();

        let (receipt, subscription) = registry.record_join("/topic/news");

        assert_eq!(registry.binding_for("/topic/news"), Some(subscription));
        assert_eq!(
            registry.resolve_receipt(receipt),
            Some(PendingAction::Join {
                destination: "/topic/news".into()
            })
        );
    }

    #[test]
    fn receipts_resolve_at_most_once() {
        let registry = CorrelationRegistry::new();
        let receipt = registry.record_disconnect();

        assert_eq!(
            registry.resolve_receipt(receipt),
            Some(PendingAction::Disconnect)
        );
        assert_eq!(registry.resolve_receipt(receipt), None);
        assert_eq!(registry.resolve_receipt(receipt + 100), None);
        assert_eq!(registry.outstanding_receipts(), 0);
    }

    #[test]
    fn receipt_and_subscription_counters_are_independent() {
        let registry = CorrelationRegistry::new();

        let (r0, s0) = registry.record_join("a");
        let r1 = registry.record_disconnect();
        let (r2, s1) = registry.record_join("b");

        assert_eq!((r0, r1, r2), (0, 1, 2));
        assert_eq!((s0, s1), (0, 1));
    }

    #[test]
    fn unbind_removes_channel() {
        let registry = CorrelationRegistry::new();
        let (_, subscription) = registry.record_join("chat");

        assert_eq!(registry.unbind("chat"), Some(subscription));
        assert_eq!(registry.binding_for("chat"), None);
        assert_eq!(registry.unbind("chat"), None);
    }

    #[test]
    fn rejoin_rebinds_to_new_subscription() {
        let registry = CorrelationRegistry::new();
        let (_, first) = registry.record_join("chat");
        let (_, second) = registry.record_join("chat");

        assert_ne!(first, second);
        assert_eq!(registry.binding_for("chat"), Some(second));
    }

    #[test]
    fn concurrent_callers_never_share_ids() {
        let registry = Arc::new(CorrelationRegistry::new());

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..50)
                        .map(|n| {
                            if n % 5 == 0 {
                                (registry.record_disconnect(), None)
                            } else {
                                let (receipt, subscription) =
                                    registry.record_join(&format!("{worker}-{n}"));
                                (receipt, Some(subscription))
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut receipts = Vec::new();
        let mut subscriptions = Vec::new();
        for worker in workers {
            for (receipt, subscription) in worker.join().expect("worker panicked") {
                receipts.push(receipt);
                subscriptions.extend(subscription);
            }
        }

        let total_receipts = receipts.len();
        let total_subscriptions = subscriptions.len();
        receipts.sort_unstable();
        receipts.dedup();
        subscriptions.sort_unstable();
        subscriptions.dedup();

        assert_eq!(receipts.len(), total_receipts);
        assert_eq!(subscriptions.len(), total_subscriptions);
        assert_eq!(registry.outstanding_receipts(), total_receipts);
    }
}
