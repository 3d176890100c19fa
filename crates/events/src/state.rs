//! Rebuilding state from a stream's events.

use crate::envelope::EventEnvelope;

/// State that can be reconstructed by folding a stream's events in version order.
///
/// `apply` must be pure: same events, same state.
pub trait StreamState: Default {
    fn apply(&mut self, event: &EventEnvelope);
}

/// Fold events into a fresh `S::default()`.
pub fn fold<'a, S, I>(events: I) -> S
where
    S: StreamState,
    I: IntoIterator<Item = &'a EventEnvelope>,
{
    let mut state = S::default();
    for event in events {
        state.apply(event);
    }
    state
}

/// Fold with an ad-hoc closure instead of a [`StreamState`] impl.
pub fn fold_with<'a, S, I, F>(init: S, events: I, mut apply: F) -> S
where
    I: IntoIterator<Item = &'a EventEnvelope>,
    F: FnMut(&mut S, &EventEnvelope),
{
    let mut state = init;
    for event in events {
        apply(&mut state, event);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use keelson_core::{EventId, StreamId, TenantId};
    use serde::{Deserialize, Serialize};

    use crate::registry::EventTypeRegistry;
    use crate::record::StoredEvent;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Withdrawn {
        amount: i64,
    }

    #[derive(Default)]
    struct Balance {
        total: i64,
        applied: u64,
    }

    impl StreamState for Balance {
        fn apply(&mut self, event: &EventEnvelope) {
            if let Some(d) = event.payload::<Deposited>() {
                self.total += d.amount;
            } else if let Some(w) = event.payload::<Withdrawn>() {
                self.total -= w.amount;
            }
            self.applied = event.version();
        }
    }

    fn envelopes() -> Vec<EventEnvelope> {
        let registry = EventTypeRegistry::builder()
            .register::<Deposited>()
            .and_then(|b| b.register::<Withdrawn>())
            .unwrap()
            .build();
        let stream_id = StreamId::new();
        let tenant_id = TenantId::new();
        [("deposited", 10), ("withdrawn", 3), ("deposited", 5)]
            .into_iter()
            .enumerate()
            .map(|(i, (name, amount))| StoredEvent {
                event_id: EventId::new(),
                tenant_id,
                stream_type: "account".to_string(),
                stream_id,
                version: i as u64 + 1,
                sequence: i as u64 + 1,
                type_name: Some(name.to_string()),
                type_descriptor: String::new(),
                payload: serde_json::json!({ "amount": amount }),
                timestamp: Utc::now(),
            })
            .map(|record| registry.resolve(&record).unwrap())
            .collect()
    }

    #[test]
    fn fold_replays_in_order_from_default() {
        let events = envelopes();
        let balance: Balance = fold(&events);
        assert_eq!(balance.total, 12);
        assert_eq!(balance.applied, 3);
    }

    #[test]
    fn fold_with_closure() {
        let events = envelopes();
        let count = fold_with(0usize, &events, |n, _| *n += 1);
        assert_eq!(count, 3);
    }
}
