use std::sync::Arc;

use serde_json::json;

use crate::{
    error::Result,
    session::{EventKind, TrackedSession},
    stats::JoinStats,
};

/// Consumer of finalized sessions. Implementations may examine every event
/// and must tolerate duplicate or out-of-order timestamps; the core makes no
/// ordering guarantee within a session.
pub trait JoinTarget: Send {
    /// Computes the opaque session-data blob for the output envelope.
    fn join(&self, session: &TrackedSession) -> Result<Vec<u8>>;
}

/// Join target that condenses a session into a JSON summary: event counts by
/// class plus the session's time bounds. Feeds the joined-query and
/// joined-item-visit counters.
pub struct SummaryJoinTarget {
    stats: Arc<JoinStats>,
}

impl SummaryJoinTarget {
    pub fn new(stats: Arc<JoinStats>) -> Self {
        Self { stats }
    }
}

impl JoinTarget for SummaryJoinTarget {
    fn join(&self, session: &TrackedSession) -> Result<Vec<u8>> {
        let num_queries = session
            .events
            .iter()
            .filter(|event| event.kind == EventKind::Query)
            .count() as u64;
        let num_item_visits = session
            .events
            .iter()
            .filter(|event| event.kind == EventKind::View)
            .count() as u64;

        self.stats.add_joined_queries(num_queries);
        self.stats.add_joined_item_visits(num_item_visits);

        let summary = json!({
            "session_id": session.uid,
            "customer": session.customer_key,
            "num_events": session.events.len(),
            "num_queries": num_queries,
            "num_item_visits": num_item_visits,
            "first_seen": session.first_seen_time(),
            "last_seen": session.last_seen_time(),
        });
        Ok(serde_json::to_vec(&summary)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn session_with_events(kinds: &[EventKind]) -> TrackedSession {
        let mut session = TrackedSession::new("u1");
        session.customer_key = Some("CUST1".into());
        for (n, &kind) in kinds.iter().enumerate() {
            session.insert_event(
                1_000_000_000 + n as u64,
                kind,
                format!("e{n}"),
                Vec::new(),
            );
        }
        session
    }

    #[test]
    fn summary_counts_queries_and_item_visits() {
        let stats = Arc::new(JoinStats::new());
        let target = SummaryJoinTarget::new(stats.clone());
        let session = session_with_events(&[
            EventKind::Query,
            EventKind::View,
            EventKind::View,
            EventKind::Click,
        ]);

        let blob = target.join(&session).unwrap();
        let summary: Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(summary["session_id"], "u1");
        assert_eq!(summary["customer"], "CUST1");
        assert_eq!(summary["num_events"], 4);
        assert_eq!(summary["num_queries"], 1);
        assert_eq!(summary["num_item_visits"], 2);

        assert_eq!(stats.joined_queries(), 1);
        assert_eq!(stats.joined_item_visits(), 2);
    }

    #[test]
    fn summary_tolerates_an_empty_session() {
        let stats = Arc::new(JoinStats::new());
        let target = SummaryJoinTarget::new(stats.clone());
        let session = session_with_events(&[]);

        let blob = target.join(&session).unwrap();
        let summary: Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(summary["num_events"], 0);
        assert_eq!(summary["first_seen"], Value::Null);
        assert_eq!(stats.joined_queries(), 0);
    }
}
