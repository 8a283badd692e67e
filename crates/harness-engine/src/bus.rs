//! The Event Bus: an in-process topic-based broadcaster.
//!
//! Grounded directly on `sdlc-server::state::{AppState, RunHandle, RunEvent}`
//! — one `broadcast::Sender` per subject, a pre-subscribed receiver so the
//! first subscriber never loses the gap between creation and subscription —
//! generalized from one channel per run to a `HashMap<Topic, Sender>` keyed
//! by topic strings (`run.<id>.log`, `run.<id>.state`,
//! `project.<id>.feature`, `session.<id>.redesign`), with a bounded per-topic
//! tail buffer so late subscribers can replay recent history instead of
//! only getting the pre-subscribed receiver's luck-of-the-draw backlog.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_TAIL_LEN: usize = 200;

/// An event published onto the bus. `payload` is a tool- or
/// supervisor-defined JSON blob; the bus itself is payload-agnostic.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Event {
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}

/// Topic name helpers for the bus's four topic families.
pub mod topic {
    use uuid::Uuid;

    pub fn run_log(run_id: Uuid) -> String {
        format!("run.{run_id}.log")
    }
    pub fn run_state(run_id: Uuid) -> String {
        format!("run.{run_id}.state")
    }
    pub fn project_feature(project_id: Uuid) -> String {
        format!("project.{project_id}.feature")
    }
    pub fn session_redesign(session_id: Uuid) -> String {
        format!("session.{session_id}.redesign")
    }
}

struct Subject {
    tx: broadcast::Sender<Event>,
    tail: VecDeque<Event>,
}

/// In-process topic broadcaster. One `broadcast::Sender` is created lazily
/// per topic on first publish or subscribe. Per-topic order is preserved;
/// cross-topic ordering is unspecified.
#[derive(Clone)]
pub struct EventBus {
    subjects: Arc<RwLock<HashMap<String, Subject>>>,
    tail_len: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LEN)
    }
}

impl EventBus {
    pub fn new(tail_len: usize) -> Self {
        EventBus {
            subjects: Arc::new(RwLock::new(HashMap::new())),
            tail_len,
        }
    }

    /// Publish `event` onto its topic. A topic with no subscribers still
    /// records the event in its tail buffer so a subscriber arriving a
    /// moment later can catch up.
    pub async fn publish(&self, event: Event) {
        let mut subjects = self.subjects.write().await;
        let subject = subjects
            .entry(event.topic.clone())
            .or_insert_with(|| Subject {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                tail: VecDeque::new(),
            });

        subject.tail.push_back(event.clone());
        while subject.tail.len() > self.tail_len {
            subject.tail.pop_front();
        }
        // A send with no active receivers is not an error — the tail
        // buffer is the record of truth for late subscribers.
        let _ = subject.tx.send(event);
    }

    /// Subscribe to `topic`, returning a live receiver plus a replay of the
    /// bounded tail buffer recorded so far (oldest first). Replaying the
    /// tail and then reading from the receiver may repeat events published
    /// in the narrow window between the two reads — callers that care about
    /// exactly-once delivery should dedupe on an id in the payload.
    pub async fn subscribe(&self, topic: &str) -> (broadcast::Receiver<Event>, Vec<Event>) {
        let mut subjects = self.subjects.write().await;
        let subject = subjects.entry(topic.to_string()).or_insert_with(|| Subject {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            tail: VecDeque::new(),
        });
        (subject.tx.subscribe(), subject.tail.iter().cloned().collect())
    }

    pub async fn publish_run_log(&self, run_id: Uuid, level: &str, message: &str) {
        self.publish(Event::new(
            topic::run_log(run_id),
            serde_json::json!({ "level": level, "message": message }),
        ))
        .await;
    }

    pub async fn publish_run_state(&self, run_id: Uuid, state: &str) {
        self.publish(Event::new(topic::run_state(run_id), serde_json::json!({ "state": state })))
            .await;
    }

    pub async fn publish_feature_event(&self, project_id: Uuid, feature_id: Uuid, status: &str) {
        self.publish(Event::new(
            topic::project_feature(project_id),
            serde_json::json!({ "feature_id": feature_id, "status": status }),
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::default();
        let run_id = Uuid::new_v4();
        let (mut rx, tail) = bus.subscribe(&topic::run_log(run_id)).await;
        assert!(tail.is_empty());

        bus.publish_run_log(run_id, "info", "first").await;
        bus.publish_run_log(run_id, "info", "second").await;

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e1.payload["message"], "first");
        assert_eq!(e2.payload["message"], "second");
    }

    #[tokio::test]
    async fn late_subscriber_replays_tail_buffer() {
        let bus = EventBus::default();
        let run_id = Uuid::new_v4();
        bus.publish_run_log(run_id, "info", "before subscribe").await;

        let (_rx, tail) = bus.subscribe(&topic::run_log(run_id)).await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload["message"], "before subscribe");
    }

    #[tokio::test]
    async fn tail_buffer_is_bounded() {
        let bus = EventBus::new(3);
        let run_id = Uuid::new_v4();
        for i in 0..10 {
            bus.publish_run_log(run_id, "info", &format!("line {i}")).await;
        }
        let (_rx, tail) = bus.subscribe(&topic::run_log(run_id)).await;
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].payload["message"], "line 7");
        assert_eq!(tail[2].payload["message"], "line 9");
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::default();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();
        let (mut rx_a, _) = bus.subscribe(&topic::run_log(run_a)).await;
        let (mut rx_b, _) = bus.subscribe(&topic::run_log(run_b)).await;

        bus.publish_run_log(run_a, "info", "for a").await;

        let a_event = rx_a.recv().await.unwrap();
        assert_eq!(a_event.payload["message"], "for a");
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), rx_b.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::default();
        let project_id = Uuid::new_v4();
        bus.publish_feature_event(project_id, Uuid::new_v4(), "done").await;
        // No panic, and the tail buffer recorded it for a later subscriber.
        let (_rx, tail) = bus.subscribe(&topic::project_feature(project_id)).await;
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_rather_than_stalling_publisher() {
        let bus = EventBus::new(5);
        let run_id = Uuid::new_v4();
        let (mut rx, _) = bus.subscribe(&topic::run_log(run_id)).await;

        for i in 0..(CHANNEL_CAPACITY + 50) {
            bus.publish_run_log(run_id, "info", &format!("{i}")).await;
        }

        // The receiver lags rather than blocking any publish call above.
        match rx.try_recv() {
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(e) => panic!("unexpected recv error: {e}"),
        }
    }
}
