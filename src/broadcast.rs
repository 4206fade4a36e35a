use crate::types::{MatchDoc, MatchKind};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

/// Wire envelope sent to every overlay subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub data: Value,
    pub timestamp: String,
}

/// Fire-and-forget fan-out. Subscribers that are gone or lagging miss
/// events and are expected to pull `/state` again.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        BroadcastPublisher { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: &str, data: Value) -> BroadcastMessage {
        let message = BroadcastMessage {
            event: event.to_string(),
            data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        match self.sender.send(message.clone()) {
            Ok(count) => debug!("broadcast {event} to {count} subscribers"),
            Err(_) => debug!("broadcast {event} with no subscribers"),
        }
        message
    }

    /// Publish `<prefix>.<name>` carrying the full match plus event detail.
    pub fn publish_match(&self, kind: MatchKind, name: &str, doc: Option<&MatchDoc>, detail: Value) -> BroadcastMessage {
        let event = format!("{}.{name}", kind.event_prefix());
        self.publish(&event, match_payload(doc, detail))
    }
}

/// `{ "match": doc, ...detail }`. Non-object detail lands under `detail`.
pub fn match_payload(doc: Option<&MatchDoc>, detail: Value) -> Value {
    let mut payload = Map::new();
    payload.insert("match".to_string(), json!(doc));
    match detail {
        Value::Object(fields) => {
            for (key, value) in fields {
                if key != "match" {
                    payload.insert(key, value);
                }
            }
        }
        Value::Null => {}
        other => {
            payload.insert("detail".to_string(), other);
        }
    }
    Value::Object(payload)
}

pub fn snapshot_envelope(kind: MatchKind, doc: Option<&MatchDoc>) -> Value {
    json!({
        "event": format!("{}.snapshot", kind.event_prefix()),
        "data": { "match": doc },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::build_match;
    use crate::draft::tests::{make_charts, make_meta};

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let publisher = BroadcastPublisher::new(4);
        let message = publisher.publish("match.start", json!({}));
        assert_eq!(message.event, "match.start");
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_every_subscriber_gets_the_event() {
        let publisher = BroadcastPublisher::new(4);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();
        let doc = build_match(3, make_meta(3, false), ["Alice", "Bob"], &make_charts(3));

        publisher.publish_match(MatchKind::Friendly, "ban", Some(&doc), json!({ "chart": "Chart 1" }));

        for rx in [&mut a, &mut b] {
            let message = rx.try_recv().unwrap();
            assert_eq!(message.event, "friendly.ban");
            assert_eq!(message.data["chart"], "Chart 1");
            assert_eq!(message.data["match"]["id"], 3);
        }
    }

    #[test]
    fn test_late_subscriber_sees_only_new_events() {
        let publisher = BroadcastPublisher::new(4);
        publisher.publish("match.start", Value::Null);
        let mut rx = publisher.subscribe();
        assert!(rx.try_recv().is_err());
        publisher.publish("match.ban", Value::Null);
        assert_eq!(rx.try_recv().unwrap().event, "match.ban");
    }

    #[test]
    fn test_snapshot_envelope_with_no_match() {
        let envelope = snapshot_envelope(MatchKind::Ranked, None);
        assert_eq!(envelope["event"], "match.snapshot");
        assert!(envelope["data"]["match"].is_null());
    }

    #[test]
    fn test_payload_keeps_match_key_authoritative() {
        let payload = match_payload(None, json!({ "match": 5, "winner": 1 }));
        assert!(payload["match"].is_null());
        assert_eq!(payload["winner"], 1);
    }
}
