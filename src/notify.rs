use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

const CHANNEL_PREFIX: &str = "provider_";

/// LISTEN channel name for a provider, `provider_{ulid}`.
pub fn channel_name(provider_id: Ulid) -> String {
    format!("{CHANNEL_PREFIX}{provider_id}")
}

/// Provider id named by a LISTEN channel, if it has the expected shape.
pub fn parse_channel(channel: &str) -> Option<Ulid> {
    let raw = channel.strip_prefix(CHANNEL_PREFIX)?;
    Ulid::from_string(raw).ok()
}

/// NOTIFY payload: the event as a JSON object keyed by its kind.
pub fn payload(event: &Event) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

/// Per-provider broadcast of persisted events.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a provider's events. Creates the channel on first use.
    pub fn subscribe(&self, provider_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody ever subscribed to this provider.
    pub fn send(&self, provider_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&provider_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose receivers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_provider_events() {
        let hub = NotifyHub::new();
        let provider = Ulid::new();
        let mut rx = hub.subscribe(provider);

        let event = Event::AvailabilityWithdrawn {
            id: Ulid::new(),
            provider_id: provider,
        };
        hub.send(provider, &event);
        hub.send(Ulid::new(), &event);
        assert_eq!(rx.recv().await.unwrap(), event);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_names_round_trip() {
        let provider = Ulid::new();
        let channel = channel_name(provider);
        assert!(channel.starts_with("provider_"));
        assert_eq!(parse_channel(&channel), Some(provider));
        assert_eq!(parse_channel("resource_01ARZ3NDEKTSV4RRFFQ69G5FAV"), None);
        assert_eq!(parse_channel("provider_nope"), None);
    }

    #[test]
    fn payload_is_json_keyed_by_kind() {
        let slot_id = Ulid::new();
        let event = Event::HoldReleased {
            day: crate::model::DayKey::new(Ulid::new(), chrono::NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()),
            slot_id,
            reason: crate::model::ReleaseReason::Expired,
        };
        let json: serde_json::Value = serde_json::from_str(&payload(&event).unwrap()).unwrap();
        assert_eq!(json["HoldReleased"]["slot_id"], slot_id.to_string());
        assert_eq!(json["HoldReleased"]["reason"], "Expired");
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(Ulid::new(), &Event::SurchargeRuleDeleted { id: Ulid::new() });
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let kept = hub.subscribe(Ulid::new());
        drop(hub.subscribe(Ulid::new()));
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
        drop(kept);
    }
}
