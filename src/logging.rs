//! `tracing-subscriber` layer that forwards events over a channel.
//!
//! Hosts that already run a log shipper on another thread attach [`channel_layer`] to their
//! subscriber and drain the receiver; tests use it to assert on the structured
//! `drift_corrected` events emitted by the capacity ledger.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// One event as seen by [`ChannelLayer`]
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub target: String,
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// Field value as recorded (debug formatting for non-primitive values).
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

pub struct ChannelLayer {
    sender: Sender<CapturedEvent>,
    min_level: Level,
}

impl ChannelLayer {
    /// Only forward events at `level` or more severe.
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

/// A layer plus the receiving end of its channel.
pub fn channel_layer() -> (ChannelLayer, Receiver<CapturedEvent>) {
    let (sender, receiver) = unbounded();
    (
        ChannelLayer {
            sender,
            min_level: Level::TRACE,
        },
        receiver,
    )
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for ChannelLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level ordering: TRACE > DEBUG > ... > ERROR
        if *metadata.level() > self.min_level {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        // a dropped receiver just means nobody is listening any more
        let _ = self.sender.send(CapturedEvent {
            target: metadata.target().to_string(),
            level: *metadata.level(),
            message: collector.message,
            fields: collector.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    #[test]
    fn test_forwards_fields_and_message() {
        let (layer, events) = channel_layer();
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "linkledger::test", parent_id = 7i64, "hello");
        });

        let event = events.try_recv().expect("one event");
        assert_eq!(event.target, "linkledger::test");
        assert_eq!(event.level, Level::INFO);
        assert_eq!(event.message, "hello");
        assert_eq!(event.field("parent_id"), Some("7"));
    }

    #[test]
    fn test_min_level_filters() {
        let (layer, events) = channel_layer();
        let subscriber = Registry::default().with(layer.with_min_level(Level::WARN));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("dropped");
            tracing::warn!("kept");
        });

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, "kept");
    }
}
