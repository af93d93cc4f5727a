//! Progress and result notifications.
//!
//! The engine reports what it is doing as [`DfuEvent`]s. Each event carries a
//! free-text message for people and a structured form for programs. Observers
//! are injected when the [`Notifier`] is built and receive every event in
//! order; there is no acknowledgment or backpressure.

use std::sync::mpsc::Sender;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use super::device::DeviceIdentity;

/// DFU progress and result events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum DfuEvent {
    /// Engine attached to a device.
    Connected { device: DeviceIdentity },
    /// Probing read-out protection.
    CheckingProtection,
    /// Mass erase in progress.
    Erasing,
    /// Mass erase finished.
    EraseComplete { elapsed_ms: u64 },
    /// Read unprotect accepted; the device resets and must be reattached.
    ProtectionRemoved,
    /// Blocks written so far.
    Writing { written: usize, total: usize },
    /// Program finished.
    ProgramComplete { elapsed_ms: u64 },
    /// Blocks read back so far.
    Reading { read: usize, total: usize },
    /// Readback compared against the source image.
    VerifyComplete { matches: bool, elapsed_ms: u64 },
    /// Operation failed.
    Failed { code: String, message: String },
    /// Free-form log line.
    Log { message: String },
}

impl DfuEvent {
    /// Get a percentage estimate for this event, -1 when not applicable.
    pub fn percent(&self) -> f32 {
        match self {
            DfuEvent::Writing { written, total } | DfuEvent::Reading { read: written, total } => {
                if *total == 0 {
                    0.0
                } else {
                    (*written as f32 / *total as f32) * 100.0
                }
            }
            DfuEvent::EraseComplete { .. }
            | DfuEvent::ProgramComplete { .. }
            | DfuEvent::VerifyComplete { .. } => 100.0,
            DfuEvent::Erasing | DfuEvent::CheckingProtection => 0.0,
            DfuEvent::Connected { .. }
            | DfuEvent::ProtectionRemoved
            | DfuEvent::Failed { .. }
            | DfuEvent::Log { .. } => -1.0,
        }
    }

    /// Get a human-readable message for this event.
    pub fn message(&self) -> String {
        match self {
            DfuEvent::Connected { device } => format!("Connected to {}", device.display_label()),
            DfuEvent::CheckingProtection => "Checking read protection...".into(),
            DfuEvent::Erasing => "Mass erasing flash...".into(),
            DfuEvent::EraseComplete { elapsed_ms } => {
                format!("Mass erase completed in {} ms", elapsed_ms)
            }
            DfuEvent::ProtectionRemoved => {
                "Read protection removed. Device resets... wait until it re-enumerates".into()
            }
            DfuEvent::Writing { written, total } => {
                format!("Writing block {} of {}", written, total)
            }
            DfuEvent::ProgramComplete { elapsed_ms } => {
                format!("Programming completed in {} ms", elapsed_ms)
            }
            DfuEvent::Reading { read, total } => format!("Reading block {} of {}", read, total),
            DfuEvent::VerifyComplete { matches, .. } => {
                if *matches {
                    "Image written is OK".into()
                } else {
                    "Image written is NOT OK".into()
                }
            }
            DfuEvent::Failed { code, message } => format!("[{}] {}", code, message),
            DfuEvent::Log { message } => message.clone(),
        }
    }
}

/// Receives engine events.
#[cfg_attr(test, automock)]
pub trait DfuObserver: Send {
    fn on_event(&self, event: &DfuEvent);
}

impl<F> DfuObserver for F
where
    F: Fn(&DfuEvent) + Send,
{
    fn on_event(&self, event: &DfuEvent) {
        self(event)
    }
}

/// Forwards events to another thread. Send errors are ignored once the
/// receiver is gone.
pub struct ChannelObserver(pub Sender<DfuEvent>);

impl DfuObserver for ChannelObserver {
    fn on_event(&self, event: &DfuEvent) {
        let _ = self.0.send(event.clone());
    }
}

/// Ordered fan-out to a fixed set of observers.
#[derive(Default)]
pub struct Notifier {
    observers: Vec<Box<dyn DfuObserver>>,
}

impl Notifier {
    pub fn new(observers: Vec<Box<dyn DfuObserver>>) -> Self {
        Self { observers }
    }

    /// Notifier with no observers.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Deliver an event to every observer in registration order.
    pub fn notify(&self, event: DfuEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    /// Shorthand for a `Log` event.
    pub fn log(&self, message: impl Into<String>) {
        self.notify(DfuEvent::Log {
            message: message.into(),
        });
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    use mockall::predicate::eq;
    use mockall::Sequence;

    use super::*;

    #[test]
    fn test_event_percent() {
        assert_eq!(DfuEvent::Writing { written: 1, total: 4 }.percent(), 25.0);
        assert_eq!(DfuEvent::Reading { read: 0, total: 0 }.percent(), 0.0);
        assert_eq!(DfuEvent::EraseComplete { elapsed_ms: 3 }.percent(), 100.0);
        assert_eq!(DfuEvent::Log { message: "x".into() }.percent(), -1.0);
    }

    #[test]
    fn test_event_message() {
        assert!(DfuEvent::EraseComplete { elapsed_ms: 42 }
            .message()
            .contains("42 ms"));
        assert_eq!(
            DfuEvent::VerifyComplete {
                matches: false,
                elapsed_ms: 0
            }
            .message(),
            "Image written is NOT OK"
        );
        assert_eq!(
            DfuEvent::Failed {
                code: "DFU-020".into(),
                message: "locked".into()
            }
            .message(),
            "[DFU-020] locked"
        );
    }

    #[test]
    fn test_notify_reaches_every_observer_in_order() {
        let mut first = MockDfuObserver::new();
        let mut second = MockDfuObserver::new();
        let mut seq = Sequence::new();

        first
            .expect_on_event()
            .with(eq(DfuEvent::Erasing))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        second
            .expect_on_event()
            .with(eq(DfuEvent::Erasing))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let notifier = Notifier::new(vec![Box::new(first), Box::new(second)]);
        notifier.notify(DfuEvent::Erasing);
    }

    #[test]
    fn test_closure_observer_keeps_append_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let notifier = Notifier::new(vec![Box::new(move |event: &DfuEvent| {
            sink.lock().unwrap().push(event.message());
        })]);

        notifier.log("one");
        notifier.log("two");

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_channel_observer() {
        let (tx, rx) = mpsc::channel();
        let notifier = Notifier::new(vec![Box::new(ChannelObserver(tx))]);

        notifier.notify(DfuEvent::ProtectionRemoved);
        drop(notifier);

        let events: Vec<DfuEvent> = rx.iter().collect();
        assert_eq!(events, vec![DfuEvent::ProtectionRemoved]);
    }

    #[test]
    fn test_silent_notifier() {
        let notifier = Notifier::silent();
        assert_eq!(notifier.observer_count(), 0);
        notifier.notify(DfuEvent::Erasing);
    }

    #[test]
    fn test_event_serde_tagging() {
        let json = serde_json::to_string(&DfuEvent::Writing {
            written: 2,
            total: 3,
        })
        .unwrap();
        assert_eq!(json, r#"{"stage":"Writing","data":{"written":2,"total":3}}"#);
    }
}
