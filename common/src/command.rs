use thiserror::Error;

use crate::{
    connectivity::{BrokerError, Publisher},
    identity::DeviceId,
    relay::{IndexError, RelayBank, RelayDriver},
    topics::TOPIC_RELAY_STATUS,
    types::{ControlMessage, InboundCommand, RelayAction, RelayStatusPayload},
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("invalid control message: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied {
        relay: usize,
        action: RelayAction,
        state: bool,
    },
    Rejected {
        action: RelayAction,
        error: IndexError,
    },
    UnknownAction {
        relay: i64,
    },
    IgnoredForeignDevice {
        target: String,
    },
    Dropped(ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEcho {
    NotSent,
    Published,
    Failed(BrokerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub outcome: CommandOutcome,
    pub status: StatusEcho,
}

/// Decodes control-channel payloads and applies the ones addressed to this
/// device. Every message addressed here gets a relay-status echo, including
/// ones naming an unknown action or a relay that does not exist.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    device_id: DeviceId,
    max_payload_bytes: usize,
}

impl CommandProcessor {
    pub fn new(device_id: DeviceId, max_payload_bytes: usize) -> Self {
        Self {
            device_id,
            max_payload_bytes,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn parse(&self, raw: &[u8]) -> Result<InboundCommand, ParseError> {
        if raw.len() > self.max_payload_bytes {
            return Err(ParseError::TooLarge {
                size: raw.len(),
                limit: self.max_payload_bytes,
            });
        }
        let text = std::str::from_utf8(raw).map_err(|_| ParseError::NotUtf8)?;
        let message: ControlMessage =
            serde_json::from_str(text).map_err(|err| ParseError::Json(err.to_string()))?;
        Ok(message.into())
    }

    pub fn handle<D: RelayDriver>(
        &self,
        raw: &[u8],
        relays: &mut RelayBank<D>,
        publisher: &mut impl Publisher,
        now_ms: u64,
    ) -> CommandReport {
        let command = match self.parse(raw) {
            Ok(command) => command,
            Err(err) => {
                return CommandReport {
                    outcome: CommandOutcome::Dropped(err),
                    status: StatusEcho::NotSent,
                }
            }
        };

        if self.device_id != *command.target_device_id {
            return CommandReport {
                outcome: CommandOutcome::IgnoredForeignDevice {
                    target: command.target_device_id,
                },
                status: StatusEcho::NotSent,
            };
        }

        let outcome = apply(&command, relays, now_ms);
        let status = self.publish_relay_status(command.relay_index, relays, publisher, now_ms);

        CommandReport { outcome, status }
    }

    /// Status for `relay` as currently held by the bank. Indexes outside the
    /// bank read as off with no timer.
    pub fn relay_status<D: RelayDriver>(
        &self,
        relay: i64,
        relays: &RelayBank<D>,
        now_ms: u64,
    ) -> RelayStatusPayload {
        let (state, timer) = match usize::try_from(relay) {
            Ok(index) => (relays.get_state(index), relays.get_timer(index)),
            Err(_) => (false, 0),
        };

        RelayStatusPayload {
            device_id: self.device_id.to_string(),
            relay,
            state,
            timer,
            timestamp: now_ms,
        }
    }

    pub fn publish_relay_status<D: RelayDriver>(
        &self,
        relay: i64,
        relays: &RelayBank<D>,
        publisher: &mut impl Publisher,
        now_ms: u64,
    ) -> StatusEcho {
        let payload = self.relay_status(relay, relays, now_ms);
        let result = serde_json::to_vec(&payload)
            .map_err(|err| BrokerError::Encode(err.to_string()))
            .and_then(|bytes| publisher.publish(TOPIC_RELAY_STATUS, &bytes));

        match result {
            Ok(()) => StatusEcho::Published,
            Err(err) => StatusEcho::Failed(err),
        }
    }
}

fn apply<D: RelayDriver>(
    command: &InboundCommand,
    relays: &mut RelayBank<D>,
    now_ms: u64,
) -> CommandOutcome {
    let Some(action) = command.action else {
        return CommandOutcome::UnknownAction {
            relay: command.relay_index,
        };
    };

    let index = match usize::try_from(command.relay_index) {
        Ok(index) => index,
        Err(_) => {
            return CommandOutcome::Rejected {
                action,
                error: IndexError {
                    index: command.relay_index,
                    count: relays.len(),
                },
            }
        }
    };

    let result = match action {
        RelayAction::On => relays.set_state(index, true),
        RelayAction::Off => relays.set_state(index, false),
        RelayAction::Toggle => {
            let current = relays.get_state(index);
            relays.set_state(index, !current)
        }
        RelayAction::TimerSeconds(seconds) => relays.set_timer(index, seconds, now_ms),
    };

    match result {
        Ok(()) => CommandOutcome::Applied {
            relay: index,
            action,
            state: relays.get_state(index),
        },
        Err(error) => CommandOutcome::Rejected { action, error },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        config::DEFAULT_RELAY_PINS,
        fakes::{FakeBroker, RecordingDriver},
    };

    const DEVICE: &str = "GT-a1b2c3d4";

    fn processor() -> CommandProcessor {
        CommandProcessor::new(DeviceId::from_hardware_id(0xa1b2_c3d4), 512)
    }

    fn relays() -> RelayBank<RecordingDriver> {
        RelayBank::new(RecordingDriver::default(), &DEFAULT_RELAY_PINS)
    }

    fn broker() -> FakeBroker {
        FakeBroker {
            connected: true,
            ..FakeBroker::default()
        }
    }

    fn message(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn on_command_switches_relay_and_echoes_status() {
        let mut relays = relays();
        let mut broker = broker();

        let report = processor().handle(
            &message(json!({"deviceId": DEVICE, "relay": 3, "action": "on"})),
            &mut relays,
            &mut broker,
            1_000,
        );

        assert_eq!(
            report,
            CommandReport {
                outcome: CommandOutcome::Applied {
                    relay: 3,
                    action: RelayAction::On,
                    state: true
                },
                status: StatusEcho::Published,
            }
        );
        assert!(relays.get_state(3));
        assert_eq!(
            broker.published_on(TOPIC_RELAY_STATUS),
            vec![json!({
                "deviceId": DEVICE,
                "relay": 3,
                "state": true,
                "timer": 0,
                "timestamp": 1000
            })]
        );
    }

    #[test]
    fn timer_command_reports_absolute_expiry() {
        let mut relays = relays();
        let mut broker = broker();

        processor().handle(
            &message(json!({"deviceId": DEVICE, "relay": 3, "action": "timer", "duration": 5})),
            &mut relays,
            &mut broker,
            1_000,
        );

        let status = &broker.published_on(TOPIC_RELAY_STATUS)[0];
        assert_eq!(status["state"], json!(true));
        assert_eq!(status["timer"], json!(6000));
        assert_eq!(relays.tick(6_000), vec![3]);
    }

    #[test]
    fn toggle_twice_restores_original_state() {
        let mut relays = relays();
        let mut broker = broker();
        let processor = processor();
        let raw = message(json!({"deviceId": DEVICE, "relay": 7, "action": "toggle"}));

        processor.handle(&raw, &mut relays, &mut broker, 0);
        assert!(relays.get_state(7));
        processor.handle(&raw, &mut relays, &mut broker, 10);
        assert!(!relays.get_state(7));

        let states: Vec<_> = broker
            .published_on(TOPIC_RELAY_STATUS)
            .iter()
            .map(|status| status["state"].clone())
            .collect();
        assert_eq!(states, vec![json!(true), json!(false)]);
    }

    #[test]
    fn foreign_device_is_ignored_without_echo() {
        let mut relays = relays();
        let mut broker = broker();
        let writes = relays.driver().writes.len();

        let report = processor().handle(
            &message(json!({"deviceId": "GT-00000000", "relay": 3, "action": "on"})),
            &mut relays,
            &mut broker,
            0,
        );

        assert_eq!(
            report.outcome,
            CommandOutcome::IgnoredForeignDevice {
                target: "GT-00000000".to_string()
            }
        );
        assert_eq!(report.status, StatusEcho::NotSent);
        assert_eq!(relays.driver().writes.len(), writes);
        assert!(broker.published.is_empty());
    }

    #[test]
    fn missing_device_id_never_matches() {
        let mut relays = relays();
        let mut broker = broker();

        let report = processor().handle(
            &message(json!({"relay": 0, "action": "on"})),
            &mut relays,
            &mut broker,
            0,
        );

        assert!(matches!(
            report.outcome,
            CommandOutcome::IgnoredForeignDevice { .. }
        ));
        assert!(!relays.get_state(0));
    }

    #[test]
    fn out_of_range_index_is_rejected_but_still_echoed() {
        let mut relays = relays();
        let mut broker = broker();

        let report = processor().handle(
            &message(json!({"deviceId": DEVICE, "relay": 20, "action": "on"})),
            &mut relays,
            &mut broker,
            0,
        );

        assert_eq!(
            report.outcome,
            CommandOutcome::Rejected {
                action: RelayAction::On,
                error: IndexError {
                    index: 20,
                    count: 20
                },
            }
        );
        assert!(relays.snapshot().iter().all(|relay| !relay.state));
        assert_eq!(
            broker.published_on(TOPIC_RELAY_STATUS)[0],
            json!({"deviceId": DEVICE, "relay": 20, "state": false, "timer": 0, "timestamp": 0})
        );
    }

    #[test]
    fn negative_index_is_rejected() {
        let mut relays = relays();
        let mut broker = broker();

        let report = processor().handle(
            &message(json!({"deviceId": DEVICE, "relay": -1, "action": "toggle"})),
            &mut relays,
            &mut broker,
            0,
        );

        assert!(matches!(
            report.outcome,
            CommandOutcome::Rejected {
                error: IndexError { index: -1, .. },
                ..
            }
        ));
        assert_eq!(broker.published_on(TOPIC_RELAY_STATUS)[0]["relay"], json!(-1));
    }

    #[test]
    fn unknown_action_changes_nothing_but_echoes() {
        let mut relays = relays();
        let mut broker = broker();

        let report = processor().handle(
            &message(json!({"deviceId": DEVICE, "relay": 2, "action": "blink"})),
            &mut relays,
            &mut broker,
            0,
        );

        assert_eq!(report.outcome, CommandOutcome::UnknownAction { relay: 2 });
        assert_eq!(report.status, StatusEcho::Published);
        assert!(!relays.get_state(2));
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        let mut relays = relays();
        let mut broker = broker();
        let processor = processor();

        let report = processor.handle(b"{not json", &mut relays, &mut broker, 0);
        assert!(matches!(
            report.outcome,
            CommandOutcome::Dropped(ParseError::Json(_))
        ));

        let report = processor.handle(&[0xff, 0xfe, 0x7b], &mut relays, &mut broker, 0);
        assert_eq!(report.outcome, CommandOutcome::Dropped(ParseError::NotUtf8));

        let oversized = vec![b' '; 513];
        let report = processor.handle(&oversized, &mut relays, &mut broker, 0);
        assert_eq!(
            report.outcome,
            CommandOutcome::Dropped(ParseError::TooLarge {
                size: 513,
                limit: 512
            })
        );

        assert!(broker.published.is_empty());
    }

    #[test]
    fn publish_failure_is_reported_after_state_change() {
        let mut relays = relays();
        let mut broker = broker();
        broker.fail_publishes = true;

        let report = processor().handle(
            &message(json!({"deviceId": DEVICE, "relay": 1, "action": "on"})),
            &mut relays,
            &mut broker,
            0,
        );

        assert!(relays.get_state(1));
        assert!(matches!(
            report.status,
            StatusEcho::Failed(BrokerError::Publish(_))
        ));
    }
}
