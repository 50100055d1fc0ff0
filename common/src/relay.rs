use thiserror::Error;

use crate::types::RelaySnapshot;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("relay index {index} out of range (0..{count})")]
pub struct IndexError {
    pub index: i64,
    pub count: usize,
}

/// Drives the physical output line behind each relay channel.
pub trait RelayDriver {
    fn set_level(&mut self, channel: usize, pin: i32, on: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayChannel {
    pub index: usize,
    pub pin: i32,
    pub state: bool,
    pub expiry_ms: Option<u64>,
}

/// Fixed set of relay channels with optional auto-off deadlines.
///
/// Channel `i` is always wired to `pins[i]`; the mapping never changes after
/// construction. Writes reject out-of-range indexes, reads fall back to
/// `false` / `0` so status echoes for bogus indexes stay well-formed.
pub struct RelayBank<D> {
    driver: D,
    channels: Vec<RelayChannel>,
}

impl<D: RelayDriver> RelayBank<D> {
    pub fn new(mut driver: D, pins: &[i32]) -> Self {
        let channels = pins
            .iter()
            .enumerate()
            .map(|(index, &pin)| {
                driver.set_level(index, pin, false);
                RelayChannel {
                    index,
                    pin,
                    state: false,
                    expiry_ms: None,
                }
            })
            .collect();

        Self { driver, channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn channels(&self) -> &[RelayChannel] {
        &self.channels
    }

    /// Turning a channel off cancels its pending timer; turning it on leaves
    /// any pending timer in place.
    pub fn set_state(&mut self, index: usize, on: bool) -> Result<(), IndexError> {
        let count = self.channels.len();
        let channel = self.channels.get_mut(index).ok_or(IndexError {
            index: index as i64,
            count,
        })?;

        channel.state = on;
        if !on {
            channel.expiry_ms = None;
        }
        self.driver.set_level(index, channel.pin, on);
        Ok(())
    }

    /// Turns the channel on and (re)arms its auto-off deadline. A second call
    /// replaces the first deadline rather than extending it.
    pub fn set_timer(
        &mut self,
        index: usize,
        duration_secs: u64,
        now_ms: u64,
    ) -> Result<(), IndexError> {
        self.set_state(index, true)?;
        let expiry = now_ms.saturating_add(duration_secs.saturating_mul(1_000));
        self.channels[index].expiry_ms = Some(expiry);
        Ok(())
    }

    /// Switches off every channel whose deadline has passed and returns the
    /// indexes that were switched.
    pub fn tick(&mut self, now_ms: u64) -> Vec<usize> {
        let mut expired = Vec::new();

        for channel in &mut self.channels {
            let Some(expiry) = channel.expiry_ms else {
                continue;
            };
            if now_ms < expiry {
                continue;
            }

            channel.state = false;
            channel.expiry_ms = None;
            self.driver.set_level(channel.index, channel.pin, false);
            expired.push(channel.index);
        }

        expired
    }

    pub fn get_state(&self, index: usize) -> bool {
        self.channels
            .get(index)
            .map(|channel| channel.state)
            .unwrap_or(false)
    }

    /// Absolute expiry in monotonic milliseconds, or `0` when no timer is armed.
    pub fn get_timer(&self, index: usize) -> u64 {
        self.channels
            .get(index)
            .and_then(|channel| channel.expiry_ms)
            .unwrap_or(0)
    }

    pub fn remaining_ms(&self, index: usize, now_ms: u64) -> u64 {
        match self.get_timer(index) {
            0 => 0,
            expiry => expiry.saturating_sub(now_ms),
        }
    }

    pub fn snapshot(&self) -> Vec<RelaySnapshot> {
        self.channels
            .iter()
            .map(|channel| RelaySnapshot {
                index: channel.index,
                state: channel.state,
                timer: channel.expiry_ms.unwrap_or(0),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fakes::RecordingDriver;

    fn bank(count: usize) -> RelayBank<RecordingDriver> {
        let pins: Vec<i32> = (0..count as i32).map(|pin| pin + 10).collect();
        RelayBank::new(RecordingDriver::default(), &pins)
    }

    #[test]
    fn construction_drives_every_pin_low() {
        let relays = bank(3);
        assert_eq!(
            relays.driver().writes,
            vec![(0, 10, false), (1, 11, false), (2, 12, false)]
        );
    }

    #[test]
    fn out_of_range_writes_fail_and_leave_bank_unchanged() {
        let mut relays = bank(4);
        let before = relays.channels().to_vec();
        let writes_before = relays.driver().writes.len();

        assert_eq!(
            relays.set_state(4, true),
            Err(IndexError { index: 4, count: 4 })
        );
        assert_eq!(
            relays.set_timer(17, 5, 1_000),
            Err(IndexError { index: 17, count: 4 })
        );

        assert_eq!(relays.channels(), before.as_slice());
        assert_eq!(relays.driver().writes.len(), writes_before);
    }

    #[test]
    fn out_of_range_reads_return_defaults() {
        let mut relays = bank(2);
        relays.set_timer(1, 5, 0).unwrap();

        assert!(!relays.get_state(2));
        assert_eq!(relays.get_timer(2), 0);
        assert!(!relays.get_state(usize::MAX));
        assert_eq!(relays.get_timer(usize::MAX), 0);
    }

    #[test]
    fn timer_fires_exactly_at_expiry() {
        let mut relays = bank(20);
        relays.set_timer(3, 5, 1_000).unwrap();

        assert!(relays.get_state(3));
        assert_eq!(relays.get_timer(3), 6_000);

        assert!(relays.tick(5_999).is_empty());
        assert!(relays.get_state(3));

        assert_eq!(relays.tick(6_000), vec![3]);
        assert!(!relays.get_state(3));
        assert_eq!(relays.get_timer(3), 0);
    }

    #[test]
    fn tick_is_idempotent_after_firing() {
        let mut relays = bank(2);
        relays.set_timer(0, 1, 0).unwrap();

        assert_eq!(relays.tick(1_000), vec![0]);
        let writes = relays.driver().writes.len();

        assert!(relays.tick(1_000).is_empty());
        assert!(relays.tick(50_000).is_empty());
        assert_eq!(relays.driver().writes.len(), writes);
    }

    #[test]
    fn second_timer_overwrites_first() {
        let mut relays = bank(2);
        relays.set_timer(1, 10, 1_000).unwrap();
        relays.set_timer(1, 2, 4_000).unwrap();

        assert_eq!(relays.get_timer(1), 6_000);
    }

    #[test]
    fn explicit_off_clears_timer_but_on_keeps_it() {
        let mut relays = bank(2);
        relays.set_timer(0, 5, 0).unwrap();

        relays.set_state(0, true).unwrap();
        assert_eq!(relays.get_timer(0), 5_000);

        relays.set_state(0, false).unwrap();
        assert_eq!(relays.get_timer(0), 0);
        assert!(relays.tick(10_000).is_empty());
    }

    #[test]
    fn snapshot_and_remaining_report_timer_state() {
        let mut relays = bank(2);
        relays.set_timer(1, 3, 500).unwrap();

        assert_eq!(relays.remaining_ms(1, 1_500), 2_000);
        assert_eq!(relays.remaining_ms(0, 1_500), 0);
        assert_eq!(
            relays.snapshot(),
            vec![
                RelaySnapshot {
                    index: 0,
                    state: false,
                    timer: 0
                },
                RelaySnapshot {
                    index: 1,
                    state: true,
                    timer: 3_500
                },
            ]
        );
    }
}
