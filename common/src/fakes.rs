//! In-memory stand-ins for the hardware seams, shared by the unit tests.

use std::{
    cell::Cell,
    collections::{BTreeMap, VecDeque},
};

use crate::{
    config::AccessPointConfig,
    connectivity::{BrokerError, BrokerLink, LinkError, Publisher, StationLink},
    relay::RelayDriver,
    store::{KeyValueStore, PersistError},
};

#[derive(Debug, Default)]
pub struct RecordingDriver {
    pub writes: Vec<(usize, i32, bool)>,
}

impl RelayDriver for RecordingDriver {
    fn set_level(&mut self, channel: usize, pin: i32, on: bool) {
        self.writes.push((channel, pin, on));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stored {
    Str(String),
    Bool(bool),
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Stored>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    fn check_write(&self, key: &str) -> Result<(), PersistError> {
        if self.fail_writes {
            return Err(PersistError::Write {
                key: key.to_string(),
                reason: "flash unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(match self.entries.get(key) {
            Some(Stored::Str(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), PersistError> {
        self.check_write(key)?;
        self.entries
            .insert(key.to_string(), Stored::Str(value.to_string()));
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, PersistError> {
        Ok(match self.entries.get(key) {
            Some(Stored::Bool(value)) => Some(*value),
            _ => None,
        })
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), PersistError> {
        self.check_write(key)?;
        self.entries.insert(key.to_string(), Stored::Bool(value));
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeStation {
    pub up: bool,
    pub probes: Cell<u32>,
    pub begins: Vec<(String, String)>,
    pub access_points: Vec<String>,
    pub networks: Result<Vec<String>, LinkError>,
}

impl Default for FakeStation {
    fn default() -> Self {
        Self {
            up: false,
            probes: Cell::new(0),
            begins: Vec::new(),
            access_points: Vec::new(),
            networks: Ok(Vec::new()),
        }
    }
}

impl StationLink for FakeStation {
    fn begin(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        self.begins.push((ssid.to_string(), password.to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.probes.set(self.probes.get() + 1);
        self.up
    }

    fn start_access_point(&mut self, access_point: &AccessPointConfig) -> Result<(), LinkError> {
        self.access_points.push(access_point.ssid.clone());
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<String>, LinkError> {
        self.networks.clone()
    }

    fn ip_address(&self) -> Option<String> {
        self.up.then(|| "192.168.1.50".to_string())
    }

    fn rssi(&self) -> Option<i32> {
        self.up.then_some(-61)
    }
}

#[derive(Debug, Default)]
pub struct FakeBroker {
    pub connected: bool,
    pub refuse_connects: u32,
    pub fail_publishes: bool,
    pub client_ids: Vec<String>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub inbound: VecDeque<Vec<u8>>,
}

impl FakeBroker {
    pub fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }
}

impl Publisher for FakeBroker {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        if self.fail_publishes {
            return Err(BrokerError::Publish("outbound queue full".to_string()));
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

impl BrokerLink for FakeBroker {
    fn connect(&mut self, client_id: &str) -> Result<(), BrokerError> {
        self.client_ids.push(client_id.to_string());
        if self.refuse_connects > 0 {
            self.refuse_connects -= 1;
            return Err(BrokerError::Connect("connection refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn poll_inbound(&mut self) -> Vec<Vec<u8>> {
        self.inbound.drain(..).collect()
    }
}
