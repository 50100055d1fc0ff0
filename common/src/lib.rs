pub mod command;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod identity;
pub mod provisioning;
pub mod relay;
pub mod store;
pub mod topics;
pub mod types;

#[cfg(test)]
pub(crate) mod fakes;

pub use command::{CommandOutcome, CommandProcessor, CommandReport, ParseError, StatusEcho};
pub use config::{AccessPointConfig, BrokerConfig, ControllerConfig, TimingConfig};
pub use connectivity::{
    BrokerError, BrokerLink, ConnectivityEvent, ConnectivityState, ConnectivitySupervisor,
    LinkError, Publisher, StationLink,
};
pub use controller::{Controller, ControllerEvent, EventLevel, TickOutcome, TickReport};
pub use identity::{DeviceId, HardwareIdentity, StaticIdentity};
pub use provisioning::{
    ProvisioningEvent, ProvisioningReply, ProvisioningRequest, ProvisioningService,
    RequestRestart, SETUP_PAGE_PATHS,
};
pub use relay::{IndexError, RelayBank, RelayDriver};
pub use store::{CredentialStore, Credentials, KeyValueStore, PersistError};
pub use topics::*;
pub use types::{DeviceStatusPayload, RelaySnapshot, RelayStatusPayload};
