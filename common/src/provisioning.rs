use serde::Serialize;

use crate::{
    connectivity::{LinkError, StationLink},
    store::{CredentialStore, Credentials, KeyValueStore, PersistError},
    types::{ConfigureRequest, ConfigureResponse, ErrorBody, ScanResponse},
};

/// Paths that serve the setup page. Besides `/`, these are the probe URLs
/// phones and laptops fetch to detect a captive portal.
pub const SETUP_PAGE_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

pub const CONTENT_TYPE_HTML: &str = "text/html";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

const LIVENESS_BODY: &str = "Web server is working!";
const SAVED_MESSAGE: &str =
    "Configuration saved successfully! Device will restart and connect to your network.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningRequest {
    SetupPage,
    Scan,
    Configure(Vec<u8>),
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl ProvisioningReply {
    pub fn html(body: &str) -> Self {
        Self {
            status: 200,
            content_type: CONTENT_TYPE_HTML,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn text(body: &str) -> Self {
        Self {
            status: 200,
            content_type: CONTENT_TYPE_TEXT,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: CONTENT_TYPE_JSON,
                body,
            },
            Err(_) => Self {
                status: 500,
                content_type: CONTENT_TYPE_JSON,
                body: br#"{"error":"encoding failed"}"#.to_vec(),
            },
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self::json(
            status,
            &ErrorBody {
                error: message.to_string(),
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    SetupPageServed,
    LivenessProbed,
    ScanCompleted { networks: usize },
    ScanFailed(LinkError),
    ConfigureBodyMalformed(String),
    ConfigurationSaved { ssid: String, restart_at_ms: u64 },
    ConfigurationFailed(PersistError),
}

/// Deferred full restart, emitted once the delay after a successful save
/// has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRestart {
    pub due_ms: u64,
}

#[derive(Debug)]
pub struct ProvisioningService {
    setup_page: &'static str,
    restart_delay_ms: u64,
    pending_restart: Option<RequestRestart>,
}

impl ProvisioningService {
    pub fn new(setup_page: &'static str, restart_delay_ms: u64) -> Self {
        Self {
            setup_page,
            restart_delay_ms,
            pending_restart: None,
        }
    }

    pub fn pending_restart(&self) -> Option<RequestRestart> {
        self.pending_restart
    }

    /// Hands out the pending restart once its deadline has passed.
    pub fn take_due_restart(&mut self, now_ms: u64) -> Option<RequestRestart> {
        match self.pending_restart {
            Some(restart) if now_ms >= restart.due_ms => self.pending_restart.take(),
            _ => None,
        }
    }

    pub fn handle<K: KeyValueStore>(
        &mut self,
        request: ProvisioningRequest,
        store: &mut CredentialStore<K>,
        station: &mut impl StationLink,
        now_ms: u64,
    ) -> (ProvisioningReply, Vec<ProvisioningEvent>) {
        match request {
            ProvisioningRequest::SetupPage => (
                ProvisioningReply::html(self.setup_page),
                vec![ProvisioningEvent::SetupPageServed],
            ),
            ProvisioningRequest::Test => (
                ProvisioningReply::text(LIVENESS_BODY),
                vec![ProvisioningEvent::LivenessProbed],
            ),
            ProvisioningRequest::Scan => self.scan(station),
            ProvisioningRequest::Configure(body) => self.configure(&body, store, now_ms),
        }
    }

    /// Best effort: a failed scan still answers 200 with an empty list.
    fn scan(
        &self,
        station: &mut impl StationLink,
    ) -> (ProvisioningReply, Vec<ProvisioningEvent>) {
        let (networks, event) = match station.scan() {
            Ok(networks) => {
                let count = networks.len();
                (networks, ProvisioningEvent::ScanCompleted { networks: count })
            }
            Err(err) => (Vec::new(), ProvisioningEvent::ScanFailed(err)),
        };

        (
            ProvisioningReply::json(200, &ScanResponse { networks }),
            vec![event],
        )
    }

    fn configure<K: KeyValueStore>(
        &mut self,
        body: &[u8],
        store: &mut CredentialStore<K>,
        now_ms: u64,
    ) -> (ProvisioningReply, Vec<ProvisioningEvent>) {
        let mut events = Vec::new();

        let request = match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(value) if value.is_object() => ConfigureRequest::from_value(&value),
            Ok(_) => {
                events.push(ProvisioningEvent::ConfigureBodyMalformed(
                    "body is not a JSON object".to_string(),
                ));
                ConfigureRequest::default()
            }
            Err(err) => {
                events.push(ProvisioningEvent::ConfigureBodyMalformed(err.to_string()));
                ConfigureRequest::default()
            }
        };

        let credentials = Credentials {
            ssid: request.ssid,
            wifi_password: request.password,
            account_username: request.username,
            account_password: request.user_password,
        };

        let saved = store
            .save(&credentials)
            .and_then(|()| store.set_configured(true));

        match saved {
            Ok(()) => {
                let restart = RequestRestart {
                    due_ms: now_ms.saturating_add(self.restart_delay_ms),
                };
                self.pending_restart = Some(restart);
                events.push(ProvisioningEvent::ConfigurationSaved {
                    ssid: credentials.ssid,
                    restart_at_ms: restart.due_ms,
                });
                let response = ConfigureResponse {
                    success: true,
                    message: SAVED_MESSAGE.to_string(),
                };
                (ProvisioningReply::json(200, &response), events)
            }
            Err(err) => {
                let response = ConfigureResponse {
                    success: false,
                    message: format!("Failed to save configuration: {err}"),
                };
                events.push(ProvisioningEvent::ConfigurationFailed(err));
                (ProvisioningReply::json(500, &response), events)
            }
        }
    }
}
