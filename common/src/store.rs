use thiserror::Error;

pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_SYS_USERNAME: &str = "sys_username";
pub const KEY_SYS_PASSWORD: &str = "sys_password";
pub const KEY_CONFIGURED: &str = "configured";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistError {
    #[error("failed to read `{key}`: {reason}")]
    Read { key: String, reason: String },
    #[error("failed to write `{key}`: {reason}")]
    Write { key: String, reason: String },
}

/// Durable key/value storage scoped to a single namespace.
pub trait KeyValueStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, PersistError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), PersistError>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>, PersistError>;
    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), PersistError>;
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub wifi_password: String,
    pub account_username: String,
    pub account_password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("wifi_password_set", &!self.wifi_password.is_empty())
            .field("account_username", &self.account_username)
            .field("account_password_set", &!self.account_password.is_empty())
            .finish()
    }
}

impl Credentials {
    pub fn has_station(&self) -> bool {
        !self.ssid.is_empty()
    }

    pub fn has_account(&self) -> bool {
        !self.account_username.is_empty() && !self.account_password.is_empty()
    }
}

/// Typed view over the persisted provisioning fields.
pub struct CredentialStore<K> {
    kv: K,
}

impl<K: KeyValueStore> CredentialStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn inner(&self) -> &K {
        &self.kv
    }

    pub fn inner_mut(&mut self) -> &mut K {
        &mut self.kv
    }

    pub fn into_inner(self) -> K {
        self.kv
    }

    pub fn load(&self) -> Result<Credentials, PersistError> {
        Ok(Credentials {
            ssid: self.kv.get_str(KEY_WIFI_SSID)?.unwrap_or_default(),
            wifi_password: self.kv.get_str(KEY_WIFI_PASS)?.unwrap_or_default(),
            account_username: self.kv.get_str(KEY_SYS_USERNAME)?.unwrap_or_default(),
            account_password: self.kv.get_str(KEY_SYS_PASSWORD)?.unwrap_or_default(),
        })
    }

    pub fn save(&mut self, credentials: &Credentials) -> Result<(), PersistError> {
        self.kv.set_str(KEY_WIFI_SSID, &credentials.ssid)?;
        self.kv.set_str(KEY_WIFI_PASS, &credentials.wifi_password)?;
        self.kv.set_str(KEY_SYS_USERNAME, &credentials.account_username)?;
        self.kv.set_str(KEY_SYS_PASSWORD, &credentials.account_password)
    }

    pub fn is_configured(&self) -> Result<bool, PersistError> {
        Ok(self.kv.get_bool(KEY_CONFIGURED)?.unwrap_or(false))
    }

    pub fn set_configured(&mut self, configured: bool) -> Result<(), PersistError> {
        self.kv.set_bool(KEY_CONFIGURED, configured)
    }
}
