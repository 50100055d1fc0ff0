pub const TOPIC_RELAY_CONTROL: &str = "green-tech/relay-control";
pub const TOPIC_RELAY_STATUS: &str = "green-tech/relay-status";
pub const TOPIC_DEVICE_STATUS: &str = "green-tech/device-status";
pub const TOPIC_CREDENTIALS: &str = "green-tech/credentials";
