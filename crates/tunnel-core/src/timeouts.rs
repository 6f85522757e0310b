use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Every timeout the session state machines honor, with the spec's defaults.
/// Carried as a struct (rather than bare constants) so the configuration
/// loader can override individual values from the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "humantime_serde")]
    pub auth_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub local_dial_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub put_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(5),
            local_dial_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
            put_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    /// A PONG not seen within this long marks the link stale (§4.9, MAY).
    pub fn stale_threshold(&self) -> Duration {
        self.ping_interval * 4
    }
}

pub const READ_CHUNK: usize = 4096;
pub const MAX_AUTH_BYTES: usize = 1024;
pub const ALLOC_MAX_ATTEMPTS: usize = 100;
pub const MAX_RETRIES: u32 = 10;
pub const QUEUE_SIZE_SERVER: usize = 1000;
pub const QUEUE_SIZE_CLIENT: usize = 100;
