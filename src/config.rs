use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lease::MAX_POOL_SIZE;
use crate::message::{HardwareAddress, MESSAGE_SIZE};

/// Server configuration, stored as pretty-printed JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    pub client_port: u16,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub lease_duration_seconds: u32,
    pub sweep_interval_seconds: u32,
    pub offer_retry_interval_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            server_port: 67,
            client_port: 68,
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 200),
            lease_duration_seconds: 3600,
            sweep_interval_seconds: 5,
            offer_retry_interval_millis: 250,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);

        if start > end {
            return Err(Error::InvalidConfig(
                "pool_start must be less than or equal to pool_end".to_string(),
            ));
        }

        if self.pool_size() > MAX_POOL_SIZE {
            return Err(Error::InvalidConfig(format!(
                "pool holds {} addresses, at most {} are supported",
                self.pool_size(),
                MAX_POOL_SIZE
            )));
        }

        if self.ip_in_pool(self.server_ip) {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.pool_start) && addr <= u32::from(self.pool_end)
    }

    /// Number of addresses in the pool, or 0 if the range is inverted.
    pub fn pool_size(&self) -> u64 {
        let start = u64::from(u32::from(self.pool_start));
        let end = u64::from(u32::from(self.pool_end));
        (end + 1).saturating_sub(start)
    }

    /// Socket address the server binds to.
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.server_ip, self.server_port))
    }

    /// How long a DISCOVER may wait for an address to free up: half the
    /// lease duration.
    pub fn offer_wait_budget(&self) -> Duration {
        Duration::from_millis(u64::from(self.lease_duration_seconds) * 500)
    }

    pub fn offer_retry_interval(&self) -> Duration {
        Duration::from_millis(self.offer_retry_interval_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sweep_interval_seconds))
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Either `aa:bb:cc:dd:ee:ff` or a 16-character identifier.
    pub hardware_address: String,
    /// Where DISCOVER and REQUEST messages are sent.
    pub server_address: SocketAddr,
    pub bind_address: SocketAddr,
    pub reply_timeout_millis: u64,
    /// Resends of one exchange step before it times out.
    pub max_retries: u32,
    /// Full DISCOVER restarts before acquisition fails.
    pub max_restarts: u32,
    pub max_message_size: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hardware_address: "aa:bb:cc:dd:ee:ff".to_string(),
            server_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 67)),
            bind_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68)),
            reply_timeout_millis: 2000,
            max_retries: 3,
            max_restarts: 3,
            max_message_size: MESSAGE_SIZE as u16,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        self.hardware_address()?;

        if self.reply_timeout_millis == 0 {
            return Err(Error::InvalidConfig(
                "reply_timeout_millis must be greater than 0".to_string(),
            ));
        }

        if usize::from(self.max_message_size) < MESSAGE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_message_size must be at least {}",
                MESSAGE_SIZE
            )));
        }

        Ok(())
    }

    pub fn hardware_address(&self) -> Result<HardwareAddress> {
        self.hardware_address.parse().map_err(|_| {
            Error::InvalidConfig(format!(
                "hardware_address {:?} is neither a MAC address nor a 16-byte identifier",
                self.hardware_address
            ))
        })
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_millis)
    }
}
