use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest pool the server will manage.
///
/// Every address of the range gets its own lease slot, so the range is
/// bounded to a /16.
pub const MAX_POOL_SIZE: u32 = 65536;

/// Server settings, read from a JSON file. Missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Index of the network interface the server is bound to. Must be
    /// non-zero.
    pub interface_index: u32,
    /// Device to bind to where the platform supports it.
    pub interface_name: Option<String>,
    /// Our address, sent as the server identifier (Option 54).
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// First address of the pool.
    pub pool_start: Ipv4Addr,
    /// Number of consecutive addresses starting at `pool_start`.
    pub pool_size: u32,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub lease_duration_seconds: u32,
    /// T1. Half the lease when unset.
    pub renewal_time_seconds: Option<u32>,
    /// T2. Seven eighths of the lease when unset.
    pub rebinding_time_seconds: Option<u32>,
    /// How long an OFFER holds its address without a matching REQUEST.
    pub offer_timeout_seconds: u32,
    /// How long a DECLINEd address stays out of circulation.
    pub decline_quarantine_seconds: u32,
    /// Period of the sweep that reclaims anything the per-lease timers
    /// missed.
    pub housekeeping_interval_seconds: u32,
    /// Overrides the broadcast address derived from `server_ip` and
    /// `subnet_mask`.
    pub broadcast_address: Option<Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface_index: 1,
            interface_name: None,
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_size: 101,
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            domain_name: None,
            lease_duration_seconds: 3600,
            renewal_time_seconds: None,
            rebinding_time_seconds: None,
            offer_timeout_seconds: 60,
            decline_quarantine_seconds: 3600,
            housekeeping_interval_seconds: 60,
            broadcast_address: None,
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig(message.into())
}

fn seconds(value: u32) -> Duration {
    Duration::from_secs(u64::from(value))
}

impl Config {
    /// Reads `path`, or writes out the defaults there if it doesn't exist.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface_index == 0 {
            return Err(invalid("interface_index must be non-zero"));
        }

        if !(1..=MAX_POOL_SIZE).contains(&self.pool_size) {
            return Err(invalid(format!(
                "pool_size {} is outside 1..={}",
                self.pool_size, MAX_POOL_SIZE
            )));
        }

        if u32::from(self.pool_start).checked_add(self.pool_size - 1).is_none() {
            return Err(invalid("pool range wraps past 255.255.255.255"));
        }

        let reserved = [("server_ip", Some(self.server_ip)), ("gateway", self.gateway)];
        for (name, address) in reserved {
            if let Some(address) = address
                && self.ip_in_pool(address)
            {
                return Err(invalid(format!("{} {} lies inside the pool", name, address)));
            }
        }

        let periods = [
            ("lease_duration_seconds", self.lease_duration_seconds),
            ("offer_timeout_seconds", self.offer_timeout_seconds),
            ("housekeeping_interval_seconds", self.housekeeping_interval_seconds),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(invalid(format!("{} must be non-zero", name)));
        }

        if self.renewal_time_seconds.is_some() || self.rebinding_time_seconds.is_some() {
            let (t1, t2, lease) = (
                self.renewal_time(),
                self.rebinding_time(),
                self.lease_duration_seconds,
            );
            if !(t1 < t2 && t2 < lease) {
                return Err(invalid(format!(
                    "need T1 < T2 < lease, got {} / {} / {}",
                    t1, t2, lease
                )));
            }
        }

        Ok(())
    }

    /// Last address of the pool, inclusive.
    pub fn pool_end(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.pool_start).saturating_add(self.pool_size.saturating_sub(1)))
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.pool_start)..=u32::from(self.pool_end())).contains(&u32::from(ip))
    }

    pub fn lease_duration(&self) -> Duration {
        seconds(self.lease_duration_seconds)
    }

    pub fn offer_timeout(&self) -> Duration {
        seconds(self.offer_timeout_seconds)
    }

    pub fn decline_quarantine(&self) -> Duration {
        seconds(self.decline_quarantine_seconds)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        seconds(self.housekeeping_interval_seconds)
    }

    pub fn renewal_time(&self) -> u32 {
        self.renewal_time_seconds
            .unwrap_or(self.lease_duration_seconds / 2)
    }

    pub fn rebinding_time(&self) -> u32 {
        self.rebinding_time_seconds
            .unwrap_or((u64::from(self.lease_duration_seconds) * 7 / 8) as u32)
    }

    pub fn calculate_broadcast(&self) -> Ipv4Addr {
        self.broadcast_address.unwrap_or_else(|| {
            Ipv4Addr::from(u32::from(self.server_ip) | !u32::from(self.subnet_mask))
        })
    }
}
