/*!
 * Client Configuration
 *
 * Server list, default per-run timeout and reply size limit. A
 * configuration can be assembled in code, parsed from a
 * `host:port=weight,...` list, or read from the environment.
 */

use crate::error::{Error, Result};
use crate::protocol::DEFAULT_MAX_BULK_LEN;
use crate::ring::{HashRing, Server};
use crate::DEFAULT_ADDR;
use smol_str::SmolStr;
use std::time::Duration;

/// Deadline applied to a run when the caller gives none
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Weight of a server listed without one
pub const DEFAULT_WEIGHT: u32 = 100;

/// Comma separated `host:port=weight` list
pub const SERVERS_ENV: &str = "IGNIX_SERVERS";

/// Default timeout in milliseconds
pub const TIMEOUT_ENV: &str = "IGNIX_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub servers: Vec<Server>,
    pub timeout: Duration,
    pub max_bulk_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, address: &str, weight: u32) -> Self {
        self.servers.push(Server {
            address: SmolStr::new(address),
            weight,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_bulk_len(mut self, max: usize) -> Self {
        self.max_bulk_len = max;
        self
    }

    /// Read `IGNIX_SERVERS` and `IGNIX_TIMEOUT_MS`
    ///
    /// Without a server list the client talks to [`DEFAULT_ADDR`] alone.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let servers = lookup(SERVERS_ENV).unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let mut config = Self {
            servers: parse_servers(&servers)?,
            ..Self::default()
        };
        if let Some(ms) = lookup(TIMEOUT_ENV) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("{}={:?} is not a number", TIMEOUT_ENV, ms)))?;
            config.timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::InvalidConfig("no servers configured".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("timeout must be positive".into()));
        }
        if self.max_bulk_len == 0 {
            return Err(Error::InvalidConfig("max_bulk_len must be positive".into()));
        }
        Ok(())
    }

    /// Add every configured server to a fresh ring and freeze it
    pub fn build_ring(&self) -> Result<HashRing> {
        let mut ring = HashRing::new();
        for server in &self.servers {
            ring.add_server(&server.address, server.weight)?;
        }
        ring.create_continuum()?;
        Ok(ring)
    }
}

/// Parse `host:port[=weight],...`; entries without a weight get
/// [`DEFAULT_WEIGHT`]
pub fn parse_servers(list: &str) -> Result<Vec<Server>> {
    let mut servers = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (address, weight) = match entry.rsplit_once('=') {
            Some((addr, w)) => {
                let weight = w
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| Error::InvalidConfig(format!("bad weight in {:?}", entry)))?;
                (addr.trim(), weight)
            }
            None => (entry, DEFAULT_WEIGHT),
        };
        if address.is_empty() {
            return Err(Error::InvalidAddress(entry.to_string()));
        }
        if weight == 0 {
            return Err(Error::InvalidWeight {
                address: SmolStr::new(address),
                weight,
            });
        }
        servers.push(Server {
            address: SmolStr::new(address),
            weight,
        });
    }
    if servers.is_empty() {
        return Err(Error::InvalidConfig("empty server list".into()));
    }
    Ok(servers)
}
