/*!
 * Consistent Hashing Ring
 *
 * Ketama-style continuum: every server owns a number of pseudo-random points
 * on a 64-bit circle proportional to its weight, and a key belongs to the
 * server owning the first point at or after the key's hash. Adding or
 * removing one server only moves the keys on that server's arcs.
 *
 * Points and keys share one hash: XXH3-128. Each point label yields two
 * points (both halves of its digest); a key uses the low half.
 */

use crate::error::{Error, Result};
use log::debug;
use smol_str::SmolStr;
use xxhash_rust::xxh3::xxh3_128;

/// Digests per server for an evenly weighted ring; each digest yields two
/// points, so an average server owns 160 points
const DIGESTS_PER_SERVER: f64 = 80.0;

/// A weighted server in the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub address: SmolStr,
    pub weight: u32,
}

/// One point on the circle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuumPoint {
    pub hash: u64,
    pub ordinal: usize,
}

/// Weighted consistent-hashing ring
///
/// Servers are added first, then [`HashRing::create_continuum`] freezes the
/// ring; lookups are only possible afterwards.
#[derive(Debug, Default, Clone)]
pub struct HashRing {
    servers: Vec<Server>,
    total_weight: u64,
    continuum: Option<Vec<ContinuumPoint>>,
}

/// Position of a key on the circle: low half of its XXH3-128 digest
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    xxh3_128(key) as u64
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server and return its ordinal
    ///
    /// # Errors
    /// * `InvalidWeight` - weight is zero
    /// * `DuplicateAddress` - address already in the ring
    /// * `ContinuumBuilt` - the ring is already frozen
    pub fn add_server(&mut self, address: &str, weight: u32) -> Result<usize> {
        if self.continuum.is_some() {
            return Err(Error::ContinuumBuilt);
        }
        if weight == 0 {
            return Err(Error::InvalidWeight {
                address: SmolStr::new(address),
                weight,
            });
        }
        if self.servers.iter().any(|s| s.address == address) {
            return Err(Error::DuplicateAddress(SmolStr::new(address)));
        }
        self.servers.push(Server {
            address: SmolStr::new(address),
            weight,
        });
        self.total_weight += weight as u64;
        Ok(self.servers.len() - 1)
    }

    /// Generate and sort the points of every server
    pub fn create_continuum(&mut self) -> Result<()> {
        if self.continuum.is_some() {
            return Err(Error::ContinuumBuilt);
        }
        if self.servers.is_empty() {
            return Err(Error::EmptyRing);
        }

        let n = self.servers.len() as f64;
        let mut points = Vec::with_capacity(self.servers.len() * 2 * DIGESTS_PER_SERVER as usize);

        for (ordinal, server) in self.servers.iter().enumerate() {
            let pct = server.weight as f64 / self.total_weight as f64;
            let digests = ((pct * DIGESTS_PER_SERVER * n).floor() as usize).max(1);
            debug!(
                "server {}: {} (weight {} = {:.1}%, {} points)",
                ordinal,
                server.address,
                server.weight,
                pct * 100.0,
                digests * 2
            );

            for k in 0..digests {
                let digest = xxh3_128(format!("{}-{}", server.address, k).as_bytes());
                points.push(ContinuumPoint {
                    hash: digest as u64,
                    ordinal,
                });
                points.push(ContinuumPoint {
                    hash: (digest >> 64) as u64,
                    ordinal,
                });
            }
        }

        points.sort_unstable_by_key(|p| (p.hash, p.ordinal));
        debug!("continuum created with {} points", points.len());
        self.continuum = Some(points);
        Ok(())
    }

    /// Map a key to the ordinal of the server owning it
    pub fn resolve(&self, key: &[u8]) -> Result<usize> {
        let points = self.continuum.as_deref().ok_or(Error::RingNotBuilt)?;
        let h = hash_key(key);
        let idx = points.partition_point(|p| p.hash < h);
        // Past the last point the circle wraps to the first one
        let point = points.get(idx).unwrap_or(&points[0]);
        Ok(point.ordinal)
    }

    /// Map a key straight to its server address
    pub fn resolve_address(&self, key: &[u8]) -> Result<&str> {
        self.server_address(self.resolve(key)?)
    }

    pub fn server_address(&self, ordinal: usize) -> Result<&str> {
        self.servers
            .get(ordinal)
            .map(|s| s.address.as_str())
            .ok_or(Error::InvalidOrdinal(ordinal))
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// The sorted continuum, empty before it is created
    pub fn points(&self) -> &[ContinuumPoint] {
        self.continuum.as_deref().unwrap_or(&[])
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn is_built(&self) -> bool {
        self.continuum.is_some()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
