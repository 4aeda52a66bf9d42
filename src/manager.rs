/*!
 * Connection Cache
 *
 * Keeps at most one open connection per server address for the lifetime of
 * a client. Connections are opened lazily on first use; a connection found
 * closed is evicted and replaced by a fresh one on the next request.
 */

use crate::connection::Connection;
use crate::error::Result;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use log::debug;
use smol_str::SmolStr;

/// Address → connection cache
///
/// Not synchronised: a manager belongs to one session and is only touched
/// through `&mut self`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: HashMap<SmolStr, Connection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached connection for `address`, opening one if needed
    pub fn get_or_create(&mut self, address: &str) -> Result<&mut Connection> {
        self.evict_if_closed(address);
        match self.connections.entry(SmolStr::new(address)) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let conn = Connection::open(address)?;
                Ok(e.insert(conn))
            }
        }
    }

    /// Take the connection for `address` out of the cache for a run
    ///
    /// The caller hands it back with [`ConnectionManager::checkin`].
    pub fn checkout(&mut self, address: &str) -> Result<Connection> {
        self.evict_if_closed(address);
        match self.connections.remove(address) {
            Some(conn) => Ok(conn),
            None => Connection::open(address),
        }
    }

    /// Return a connection after a run; closed connections are dropped
    pub fn checkin(&mut self, conn: Connection) {
        if conn.is_closed() {
            debug!("evicting closed connection to {}", conn.address());
            return;
        }
        self.connections.insert(SmolStr::new(conn.address()), conn);
    }

    /// Drop the cached connection for `address`
    pub fn evict(&mut self, address: &str) -> bool {
        self.connections.remove(address).is_some()
    }

    fn evict_if_closed(&mut self, address: &str) {
        if self.connections.get(address).is_some_and(|c| c.is_closed()) {
            debug!("evicting closed connection to {}", address);
            self.connections.remove(address);
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.connections.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and forget every cached connection
    pub fn close_all(&mut self) {
        for (_, mut conn) in self.connections.drain() {
            conn.close();
        }
    }
}
