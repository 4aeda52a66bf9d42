/*!
 * Sharded Client
 *
 * Routes each key to its server through the hash ring, batches commands
 * per server and drives every batch of a call through one executor run.
 * Multi-key calls are all-or-nothing: any failing shard fails the call and
 * no partial result is returned.
 */

use crate::batch::Batch;
use crate::config::ClientConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::Executor;
use crate::manager::ConnectionManager;
use crate::protocol::Reply;
use crate::ring::HashRing;
use bytes::Bytes;
use log::debug;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::time::Duration;

type AHash = BuildHasherDefault<ahash::AHasher>;

/// Values returned by [`ShardedClient::mget`], `None` for missing keys
pub type ValueMap = HashMap<Bytes, Option<Bytes>, AHash>;

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Route by this key instead of the command's own keys
    pub server_key: Option<Bytes>,
    /// Deadline for this call instead of the configured default
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_key(mut self, key: impl Into<Bytes>) -> Self {
        self.server_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Client for a fixed set of weighted servers
#[derive(Debug)]
pub struct ShardedClient {
    ring: HashRing,
    manager: ConnectionManager,
    config: ClientConfig,
}

impl ShardedClient {
    /// Validate `config` and build its ring; no connection is opened yet
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let ring = config.build_ring()?;
        Ok(Self {
            ring,
            manager: ConnectionManager::new(),
            config,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Drop every cached connection
    pub fn close(&mut self) {
        self.manager.close_all();
    }

    fn shard_for(&self, key: &[u8], opts: &CallOptions) -> Result<usize> {
        self.ring.resolve(opts.server_key.as_deref().unwrap_or(key))
    }

    fn timeout(&self, opts: &CallOptions) -> Duration {
        opts.timeout.unwrap_or(self.config.timeout)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.get_with(key, &CallOptions::default())
    }

    pub fn get_with(&mut self, key: &[u8], opts: &CallOptions) -> Result<Option<Bytes>> {
        let mut batch = Batch::new();
        batch.get(key);
        self.single(key, batch, opts, |batch| match next_reply(batch)? {
            Reply::Bulk(value) => Ok(Some(value)),
            Reply::BulkNil => Ok(None),
            other => Err(unexpected("GET", &other)),
        })
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.set_with(key, value, &CallOptions::default())
    }

    pub fn set_with(&mut self, key: &[u8], value: &[u8], opts: &CallOptions) -> Result<()> {
        let mut batch = Batch::new();
        batch.set(key, value);
        self.single(key, batch, opts, expect_ok("SET"))
    }

    /// Delete `key`; `true` if it existed
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        self.del_with(key, &CallOptions::default())
    }

    pub fn del_with(&mut self, key: &[u8], opts: &CallOptions) -> Result<bool> {
        let mut batch = Batch::new();
        batch.del(key);
        self.single(key, batch, opts, |batch| match next_reply(batch)? {
            Reply::Integer(n) => Ok(n > 0),
            other => Err(unexpected("DEL", &other)),
        })
    }

    pub fn incr(&mut self, key: &[u8]) -> Result<i64> {
        self.incr_with(key, &CallOptions::default())
    }

    pub fn incr_with(&mut self, key: &[u8], opts: &CallOptions) -> Result<i64> {
        let mut batch = Batch::new();
        batch.incr(key);
        self.single(key, batch, opts, |batch| match next_reply(batch)? {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected("INCR", &other)),
        })
    }

    /// Fetch many keys with one MGET per involved server
    pub fn mget<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<ValueMap> {
        self.mget_with(keys, &CallOptions::default())
    }

    pub fn mget_with<K: AsRef<[u8]>>(&mut self, keys: &[K], opts: &CallOptions) -> Result<ValueMap> {
        let mut values = ValueMap::with_capacity_and_hasher(keys.len(), AHash::default());
        if keys.is_empty() {
            return Ok(values);
        }

        let groups = self.group(keys.iter().map(|k| Bytes::copy_from_slice(k.as_ref())), opts)?;
        debug!("MGET of {} keys over {} servers", keys.len(), groups.len());
        let work = groups
            .into_iter()
            .map(|(ordinal, keys)| {
                let mut batch = Batch::new();
                batch.mget(&keys);
                (ordinal, batch)
            })
            .collect();

        self.run_batches(work, self.timeout(opts), |batch| {
            let n = match next_reply(batch)? {
                Reply::MultiBulk(n) => n,
                other => return Err(unexpected("MGET", &other)),
            };
            if n != batch.keys().len() {
                return Err(Error::corruption(format!(
                    "MGET returned {} values for {} keys",
                    n,
                    batch.keys().len()
                )));
            }
            for i in 0..n {
                let value = match batch.next_reply() {
                    Some(Reply::Bulk(v)) => Some(v),
                    Some(Reply::BulkNil) => None,
                    Some(other) => return Err(unexpected("MGET element", &other)),
                    None => return Err(Error::corruption("MGET reply truncated")),
                };
                values.insert(batch.keys()[i].clone(), value);
            }
            Ok(())
        })?;
        Ok(values)
    }

    /// Store many pairs with one MSET per involved server
    pub fn mset<K, V>(&mut self, pairs: &[(K, V)]) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.mset_with(pairs, &CallOptions::default())
    }

    pub fn mset_with<K, V>(&mut self, pairs: &[(K, V)], opts: &CallOptions) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        if pairs.is_empty() {
            return Ok(());
        }
        let groups = self.group(
            pairs.iter().map(|(k, v)| {
                (
                    Bytes::copy_from_slice(k.as_ref()),
                    Bytes::copy_from_slice(v.as_ref()),
                )
            }),
            opts,
        )?;
        let work = groups
            .into_iter()
            .map(|(ordinal, pairs)| {
                let mut batch = Batch::new();
                batch.mset(&pairs);
                (ordinal, batch)
            })
            .collect();
        self.run_batches(work, self.timeout(opts), expect_ok("MSET"))?;
        Ok(())
    }

    /// PING every server in one run
    pub fn ping_all(&mut self) -> Result<()> {
        let work = (0..self.ring.len())
            .map(|ordinal| {
                let mut batch = Batch::new();
                batch.ping();
                (ordinal, batch)
            })
            .collect();
        self.run_batches(work, self.config.timeout, expect_ok("PING"))?;
        Ok(())
    }

    /// Send an arbitrary batch to the server owning `server_key`
    ///
    /// The batch comes back holding every reply frame; error replies are
    /// left for the caller to inspect.
    pub fn execute(&mut self, server_key: &[u8], batch: Batch) -> Result<Batch> {
        self.execute_with(server_key, batch, &CallOptions::default())
    }

    pub fn execute_with(&mut self, server_key: &[u8], batch: Batch, opts: &CallOptions) -> Result<Batch> {
        self.single(server_key, batch, opts, |batch| Ok(std::mem::take(batch)))
    }

    fn single<T, F>(&mut self, key: &[u8], batch: Batch, opts: &CallOptions, decode: F) -> Result<T>
    where
        F: FnMut(&mut Batch) -> Result<T>,
    {
        let ordinal = self.shard_for(key, opts)?;
        let mut out = self.run_batches(vec![(ordinal, batch)], self.timeout(opts), decode)?;
        out.pop()
            .ok_or(Error::ExecutorMisuse("run returned no batch"))
    }

    /// Bucket items by the shard of their key, keeping first-seen order
    fn group<T, I>(&self, items: I, opts: &CallOptions) -> Result<Vec<(usize, Vec<T>)>>
    where
        I: Iterator<Item = T>,
        T: ShardKey,
    {
        let mut slots: FxHashMap<usize, usize> = FxHashMap::default();
        let mut groups: Vec<(usize, Vec<T>)> = Vec::new();
        for item in items {
            let ordinal = self.shard_for(item.shard_key(), opts)?;
            let slot = *slots.entry(ordinal).or_insert_with(|| {
                groups.push((ordinal, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(item);
        }
        Ok(groups)
    }

    /// Run one batch per entry of `work` and decode each in order
    ///
    /// Connections are checked out for the run and always checked back in;
    /// a connection whose replies could not be decoded is closed first.
    fn run_batches<T, F>(&mut self, work: Vec<(usize, Batch)>, timeout: Duration, mut decode: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Batch) -> Result<T>,
    {
        let mut exec = Executor::new().with_max_bulk_len(self.config.max_bulk_len);
        let mut submitted = Ok(());
        for (ordinal, batch) in work {
            let conn = self
                .ring
                .server_address(ordinal)
                .and_then(|address| self.manager.checkout(address));
            submitted = conn.and_then(|conn| exec.submit(conn, batch)).map(|_| ());
            if submitted.is_err() {
                break;
            }
        }

        let run = submitted.and_then(|()| exec.run(timeout));
        let mut out = Vec::with_capacity(exec.len());
        let mut failure = None;
        for (mut conn, mut batch) in exec.into_parts() {
            if run.is_ok() && failure.is_none() {
                match decode(&mut batch) {
                    Ok(v) => out.push(v),
                    Err(e) => {
                        if e.kind() == ErrorKind::Corruption {
                            conn.close();
                        }
                        failure = Some(e);
                    }
                }
            }
            self.manager.checkin(conn);
        }

        run?;
        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

/// Routing key of a grouped item
trait ShardKey {
    fn shard_key(&self) -> &[u8];
}

impl ShardKey for Bytes {
    fn shard_key(&self) -> &[u8] {
        self
    }
}

impl ShardKey for (Bytes, Bytes) {
    fn shard_key(&self) -> &[u8] {
        &self.0
    }
}

/// Pop the next frame, turning an error reply into [`Error::Server`]
fn next_reply(batch: &mut Batch) -> Result<Reply> {
    batch
        .next_reply()
        .ok_or_else(|| Error::corruption("missing reply"))?
        .into_result()
}

fn expect_ok(command: &'static str) -> impl FnMut(&mut Batch) -> Result<()> {
    move |batch| match next_reply(batch)? {
        Reply::Ok(_) => Ok(()),
        other => Err(unexpected(command, &other)),
    }
}

fn unexpected(command: &str, reply: &Reply) -> Error {
    Error::corruption(format!("unexpected reply to {}: {:?}", command, reply))
}
