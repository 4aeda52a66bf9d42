// Core modules for the Ignix sharded client
pub mod error; // Error + ErrorKind + Result alias
pub mod protocol; // RESP reply decoder + command encoders
pub mod ring; // HashRing (ketama continuum over XXH3)
pub mod batch; // Batch: pipelined commands + decoded replies
pub mod connection; // Connection: non-blocking socket + buffers
pub mod manager; // ConnectionManager: per-address connection cache
pub mod executor; // Executor: mio poll loop driving batches
pub mod config; // ClientConfig + server list parsing
pub mod client; // ShardedClient: get/set/mget/... over the ring

// Re-export the public API for easier access
pub use batch::Batch;
pub use client::{CallOptions, ShardedClient, ValueMap};
pub use config::{parse_servers, ClientConfig, DEFAULT_TIMEOUT, DEFAULT_WEIGHT};
pub use connection::{Connection, ConnectionState, DEFAULT_PORT};
pub use error::{Error, ErrorKind, Result};
pub use executor::{Executor, RunState};
pub use manager::ConnectionManager;
pub use protocol::{decode_next_reply, Reply, DEFAULT_MAX_BULK_LEN};
pub use ring::{hash_key, ContinuumPoint, HashRing, Server};

// Default server address - Redis-compatible port 7379
pub const DEFAULT_ADDR: &str = "127.0.0.1:7379";
