/*!
 * Command Batches
 *
 * A batch collects pipelined commands for one server. While it is being
 * built it owns the encoded request bytes; once handed to the executor the
 * bytes move to the connection and the batch only collects reply frames
 * until every command has been answered.
 */

use crate::protocol::{self, Reply};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Initial outbound buffer size (4 KiB)
const DEFAULT_WRITE_BUFF_SIZE: usize = 4 * 1024;

/// Pipelined commands for a single connection and the replies they produce
#[derive(Debug, Default)]
pub struct Batch {
    /// Encoded commands not yet handed to a connection
    buffer: BytesMut,
    /// Commands written that have not produced a top-level reply
    pending: usize,
    /// Declared multi-bulk children not yet decoded
    children: usize,
    /// Keys carried by multi-key commands, in argument order
    keys: Vec<Bytes>,
    /// Decoded frames waiting to be consumed
    replies: VecDeque<Reply>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_WRITE_BUFF_SIZE),
            ..Self::default()
        }
    }

    /// Append already formatted protocol bytes holding `commands` commands
    ///
    /// Several calls may contribute to one command; only the call that
    /// completes it should count it.
    pub fn write_raw(&mut self, bytes: &[u8], commands: usize) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self.add_commands(commands);
        self
    }

    /// Append one command made of `args`, command name first
    pub fn write_command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> &mut Self {
        protocol::write_command(args, &mut self.buffer);
        self.add_commands(1);
        self
    }

    pub fn get(&mut self, key: &[u8]) -> &mut Self {
        protocol::encode_get(key, &mut self.buffer);
        self.add_commands(1);
        self
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        protocol::encode_set(key, value, &mut self.buffer);
        self.add_commands(1);
        self
    }

    pub fn del(&mut self, key: &[u8]) -> &mut Self {
        protocol::encode_del(key, &mut self.buffer);
        self.add_commands(1);
        self
    }

    pub fn incr(&mut self, key: &[u8]) -> &mut Self {
        protocol::encode_incr(key, &mut self.buffer);
        self.add_commands(1);
        self
    }

    pub fn ping(&mut self) -> &mut Self {
        protocol::encode_ping(&mut self.buffer);
        self.add_commands(1);
        self
    }

    /// One MGET over `keys`; the keys are remembered for result zipping
    pub fn mget(&mut self, keys: &[Bytes]) -> &mut Self {
        protocol::encode_mget(keys, &mut self.buffer);
        self.keys.extend(keys.iter().cloned());
        self.add_commands(1);
        self
    }

    /// One MSET over `pairs`; the keys are remembered in argument order
    pub fn mset(&mut self, pairs: &[(Bytes, Bytes)]) -> &mut Self {
        protocol::encode_mset(pairs, &mut self.buffer);
        self.keys.extend(pairs.iter().map(|(k, _)| k.clone()));
        self.add_commands(1);
        self
    }

    /// Remember a key without writing anything
    pub fn push_key(&mut self, key: Bytes) -> &mut Self {
        self.keys.push(key);
        self
    }

    #[inline]
    fn add_commands(&mut self, n: usize) {
        self.pending += n;
    }

    /// Keys associated with multi-key commands, in order
    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    /// Commands still waiting for their reply
    #[inline]
    pub fn pending_commands(&self) -> usize {
        self.pending
    }

    /// Reply frames still expected, children of open multi-bulks included
    #[inline]
    pub fn expected_frames(&self) -> usize {
        self.pending + self.children
    }

    /// All replies, nested children included, have been decoded
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.expected_frames() == 0
    }

    /// Encoded bytes not yet handed to a connection
    pub fn write_buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Move the encoded commands out for sending
    pub(crate) fn take_write_buffer(&mut self) -> BytesMut {
        self.buffer.split()
    }

    /// Record one decoded frame
    ///
    /// Frames fill open multi-bulks first; a frame outside any multi-bulk
    /// answers one command.
    pub(crate) fn push_reply(&mut self, reply: Reply) {
        if self.children > 0 {
            self.children -= 1;
        } else {
            self.pending = self.pending.saturating_sub(1);
        }
        self.children += reply.child_count();
        self.replies.push_back(reply);
    }

    /// Number of decoded frames not yet consumed
    pub fn replies_available(&self) -> usize {
        self.replies.len()
    }

    /// Pop the next decoded frame in stream order
    ///
    /// After a `MultiBulk(n)` the next `n` frames are its children.
    pub fn next_reply(&mut self) -> Option<Reply> {
        self.replies.pop_front()
    }
}
