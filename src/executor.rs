/*!
 * Batch Executor
 *
 * Drives a set of (connection, batch) pairs to completion on one thread.
 * Every stream is registered with a single `mio::Poll`; writes go out as the
 * sockets accept them and replies are decoded into their batch as they
 * arrive. A run ends when every batch has all its reply frames, when the
 * deadline passes, or on the first connection or protocol failure.
 */

use crate::batch::Batch;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::protocol::{self, DEFAULT_MAX_BULK_LEN};
use log::{debug, trace, warn};
use mio::event::Event;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use smol_str::SmolStr;
use std::io;
use std::time::{Duration, Instant};

/// Readiness events fetched per poll
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Accepting submissions
    Idle,
    /// Request bytes still being written
    Dispatching,
    /// Everything written, waiting for replies
    Draining,
    Completed,
    TimedOut,
    Failed,
}

impl RunState {
    pub fn is_finished(self) -> bool {
        matches!(self, RunState::Completed | RunState::TimedOut | RunState::Failed)
    }
}

#[derive(Debug)]
struct Pair {
    conn: Connection,
    batch: Batch,
    /// Registered with WRITABLE interest
    writable: bool,
    /// Request bytes handed to the connection in this run
    dispatched: bool,
}

/// One-shot executor for pipelined batches
#[derive(Debug)]
pub struct Executor {
    pairs: Slab<Pair>,
    state: RunState,
    max_bulk_len: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            pairs: Slab::new(),
            state: RunState::Idle,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
        }
    }

    /// Reject bulk payloads longer than `max` bytes
    pub fn with_max_bulk_len(mut self, max: usize) -> Self {
        self.max_bulk_len = max;
        self
    }

    /// Hand over a connection and the batch to send on it
    ///
    /// # Returns
    /// * the index of the pair in [`Executor::into_parts`]
    pub fn submit(&mut self, conn: Connection, batch: Batch) -> Result<usize> {
        if self.state != RunState::Idle {
            return Err(Error::ExecutorMisuse("submit after run"));
        }
        if conn.is_closed() {
            return Err(Error::ConnectionClosed(SmolStr::new(conn.address())));
        }
        Ok(self.pairs.insert(Pair {
            conn,
            batch,
            writable: false,
            dispatched: false,
        }))
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn batch(&self, index: usize) -> Option<&Batch> {
        self.pairs.get(index).map(|p| &p.batch)
    }

    /// Send every batch and wait for all replies, at most `timeout`
    ///
    /// On timeout the connections stay open; the replies still owed to
    /// their unfinished batches are skipped by the next run that uses them.
    /// On failure the failing connection is closed.
    pub fn run(&mut self, timeout: Duration) -> Result<()> {
        if self.state != RunState::Idle {
            return Err(Error::ExecutorMisuse("run called twice"));
        }
        self.state = RunState::Dispatching;
        debug!("executor run: {} batches, timeout {:?}", self.pairs.len(), timeout);

        let mut poll = match Poll::new() {
            Ok(p) => p,
            Err(e) => {
                self.state = RunState::Failed;
                return Err(Error::Poll(e));
            }
        };
        let deadline = Instant::now() + timeout;
        let result = self.drive(&mut poll, deadline, timeout);
        self.finish(&poll, &result);
        result
    }

    fn drive(&mut self, poll: &mut Poll, deadline: Instant, timeout: Duration) -> Result<()> {
        let max_bulk_len = self.max_bulk_len;

        for (key, pair) in self.pairs.iter_mut() {
            // Bytes left over from an earlier run may already hold replies
            if let Err(e) = drain(pair, max_bulk_len) {
                pair.conn.close();
                return Err(e);
            }
            let bytes = pair.batch.take_write_buffer();
            pair.conn.enqueue_write(&bytes);
            pair.dispatched = true;

            let stream = match pair.conn.stream_mut() {
                Some(s) => s,
                None => return Err(Error::ConnectionClosed(SmolStr::new(pair.conn.address()))),
            };
            poll.registry()
                .register(stream, Token(key), Interest::READABLE | Interest::WRITABLE)
                .map_err(Error::Poll)?;
            pair.writable = true;

            if let Err(e) = pair.conn.pump_write() {
                pair.conn.close();
                return Err(e);
            }
        }

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if self.pairs.iter().all(|(_, p)| p.batch.is_complete()) {
                return Ok(());
            }
            if self.state == RunState::Dispatching
                && self.pairs.iter().all(|(_, p)| !p.conn.has_pending_write())
            {
                trace!("all requests written, draining");
                self.state = RunState::Draining;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            match poll.poll(&mut events, Some(deadline - now)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Poll(e)),
            }

            for ev in events.iter() {
                let Token(key) = ev.token();
                let pair = match self.pairs.get_mut(key) {
                    Some(p) => p,
                    None => continue,
                };
                if pair.batch.is_complete() && !pair.conn.has_pending_write() {
                    continue;
                }
                if let Err(e) = service(pair, ev, max_bulk_len) {
                    pair.conn.close();
                    return Err(e);
                }

                // Drop WRITABLE interest once the request is flushed
                if pair.writable
                    && !pair.conn.has_pending_write()
                    && pair.conn.state() == ConnectionState::Connected
                {
                    if let Some(stream) = pair.conn.stream_mut() {
                        poll.registry()
                            .reregister(stream, Token(key), Interest::READABLE)
                            .map_err(Error::Poll)?;
                        pair.writable = false;
                    }
                }
            }
        }
    }

    /// Deregister streams and settle connection bookkeeping after a run
    fn finish(&mut self, poll: &Poll, result: &Result<()>) {
        for (_, pair) in self.pairs.iter_mut() {
            if let Some(stream) = pair.conn.stream_mut() {
                let _ = poll.registry().deregister(stream);
            }
            if pair.conn.peer_closed() {
                pair.conn.close();
                continue;
            }
            // Pairs never dispatched owe nothing on their socket
            if pair.dispatched && !pair.conn.is_closed() && !pair.batch.is_complete() {
                pair.conn.add_stale_frames(pair.batch.expected_frames());
            }
        }

        self.state = match result {
            Ok(()) => RunState::Completed,
            Err(Error::Timeout(_)) => RunState::TimedOut,
            Err(_) => RunState::Failed,
        };
        match result {
            Ok(()) => debug!("executor run completed"),
            Err(e) => warn!("executor run {:?}: {}", self.state, e),
        }
    }

    /// Give back every pair in submission order
    pub fn into_parts(self) -> Vec<(Connection, Batch)> {
        self.pairs
            .into_iter()
            .map(|(_, p)| (p.conn, p.batch))
            .collect()
    }
}

/// React to one readiness event for a pair
fn service(pair: &mut Pair, ev: &Event, max_bulk_len: usize) -> Result<()> {
    if ev.is_writable() || ev.is_error() {
        pair.conn.pump_write()?;
    }
    if ev.is_readable() || ev.is_read_closed() || ev.is_error() {
        pair.conn.pump_read()?;
        drain(pair, max_bulk_len)?;
        if pair.conn.peer_closed() && !pair.batch.is_complete() {
            return Err(Error::ConnectionClosed(SmolStr::new(pair.conn.address())));
        }
    }
    Ok(())
}

/// Decode buffered frames into the batch until it is complete or the input
/// runs dry; frames owed to abandoned commands are dropped first
fn drain(pair: &mut Pair, max_bulk_len: usize) -> Result<()> {
    let Pair { conn, batch, .. } = pair;
    while !batch.is_complete() {
        match protocol::decode_next_reply(conn.inbound_mut(), max_bulk_len)? {
            Some(reply) if conn.stale_frames() > 0 => {
                trace!("{}: discarding stale frame", conn.address());
                conn.discard_stale_frame(reply.child_count());
            }
            Some(reply) => batch.push_reply(reply),
            None => break,
        }
    }
    if batch.is_complete() && conn.stale_frames() == 0 && !conn.inbound().is_empty() {
        return Err(Error::corruption(format!(
            "{} unexpected bytes after the last reply",
            conn.inbound().len()
        )));
    }
    Ok(())
}
