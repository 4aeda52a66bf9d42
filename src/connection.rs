/*!
 * Server Connection
 *
 * One non-blocking TCP socket to one server address, together with the
 * inbound and outbound byte buffers it exclusively owns. The connection never
 * blocks: writes and reads go as far as the kernel allows and the executor
 * waits for readiness in between.
 */

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use log::{debug, trace};
use mio::net::TcpStream;
use smol_str::SmolStr;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Size of the stack buffer used for each socket read
const READ_BUF: usize = 16 * 1024;

/// Port used when an address carries none
pub const DEFAULT_PORT: u16 = 7379;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Non-blocking connect issued, not yet confirmed
    Connecting,
    Connected,
    Closed,
}

/// A connection to one server
#[derive(Debug)]
pub struct Connection {
    address: SmolStr,
    stream: Option<TcpStream>,
    state: ConnectionState,
    inbound: BytesMut,
    outbound: BytesMut,
    /// Peer sent EOF; buffered bytes may still be decoded
    peer_closed: bool,
    /// Reply frames of abandoned commands still due on this socket
    stale_frames: usize,
}

impl Connection {
    /// Resolve `address` and start a non-blocking connect
    ///
    /// A connect still in progress is normal; completion is checked on the
    /// first write.
    pub fn open(address: &str) -> Result<Self> {
        let addr = resolve(address)?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| connect_failed(address, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| connect_failed(address, e))?;
        socket.set_nodelay(true).ok();
        socket.set_keepalive(true).ok();

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(ref e) if connect_in_progress(e) => {}
            Err(e) => return Err(connect_failed(address, e)),
        }
        debug!("connecting to {} ({})", address, addr);

        let stream = TcpStream::from_std(socket.into());
        Ok(Self {
            address: SmolStr::new(address),
            stream: Some(stream),
            state: ConnectionState::Connecting,
            inbound: BytesMut::with_capacity(READ_BUF),
            outbound: BytesMut::new(),
            peer_closed: false,
            stale_frames: 0,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Peer has sent EOF
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Queue bytes for sending
    pub fn enqueue_write(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    #[inline]
    pub fn has_pending_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Bytes received and not yet decoded
    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    pub(crate) fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub(crate) fn stale_frames(&self) -> usize {
        self.stale_frames
    }

    pub(crate) fn add_stale_frames(&mut self, n: usize) {
        self.stale_frames += n;
    }

    /// Account one discarded frame carrying `children` more frames
    pub(crate) fn discard_stale_frame(&mut self, children: usize) {
        self.stale_frames = self.stale_frames.saturating_sub(1) + children;
    }

    /// Finish a pending connect if the socket reports one
    ///
    /// # Returns
    /// * `true` once connected
    fn finish_connect(&mut self) -> Result<bool> {
        if self.state != ConnectionState::Connecting {
            return Ok(self.state == ConnectionState::Connected);
        }
        let stream = match self.stream.as_ref() {
            Some(s) => s,
            None => return Err(Error::ConnectionClosed(self.address.clone())),
        };
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                let err = connect_failed(&self.address, e);
                self.close();
                return Err(err);
            }
        }
        match stream.peer_addr() {
            Ok(_) => {
                debug!("connected to {}", self.address);
                self.state = ConnectionState::Connected;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected || would_block(e) => Ok(false),
            Err(e) => {
                let err = connect_failed(&self.address, e);
                self.close();
                Err(err)
            }
        }
    }

    /// Send as much of the outbound buffer as the socket accepts
    ///
    /// # Returns
    /// * number of bytes written; 0 while the connect is still in progress
    pub fn pump_write(&mut self) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.address.clone()));
        }
        if !self.finish_connect()? {
            return Ok(0);
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(Error::ConnectionClosed(self.address.clone())),
        };

        let mut written = 0;
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => {
                    let addr = self.address.clone();
                    self.close();
                    return Err(Error::ConnectionClosed(addr));
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    written += n;
                }
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    let err = Error::Io {
                        address: self.address.clone(),
                        source: e,
                    };
                    self.close();
                    return Err(err);
                }
            }
        }
        trace!("{}: wrote {} bytes, {} pending", self.address, written, self.outbound.len());
        Ok(written)
    }

    /// Receive everything the socket has into the inbound buffer
    ///
    /// EOF after some data is remembered and reported on the next call, so
    /// the bytes that came with it can still be decoded.
    pub fn pump_read(&mut self) -> Result<usize> {
        if self.is_closed() || self.peer_closed {
            let addr = self.address.clone();
            self.close();
            return Err(Error::ConnectionClosed(addr));
        }
        if !self.finish_connect()? {
            return Ok(0);
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(Error::ConnectionClosed(self.address.clone())),
        };

        let mut tmp_buf = [0u8; READ_BUF];
        let mut total = 0;
        loop {
            match stream.read(&mut tmp_buf) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&tmp_buf[..n]);
                    total += n;
                }
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    let err = Error::Io {
                        address: self.address.clone(),
                        source: e,
                    };
                    self.close();
                    return Err(err);
                }
            }
        }

        if total == 0 && self.peer_closed {
            debug!("{}: closed by peer", self.address);
            let addr = self.address.clone();
            self.close();
            return Err(Error::ConnectionClosed(addr));
        }
        trace!("{}: read {} bytes", self.address, total);
        Ok(total)
    }

    /// Release the socket and buffered data; safe to call repeatedly
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!("closing connection to {}", self.address);
        self.stream = None;
        self.state = ConnectionState::Closed;
        self.inbound.clear();
        self.outbound.clear();
        self.stale_frames = 0;
    }
}

/// Resolve `host[:port]`, falling back to [`DEFAULT_PORT`]
fn resolve(address: &str) -> Result<SocketAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    let target = if has_port(address) {
        address.to_string()
    } else {
        format!("{}:{}", address, DEFAULT_PORT)
    };
    target
        .to_socket_addrs()
        .map_err(|e| connect_failed(address, e))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(address.to_string()))
}

fn has_port(address: &str) -> bool {
    if address.starts_with('[') {
        return address.contains("]:");
    }
    match address.rsplit_once(':') {
        Some((host, port)) => {
            !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn connect_failed(address: &str, source: io::Error) -> Error {
    Error::ConnectFailed {
        address: SmolStr::new(address),
        source,
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    would_block(e)
}

/// Check if an I/O error indicates the operation would block
#[inline]
fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
