//! In-process RESP server used by the integration tests.
//!
//! Each accepted connection gets its own thread; all connections of one
//! server share a key space. Behaviour can be switched at runtime to
//! simulate slow, silent or dying servers.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use ignix_client::protocol::{write_array_len, write_bulk};
use ignix_client::{decode_next_reply, Reply, DEFAULT_MAX_BULK_LEN};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// Read requests, never answer
    Silent,
    /// Sleep before every reply
    Delay(Duration),
    /// Drop the connection when an MGET arrives
    CloseOnMget,
}

type Store = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

pub struct MockServer {
    addr: String,
    store: Store,
    mode: Arc<Mutex<Mode>>,
    accepted: Arc<AtomicUsize>,
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

impl MockServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Store = Arc::default();
        let mode = Arc::new(Mutex::new(Mode::Normal));
        let accepted = Arc::new(AtomicUsize::new(0));

        let (s, m, a) = (store.clone(), mode.clone(), accepted.clone());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                a.fetch_add(1, Ordering::SeqCst);
                let (s, m) = (s.clone(), m.clone());
                thread::spawn(move || serve(stream, s, m));
            }
        });

        Self {
            addr,
            store,
            mode,
            accepted,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.store.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }
}

fn serve(mut stream: TcpStream, store: Store, mode: Arc<Mutex<Mode>>) {
    let mut inbound = BytesMut::new();
    let mut tmp = vec![0u8; 64 * 1024];
    loop {
        let n = match stream.read(&mut tmp) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        inbound.extend_from_slice(&tmp[..n]);

        while let Some(args) = next_command(&mut inbound) {
            let mode = *mode.lock().unwrap();
            let name = args[0].to_ascii_uppercase();
            match mode {
                Mode::Silent => continue,
                Mode::CloseOnMget if name == b"MGET" => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
                Mode::Delay(d) => thread::sleep(d),
                _ => {}
            }

            let mut out = BytesMut::new();
            exec(&store, &name, &args[1..], &mut out);
            if stream.write_all(&out).is_err() {
                return;
            }
        }
    }
}

/// Pull one complete request off the buffer, leaving partial ones in place
fn next_command(inbound: &mut BytesMut) -> Option<Vec<Bytes>> {
    let mut probe = inbound.clone();
    let n = match decode_next_reply(&mut probe, DEFAULT_MAX_BULK_LEN).ok()?? {
        Reply::MultiBulk(n) if n > 0 => n,
        other => panic!("unexpected request frame {:?}", other),
    };
    let mut args = Vec::with_capacity(n);
    for _ in 0..n {
        match decode_next_reply(&mut probe, DEFAULT_MAX_BULK_LEN).ok()?? {
            Reply::Bulk(arg) => args.push(arg),
            other => panic!("unexpected request argument {:?}", other),
        }
    }
    *inbound = probe;
    Some(args)
}

fn exec(store: &Store, name: &[u8], args: &[Bytes], out: &mut BytesMut) {
    let mut dict = store.lock().unwrap();
    match (name, args) {
        (b"PING", []) => out.extend_from_slice(b"+PONG\r\n"),
        (b"GET", [k]) => match dict.get(&k[..]) {
            Some(v) => write_bulk(v, out),
            None => out.extend_from_slice(b"$-1\r\n"),
        },
        (b"SET", [k, v]) => {
            dict.insert(k.to_vec(), v.to_vec());
            out.extend_from_slice(b"+OK\r\n");
        }
        (b"DEL", [k]) => {
            let removed = dict.remove(&k[..]).is_some() as i64;
            out.extend_from_slice(format!(":{}\r\n", removed).as_bytes());
        }
        (b"INCR", [k]) => {
            let current = dict.get(&k[..]).cloned().unwrap_or_else(|| b"0".to_vec());
            match std::str::from_utf8(&current).ok().and_then(|s| s.parse::<i64>().ok()) {
                Some(n) => {
                    dict.insert(k.to_vec(), (n + 1).to_string().into_bytes());
                    out.extend_from_slice(format!(":{}\r\n", n + 1).as_bytes());
                }
                None => out.extend_from_slice(b"-ERR value is not an integer or out of range\r\n"),
            }
        }
        (b"MGET", keys) if !keys.is_empty() => {
            write_array_len(keys.len(), out);
            for k in keys {
                match dict.get(&k[..]) {
                    Some(v) => write_bulk(v, out),
                    None => out.extend_from_slice(b"$-1\r\n"),
                }
            }
        }
        (b"MSET", pairs) if !pairs.is_empty() && pairs.len() % 2 == 0 => {
            for kv in pairs.chunks(2) {
                dict.insert(kv[0].to_vec(), kv[1].to_vec());
            }
            out.extend_from_slice(b"+OK\r\n");
        }
        _ => out.extend_from_slice(
            format!("-ERR unknown command '{}'\r\n", String::from_utf8_lossy(name)).as_bytes(),
        ),
    }
}
