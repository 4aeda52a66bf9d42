/*!
 * Redis RESP Protocol Codec (client side)
 *
 * This module encodes commands into the unified multi-bulk request format
 * and decodes the reply stream coming back from a server, one frame at a
 * time. Multi-bulk replies are reported as a header carrying the child count;
 * the children follow as ordinary frames, so a pipelined stream is always
 * consumed strictly in order.
 */

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Largest bulk payload accepted from a server (512 MiB, same as Redis)
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Longest header line (type byte, digits, sign) tolerated before CRLF
const MAX_HEADER_LINE: usize = 64;

/// A single decoded reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status reply (`+OK\r\n`, `+PONG\r\n`); holds the status text
    Ok(Bytes),
    /// Error reply (`-ERR ...\r\n`); holds the message
    Error(Bytes),
    /// Null bulk (`$-1\r\n`), e.g. GET on a missing key
    BulkNil,
    /// Bulk payload
    Bulk(Bytes),
    /// Null multi-bulk (`*-1\r\n`)
    MultiBulkNil,
    /// Multi-bulk header; exactly this many child frames follow
    MultiBulk(usize),
    /// Integer reply (`:42\r\n`)
    Integer(i64),
}

impl Reply {
    /// Number of child frames that follow this one in the stream
    #[inline]
    pub fn child_count(&self) -> usize {
        match self {
            Reply::MultiBulk(n) => *n,
            _ => 0,
        }
    }

    /// Turn an error reply into [`Error::Server`], pass everything else through
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(msg) => Err(Error::Server(msg)),
            other => Ok(other),
        }
    }
}

/// Decode the next reply frame from the start of `buf`
///
/// # Returns
/// * `Ok(Some(reply))` - one frame decoded; its bytes were split off `buf`
/// * `Ok(None)` - incomplete frame, `buf` is left untouched
/// * `Err(ProtocolCorruption)` - the stream cannot be trusted any more
pub fn decode_next_reply(buf: &mut BytesMut, max_bulk_len: usize) -> Result<Option<Reply>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let type_byte = buf[0];
    if !matches!(type_byte, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(Error::corruption(format!(
            "unexpected reply type byte 0x{:02x}",
            type_byte
        )));
    }
    // Status and error lines carry free text, only numeric headers are capped
    let free_text = matches!(type_byte, b'+' | b'-');
    let (line_len, header) = match read_line(&buf[1..], free_text)? {
        Some(x) => x,
        None => return Ok(None),
    };
    // type byte + line + CRLF
    let header_len = 1 + line_len + 2;

    let reply = match type_byte {
        b'+' => {
            let mut frame = buf.split_to(header_len);
            frame.truncate(header_len - 2);
            Reply::Ok(frame.split_off(1).freeze())
        }
        b'-' => {
            let mut frame = buf.split_to(header_len);
            frame.truncate(header_len - 2);
            Reply::Error(frame.split_off(1).freeze())
        }
        b':' => {
            let v = parse_decimal(header)?;
            let _ = buf.split_to(header_len);
            Reply::Integer(v)
        }
        b'$' => {
            let len = parse_length(header, max_bulk_len)?;
            match len {
                None => {
                    let _ = buf.split_to(header_len);
                    Reply::BulkNil
                }
                Some(len) => {
                    // Need payload + trailing CRLF
                    let need = header_len + len + 2;
                    if buf.len() < need {
                        return Ok(None);
                    }
                    if &buf[header_len + len..need] != b"\r\n" {
                        return Err(Error::corruption("bulk payload not terminated by CRLF"));
                    }
                    let _ = buf.split_to(header_len);
                    let payload = buf.split_to(len).freeze();
                    let _ = buf.split_to(2);
                    Reply::Bulk(payload)
                }
            }
        }
        b'*' => {
            let count = parse_length(header, max_bulk_len)?;
            let _ = buf.split_to(header_len);
            match count {
                None => Reply::MultiBulkNil,
                Some(n) => Reply::MultiBulk(n),
            }
        }
        _ => unreachable!("type byte validated above"),
    };
    Ok(Some(reply))
}

/// Find the CRLF terminating a header line
///
/// # Returns
/// * `(line_length_without_crlf, line)` or `None` if CRLF not yet received
fn read_line(s: &[u8], free_text: bool) -> Result<Option<(usize, &[u8])>> {
    let scan = if free_text {
        s.len()
    } else {
        s.len().min(MAX_HEADER_LINE + 2)
    };
    match s[..scan].iter().position(|&c| c == b'\r') {
        Some(i) if i + 1 >= s.len() => Ok(None),
        Some(i) if s[i + 1] != b'\n' => Err(Error::corruption("expected CRLF")),
        Some(i) => Ok(Some((i, &s[..i]))),
        None if !free_text && s.len() > MAX_HEADER_LINE => {
            Err(Error::corruption("header line without CRLF"))
        }
        None => Ok(None),
    }
}

/// Parse a signed decimal, rejecting empty fields, stray bytes and overflow
fn parse_decimal(s: &[u8]) -> Result<i64> {
    let (neg, digits) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        _ => (false, s),
    };
    if digits.is_empty() || digits.len() > 19 {
        return Err(Error::corruption("invalid numeric field"));
    }
    // Negative values accumulate downwards so i64::MIN fits
    let mut num: i64 = 0;
    for &c in digits {
        if !c.is_ascii_digit() {
            return Err(Error::corruption("non-digit in numeric field"));
        }
        let d = (c - b'0') as i64;
        num = num
            .checked_mul(10)
            .and_then(|n| if neg { n.checked_sub(d) } else { n.checked_add(d) })
            .ok_or_else(|| Error::corruption("numeric field overflow"))?;
    }
    Ok(num)
}

/// Parse a bulk/multi-bulk length field; `-1` means nil
fn parse_length(s: &[u8], max: usize) -> Result<Option<usize>> {
    let n = parse_decimal(s)?;
    if n == -1 {
        return Ok(None);
    }
    if n < 0 {
        return Err(Error::corruption(format!("negative length {}", n)));
    }
    if n as u64 > max as u64 {
        return Err(Error::corruption(format!(
            "length {} exceeds maximum {}",
            n, max
        )));
    }
    Ok(Some(n as usize))
}

//
// Request Encoders
//
// Every command is written in the unified request format understood by
// Redis and Ignix alike: *<argc>\r\n followed by one bulk per argument.
//

/// Append a multi-bulk request header (`*<argc>\r\n`)
#[inline]
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    write_prefixed(b'*', n, out);
}

/// Append one bulk argument (`$<len>\r\n<data>\r\n`)
#[inline]
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    write_prefixed(b'$', b.len(), out);
    out.reserve(b.len() + 2);
    out.put_slice(b);
    out.put_slice(b"\r\n");
}

fn write_prefixed(prefix: u8, n: usize, out: &mut BytesMut) {
    let n_str = n.to_string();
    out.reserve(1 + n_str.len() + 2);
    out.put_u8(prefix);
    out.put_slice(n_str.as_bytes());
    out.put_slice(b"\r\n");
}

/// Append a complete command made of `args` (command name first)
pub fn write_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    write_array_len(args.len(), out);
    for a in args {
        write_bulk(a.as_ref(), out);
    }
}

/// PING
pub fn encode_ping(out: &mut BytesMut) {
    write_command(&[b"PING".as_slice()], out);
}

/// GET key
pub fn encode_get(key: &[u8], out: &mut BytesMut) {
    write_command(&[b"GET".as_slice(), key], out);
}

/// SET key value
pub fn encode_set(key: &[u8], value: &[u8], out: &mut BytesMut) {
    write_command(&[b"SET".as_slice(), key, value], out);
}

/// DEL key
pub fn encode_del(key: &[u8], out: &mut BytesMut) {
    write_command(&[b"DEL".as_slice(), key], out);
}

/// INCR key
pub fn encode_incr(key: &[u8], out: &mut BytesMut) {
    write_command(&[b"INCR".as_slice(), key], out);
}

/// MGET key1 key2 ...
pub fn encode_mget<K: AsRef<[u8]>>(keys: &[K], out: &mut BytesMut) {
    write_array_len(keys.len() + 1, out);
    write_bulk(b"MGET", out);
    for k in keys {
        write_bulk(k.as_ref(), out);
    }
}

/// MSET key1 value1 key2 value2 ...
pub fn encode_mset<K: AsRef<[u8]>, V: AsRef<[u8]>>(pairs: &[(K, V)], out: &mut BytesMut) {
    write_array_len(1 + pairs.len() * 2, out);
    write_bulk(b"MSET", out);
    for (k, v) in pairs {
        write_bulk(k.as_ref(), out);
        write_bulk(v.as_ref(), out);
    }
}
