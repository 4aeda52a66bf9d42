mod common;

use anyhow::Result;
use bytes::Bytes;
use common::{init_logging, MockServer, Mode};
use ignix_client::*;
use std::time::Duration;

fn cluster(weight: u32) -> (MockServer, MockServer, ShardedClient) {
    init_logging();
    let a = MockServer::start();
    let b = MockServer::start();
    let config = ClientConfig::new()
        .with_server(a.addr(), weight)
        .with_server(b.addr(), weight)
        .with_timeout(Duration::from_secs(5));
    let client = ShardedClient::new(config).unwrap();
    (a, b, client)
}

fn piet_keys(n: usize) -> Vec<Bytes> {
    (0..n).map(|i| Bytes::from(format!("piet{}", i))).collect()
}

#[test]
fn set_then_get() -> Result<()> {
    let (a, b, mut client) = cluster(300);
    client.set(b"piet1", b"blaat1")?;
    assert_eq!(client.get(b"piet1")?, Some(Bytes::from_static(b"blaat1")));
    assert_eq!(client.get(b"no-such-key")?, None);

    // stored only on the owning server
    let owner = client.ring().resolve_address(b"piet1")?.to_string();
    let (holder, other) = if owner == a.addr() { (&a, &b) } else { (&b, &a) };
    assert!(holder.contains(b"piet1"));
    assert!(!other.contains(b"piet1"));
    Ok(())
}

#[test]
fn mget_matches_individual_gets() -> Result<()> {
    let (a, b, mut client) = cluster(300);
    let keys = piet_keys(40);
    for (i, k) in keys.iter().enumerate() {
        client.set(k, format!("blaat{}", i).as_bytes())?;
    }
    assert!(a.len() > 0 && b.len() > 0, "keys should spread over both servers");
    assert_eq!(a.len() + b.len(), 40);

    let values = client.mget(&keys)?;
    assert_eq!(values.len(), 40);
    for k in &keys {
        assert_eq!(values[k], client.get(k)?);
    }
    Ok(())
}

#[test]
fn mget_reports_missing_keys() -> Result<()> {
    let (_a, _b, mut client) = cluster(100);
    client.mset(&[(&b"k1"[..], &b"v1"[..]), (&b"k3"[..], &b"v3"[..])])?;
    let values = client.mget(&[&b"k1"[..], &b"k2"[..], &b"k3"[..]])?;
    assert_eq!(values.len(), 3);
    assert_eq!(values[&Bytes::from_static(b"k1")], Some(Bytes::from_static(b"v1")));
    assert_eq!(values[&Bytes::from_static(b"k2")], None);
    assert_eq!(values[&Bytes::from_static(b"k3")], Some(Bytes::from_static(b"v3")));
    Ok(())
}

#[test]
fn counters_and_deletes() -> Result<()> {
    let (_a, _b, mut client) = cluster(100);
    assert_eq!(client.incr(b"hits")?, 1);
    assert_eq!(client.incr(b"hits")?, 2);
    assert!(client.del(b"hits")?);
    assert!(!client.del(b"hits")?);
    Ok(())
}

#[test]
fn error_reply_raises_and_keeps_connection() -> Result<()> {
    let (_a, _b, mut client) = cluster(100);
    client.set(b"name", b"piet")?;
    let err = client.incr(b"name").unwrap_err();
    assert!(matches!(err, Error::Server(_)), "got {:?}", err);
    assert_eq!(err.kind(), ErrorKind::Protocol);

    let address = client.ring().resolve_address(b"name")?.to_string();
    assert!(client.manager().contains(&address));
    assert_eq!(client.get(b"name")?, Some(Bytes::from_static(b"piet")));
    Ok(())
}

#[test]
fn failing_shard_fails_whole_mget() -> Result<()> {
    let (a, b, mut client) = cluster(300);
    let keys = piet_keys(40);
    for k in &keys {
        client.set(k, b"x")?;
    }
    assert_eq!(client.manager().len(), 2);

    b.set_mode(Mode::CloseOnMget);
    let err = client.mget(&keys).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection, "got {:?}", err);
    assert!(!client.manager().contains(b.addr()));
    assert!(client.manager().contains(a.addr()));

    // the evicted connection is recreated on demand
    b.set_mode(Mode::Normal);
    assert_eq!(client.mget(&keys)?.len(), 40);
    assert_eq!(b.accepted(), 2);
    assert_eq!(a.accepted(), 1);
    Ok(())
}

#[test]
fn unreachable_shard_leaves_healthy_shard_usable() -> Result<()> {
    init_logging();
    let live = MockServer::start();
    let dead = {
        let l = std::net::TcpListener::bind("127.0.0.1:0")?;
        l.local_addr()?.to_string()
    };
    let config = ClientConfig::new()
        .with_server(&dead, 100)
        .with_server(live.addr(), 100)
        .with_timeout(Duration::from_secs(2));
    let mut client = ShardedClient::new(config)?;

    let owned_by = |client: &ShardedClient, addr: &str| {
        (0..1000)
            .map(|i| format!("k{}", i))
            .find(|k| client.ring().resolve_address(k.as_bytes()).ok() == Some(addr))
            .unwrap()
    };
    let live_key = owned_by(&client, live.addr());
    let dead_key = owned_by(&client, &dead);

    client.set(live_key.as_bytes(), b"v")?;
    let err = client.mget(&[dead_key.as_bytes(), live_key.as_bytes()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection, "got {:?}", err);

    assert_eq!(client.get(live_key.as_bytes())?, Some(Bytes::from_static(b"v")));
    assert_eq!(client.get(live_key.as_bytes())?, Some(Bytes::from_static(b"v")));
    Ok(())
}

#[test]
fn timeout_then_recovery() -> Result<()> {
    let (a, b, mut client) = cluster(100);
    client.set(b"slow", b"1")?;
    client.set(b"next", b"2")?;
    let owner = client.ring().resolve_address(b"slow")?.to_string();
    let server = if owner == a.addr() { &a } else { &b };

    server.set_mode(Mode::Delay(Duration::from_millis(300)));
    let opts = CallOptions::new()
        .with_timeout(Duration::from_millis(50))
        .with_server_key(&b"slow"[..]);
    let err = client.get_with(b"slow", &opts).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(client.manager().contains(&owner));

    // the late reply to the abandoned GET must not be taken for this one
    server.set_mode(Mode::Normal);
    let opts = CallOptions::new().with_server_key(&b"slow"[..]);
    client.set_with(b"next", b"3", &opts)?;
    assert_eq!(client.get_with(b"next", &opts)?, Some(Bytes::from_static(b"3")));
    assert_eq!(server.accepted(), 1);
    Ok(())
}

#[test]
fn silent_server_times_out() {
    let (a, b, mut client) = cluster(100);
    a.set_mode(Mode::Silent);
    b.set_mode(Mode::Silent);
    let opts = CallOptions::new().with_timeout(Duration::from_millis(30));
    let err = client.get_with(b"anything", &opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
}

#[test]
fn server_key_keeps_related_keys_together() -> Result<()> {
    let (a, b, mut client) = cluster(100);
    let opts = CallOptions::new().with_server_key(&b"user:1"[..]);
    client.mset_with(
        &[(&b"user:1:name"[..], &b"piet"[..]), (&b"user:1:mail"[..], &b"piet@example.org"[..])],
        &opts,
    )?;
    let owner = client.ring().resolve_address(b"user:1")?.to_string();
    let (holder, other) = if owner == a.addr() { (&a, &b) } else { (&b, &a) };
    assert_eq!(holder.len(), 2);
    assert_eq!(other.len(), 0);

    let values = client.mget_with(&[&b"user:1:name"[..], &b"user:1:mail"[..]], &opts)?;
    assert_eq!(values.len(), 2);
    assert!(values.values().all(Option::is_some));
    Ok(())
}

#[test]
fn connections_are_reused() -> Result<()> {
    let (a, b, mut client) = cluster(100);
    client.ping_all()?;
    client.ping_all()?;
    client.mset(&[(&b"x"[..], &b"1"[..]), (&b"y"[..], &b"2"[..])])?;
    assert_eq!(a.accepted(), 1);
    assert_eq!(b.accepted(), 1);
    assert_eq!(client.manager().len(), 2);

    client.close();
    assert!(client.manager().is_empty());
    client.ping_all()?;
    assert_eq!(a.accepted(), 2);
    Ok(())
}

#[test]
fn execute_runs_pipelined_batch() -> Result<()> {
    let (_a, _b, mut client) = cluster(100);
    let mut batch = Batch::new();
    batch
        .set(b"p", b"41")
        .incr(b"p")
        .get(b"p")
        .write_command(&["FLUSHALL"]);
    let mut batch = client.execute(b"p", batch)?;

    assert_eq!(batch.next_reply(), Some(Reply::Ok(Bytes::from_static(b"OK"))));
    assert_eq!(batch.next_reply(), Some(Reply::Integer(42)));
    assert_eq!(batch.next_reply(), Some(Reply::Bulk(Bytes::from_static(b"42"))));
    assert!(matches!(batch.next_reply(), Some(Reply::Error(_))));
    assert_eq!(batch.next_reply(), None);
    Ok(())
}
