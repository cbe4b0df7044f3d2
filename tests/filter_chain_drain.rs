//! Draining individual filter chains while the listener keeps serving.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use relayd::config::{FilterChain, ListenerInfo, NetworkFilterConfig};
use relayd::filter::{AnyMatcher, ServerNameFilter};
use relayd::limit::Resource;
use relayd::telemetry::Metrics;

use common::{filter_factory, new_handler, wait_for};

/// Advertise a server name through the length-prefixed preamble the
/// `server_name` listener filter consumes.
async fn connect_with_name(addr: std::net::SocketAddr, name: &str) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut preamble = vec![name.len() as u8];
    preamble.extend_from_slice(name.as_bytes());
    client.write_all(&preamble).await.unwrap();
    client
}

#[tokio::test]
async fn draining_one_chain_leaves_the_other_serving() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_listener_filter(Arc::new(AnyMatcher), filter_factory(|| ServerNameFilter))
        .add_filter_chain(
            FilterChain::new("x")
                .with_server_names(vec!["x".into()])
                .with_filter(NetworkFilterConfig::Echo),
        )
        .add_filter_chain(
            FilterChain::new("y")
                .with_server_names(vec!["y".into()])
                .with_filter(NetworkFilterConfig::Echo),
        )
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    let tag = info.tag();
    handler.add_listener(None, info.clone()).unwrap();

    let mut on_x = Vec::new();
    for _ in 0..3 {
        on_x.push(connect_with_name(addr, "x").await);
    }
    let mut on_y = connect_with_name(addr, "y").await;
    wait_for("four connections", || stats.downstream_cx_total.get() == 4).await;

    let chain_x = info
        .filter_chains()
        .iter()
        .find(|c| c.name() == "x")
        .unwrap()
        .clone();

    let done = Arc::new(AtomicBool::new(false));
    let done_flag = done.clone();
    handler.remove_filter_chains(tag, &[chain_x], move || {
        done_flag.store(true, Ordering::SeqCst);
    });

    // Never inline: nothing has run between the call and this check.
    assert!(!done.load(Ordering::SeqCst));

    wait_for("drain completion", || done.load(Ordering::SeqCst)).await;
    assert_eq!(stats.downstream_cx_destroy.get(), 3);
    assert_eq!(stats.downstream_cx_active.get(), 1);

    // The x-connections observe the forced close.
    for client in &mut on_x {
        let mut byte = [0u8; 1];
        assert_eq!(client.read(&mut byte).await.unwrap(), 0);
    }

    // The y-connection is untouched.
    on_y.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    on_y.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let listener = handler.find_tcp_listener_by_address(addr).unwrap();
    assert_eq!(listener.num_connections(), 1);
    assert_eq!(handler.num_connections(), 1);
}

#[tokio::test]
async fn draining_a_chain_with_no_connections_completes_asynchronously() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());

    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(FilterChain::new("idle").with_filter(NetworkFilterConfig::Echo))
        .build()
        .unwrap();
    let tag = info.tag();
    handler.add_listener(None, info.clone()).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let done_flag = done.clone();
    handler.remove_filter_chains(tag, &[info.filter_chains()[0].clone()], move || {
        done_flag.store(true, Ordering::SeqCst);
    });

    assert!(!done.load(Ordering::SeqCst));
    wait_for("completion", || done.load(Ordering::SeqCst)).await;
}

#[tokio::test]
async fn completion_waits_for_every_listed_chain() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_listener_filter(Arc::new(AnyMatcher), filter_factory(|| ServerNameFilter))
        .add_filter_chain(
            FilterChain::new("x")
                .with_server_names(vec!["x".into()])
                .with_filter(NetworkFilterConfig::Echo),
        )
        .add_filter_chain(
            FilterChain::new("y")
                .with_server_names(vec!["y".into()])
                .with_filter(NetworkFilterConfig::Echo),
        )
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    let tag = info.tag();
    handler.add_listener(None, info.clone()).unwrap();

    let _x = connect_with_name(addr, "x").await;
    let _y = connect_with_name(addr, "y").await;
    wait_for("two connections", || stats.downstream_cx_total.get() == 2).await;

    let chains: Vec<_> = info.filter_chains().to_vec();
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = done.clone();
    handler.remove_filter_chains(tag, &chains, move || {
        done_flag.store(true, Ordering::SeqCst);
    });

    wait_for("both chains drained", || done.load(Ordering::SeqCst)).await;
    assert_eq!(stats.downstream_cx_destroy.get(), 2);
    assert_eq!(stats.downstream_cx_active.get(), 0);
    assert_eq!(handler.num_connections(), 0);
}
