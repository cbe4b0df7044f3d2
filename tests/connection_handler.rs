//! Connection handler lifecycle: accept, admission, balancing, accounting.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use relayd::balance::{same_handler, BalancedConnectionHandler, ConnectionBalancer};
use relayd::config::{FilterChain, ListenSocket, ListenerInfo, NetworkFilterConfig};
use relayd::filter::AnyMatcher;
use relayd::limit::Resource;
use relayd::telemetry::Metrics;

use common::{filter_factory, new_handler, wait_for, CountingFilter};

fn echo_chain(name: &str) -> FilterChain {
    FilterChain::new(name).with_filter(NetworkFilterConfig::Echo)
}

#[tokio::test]
async fn single_accept_runs_filters_and_creates_connection() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_a = calls.clone();
    let calls_b = calls.clone();
    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_listener_filter(
            Arc::new(AnyMatcher),
            filter_factory(move || CountingFilter { calls: calls_a.clone() }),
        )
        .add_listener_filter(
            Arc::new(AnyMatcher),
            filter_factory(move || CountingFilter { calls: calls_b.clone() }),
        )
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    handler.add_listener(None, info).unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_for("connection to establish", || stats.downstream_cx_total.get() == 1).await;

    assert_eq!(stats.downstream_cx_active.get(), 1);
    assert_eq!(stats.downstream_pre_cx_active.get(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(handler.num_connections(), 1);

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(client);
    wait_for("connection to be destroyed", || stats.downstream_cx_destroy.get() == 1).await;
    assert_eq!(stats.downstream_cx_active.get(), 0);
    assert_eq!(handler.num_connections(), 0);
    assert_eq!(stats.downstream_cx_length_ms.get_sample_count(), 1);
}

#[tokio::test]
async fn global_overflow_closes_socket_and_counts() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::new(1));
    let stats = metrics.listener_stats("ingress");

    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    handler.add_listener(None, info).unwrap();

    let _first = TcpStream::connect(addr).await.unwrap();
    wait_for("first connection", || stats.downstream_cx_total.get() == 1).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    wait_for("global overflow", || {
        stats.downstream_global_cx_overflow.get() == 1
    })
    .await;

    // The rejected socket is closed without ever entering the pipeline.
    assert_eq!(stats.downstream_cx_total.get(), 1);
    let mut buf = [0u8; 1];
    assert_eq!(second.read(&mut buf).await.unwrap(), 0);
    assert_eq!(handler.num_connections(), 1);
}

#[tokio::test]
async fn listener_overflow_counts_separately() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .max_connections(1)
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    handler.add_listener(None, info).unwrap();

    let _first = TcpStream::connect(addr).await.unwrap();
    wait_for("first connection", || stats.downstream_cx_total.get() == 1).await;

    let _second = TcpStream::connect(addr).await.unwrap();
    wait_for("listener overflow", || stats.downstream_cx_overflow.get() == 1).await;
    assert_eq!(stats.downstream_global_cx_overflow.get(), 0);
    assert_eq!(stats.downstream_cx_total.get(), 1);
}

#[tokio::test]
async fn no_filter_chain_match_closes_and_counts() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    // A single chain constrained to a server name nothing will advertise.
    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(
            echo_chain("only-named").with_server_names(vec!["example.com".into()]),
        )
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    let listener_tag = info.tag();
    handler.add_listener(None, info).unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_for("no match counted", || stats.no_filter_chain_match.get() == 1).await;

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    assert_eq!(stats.downstream_cx_total.get(), 0);
    assert_eq!(handler.num_connections(), 0);

    let listener = handler.find_tcp_listener_by_address(addr).unwrap();
    assert_eq!(listener.num_connections(), 0);
    assert_eq!(listener.tag(), listener_tag);
}

struct PickLastBalancer {
    handlers: Mutex<Vec<Arc<dyn BalancedConnectionHandler>>>,
}

impl ConnectionBalancer for PickLastBalancer {
    fn register_handler(&self, handler: Arc<dyn BalancedConnectionHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn unregister_handler(&self, handler: &Arc<dyn BalancedConnectionHandler>) {
        self.handlers
            .lock()
            .unwrap()
            .retain(|candidate| !same_handler(candidate, handler));
    }

    fn pick_target_handler(
        &self,
        current: &Arc<dyn BalancedConnectionHandler>,
    ) -> Arc<dyn BalancedConnectionHandler> {
        self.handlers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_else(|| current.clone())
    }
}

#[tokio::test]
async fn rebalanced_socket_is_accounted_on_the_target_worker() {
    let metrics = Metrics::new().unwrap();
    let handler_0 = new_handler(0, &metrics, Resource::unlimited());
    let handler_1 = new_handler(1, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    // Both workers share the listener; the balancer always routes to the
    // last registered per-worker listener, i.e. worker 1.
    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .balancer(Arc::new(PickLastBalancer {
            handlers: Mutex::new(Vec::new()),
        }))
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    handler_0.add_listener(None, info.clone()).unwrap();
    handler_1.add_listener(None, info).unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_for("connection on the target worker", || {
        stats.downstream_cx_total.get() == 1
    })
    .await;

    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();

    let listener_0 = handler_0.find_tcp_listener_by_address(addr).unwrap();
    let listener_1 = handler_1.find_tcp_listener_by_address(addr).unwrap();
    assert_eq!(listener_0.num_connections(), 0);
    assert_eq!(listener_1.num_connections(), 1);
    assert_eq!(handler_0.num_connections(), 0);
    assert_eq!(handler_1.num_connections(), 1);

    drop(client);
    wait_for("connection destroyed", || stats.downstream_cx_destroy.get() == 1).await;
    assert_eq!(listener_1.num_connections(), 0);
    assert_eq!(handler_1.num_connections(), 0);
}

#[tokio::test]
async fn disable_is_sticky_and_enable_resumes() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    handler.disable_listeners();

    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    handler.add_listener(None, info).unwrap();

    // The kernel backlog holds the connection; nothing is accepted.
    let _client = TcpStream::connect(addr).await.unwrap();
    common::assert_never("accept while disabled", || {
        stats.downstream_cx_total.get() > 0
    })
    .await;

    handler.enable_listeners();
    wait_for("accept after enable", || stats.downstream_cx_total.get() == 1).await;
}

#[tokio::test]
async fn stopped_listener_keeps_existing_connections() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    let tag = info.tag();
    handler.add_listener(None, info).unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_for("connection", || stats.downstream_cx_total.get() == 1).await;

    handler.stop_listeners(tag);

    // The live connection keeps serving after the accept source is gone.
    client.write_all(b"still").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still");

    // New connections are no longer accepted.
    match tokio::time::timeout(Duration::from_millis(300), async {
        let mut probe = TcpStream::connect(addr).await?;
        let mut byte = [0u8; 1];
        probe.read(&mut byte).await
    })
    .await
    {
        Ok(Ok(0)) | Ok(Err(_)) | Err(_) => {}
        Ok(Ok(n)) => panic!("unexpected read of {n} bytes from a stopped listener"),
    }
    assert_eq!(stats.downstream_cx_total.get(), 1);
}

#[tokio::test]
async fn remove_listeners_lets_in_flight_connections_finish() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    let info = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let addr = info.local_addr().unwrap();
    let tag = info.tag();
    handler.add_listener(None, info).unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_for("connection", || stats.downstream_cx_total.get() == 1).await;

    handler.remove_listeners(tag);
    assert!(handler.find_tcp_listener_by_address(addr).is_none());

    client.write_all(b"alive").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"alive");

    drop(client);
    wait_for("connection destroyed", || stats.downstream_cx_destroy.get() == 1).await;
    assert_eq!(stats.downstream_cx_active.get(), 0);
}

#[tokio::test]
async fn duplicate_tag_is_rejected() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());

    let info_a = ListenerInfo::builder("a")
        .tag(7)
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let info_b = ListenerInfo::builder("b")
        .tag(7)
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();

    handler.add_listener(None, info_a).unwrap();
    assert!(matches!(
        handler.add_listener(None, info_b),
        Err(relayd::Error::DuplicateListener(7))
    ));
}

#[tokio::test]
async fn any_address_lookup_matches_concrete_queries() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());

    let info = ListenerInfo::builder("wild")
        .tcp("0.0.0.0:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let bound = info.local_addr().unwrap();
    handler.add_listener(None, info).unwrap();

    // Exact match on the bound any-address.
    assert!(handler.find_tcp_listener_by_address(bound).is_some());

    // A concrete address on the same port falls back to the any-address
    // listener; a different port matches nothing.
    let concrete = format!("127.0.0.1:{}", bound.port()).parse().unwrap();
    assert!(handler.find_tcp_listener_by_address(concrete).is_some());
    let other_port = format!("127.0.0.1:{}", bound.port().wrapping_add(1))
        .parse()
        .unwrap();
    assert!(handler.find_tcp_listener_by_address(other_port).is_none());
}

#[tokio::test]
async fn hot_replacement_applies_to_new_sockets_only() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats = metrics.listener_stats("ingress");

    let info_v1 = ListenerInfo::builder("ingress")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("chain"))
        .build()
        .unwrap();
    let addr = info_v1.local_addr().unwrap();
    let tag = info_v1.tag();
    handler.add_listener(None, info_v1.clone()).unwrap();

    let mut old_client = TcpStream::connect(addr).await.unwrap();
    wait_for("first connection", || stats.downstream_cx_total.get() == 1).await;

    // Replace in place, reusing the bound socket; the new config's chain
    // discards instead of echoing.
    let ListenSocket::Tcp(listen_socket) = info_v1.listen_socket() else {
        panic!("expected a tcp listen socket");
    };
    let info_v2 = ListenerInfo::builder("ingress")
        .tag(tag)
        .tcp_listener(listen_socket.clone())
        .add_filter_chain(FilterChain::new("chain").with_filter(NetworkFilterConfig::Blackhole))
        .build()
        .unwrap();
    handler.add_listener(Some(tag), info_v2).unwrap();

    // Existing connection still sees the old chain.
    old_client.write_all(b"old").await.unwrap();
    let mut buf = [0u8; 3];
    old_client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"old");

    // A socket accepted after the replacement observes the new chain.
    let mut new_client = TcpStream::connect(addr).await.unwrap();
    wait_for("second connection", || stats.downstream_cx_total.get() == 2).await;
    new_client.write_all(b"new").await.unwrap();
    let mut byte = [0u8; 1];
    assert!(
        tokio::time::timeout(Duration::from_millis(300), new_client.read(&mut byte))
            .await
            .is_err(),
        "blackhole chain must not echo"
    );
}

#[tokio::test]
async fn handler_count_equals_sum_of_listener_counts() {
    let metrics = Metrics::new().unwrap();
    let handler = new_handler(0, &metrics, Resource::unlimited());
    let stats_a = metrics.listener_stats("a");
    let stats_b = metrics.listener_stats("b");

    let info_a = ListenerInfo::builder("a")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let info_b = ListenerInfo::builder("b")
        .tcp("127.0.0.1:0".parse().unwrap())
        .add_filter_chain(echo_chain("x"))
        .build()
        .unwrap();
    let addr_a = info_a.local_addr().unwrap();
    let addr_b = info_b.local_addr().unwrap();
    handler.add_listener(None, info_a).unwrap();
    handler.add_listener(None, info_b).unwrap();

    let mut clients = Vec::new();
    for i in 0..6 {
        let addr = if i % 2 == 0 { addr_a } else { addr_b };
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_for("all connections", || {
        stats_a.downstream_cx_total.get() + stats_b.downstream_cx_total.get() == 6
    })
    .await;

    let listener_a = handler.find_tcp_listener_by_address(addr_a).unwrap();
    let listener_b = handler.find_tcp_listener_by_address(addr_b).unwrap();
    assert_eq!(handler.num_connections(), 6);
    assert_eq!(
        listener_a.num_connections() + listener_b.num_connections(),
        handler.num_connections()
    );
    assert_eq!(
        stats_a.downstream_cx_active.get() + stats_b.downstream_cx_active.get(),
        6
    );

    // Close half, re-check, then close the rest.
    clients.truncate(3);
    wait_for("half destroyed", || {
        stats_a.downstream_cx_destroy.get() + stats_b.downstream_cx_destroy.get() == 3
    })
    .await;
    assert_eq!(
        listener_a.num_connections() + listener_b.num_connections(),
        handler.num_connections()
    );

    clients.clear();
    wait_for("all destroyed", || {
        stats_a.downstream_cx_destroy.get() + stats_b.downstream_cx_destroy.get() == 6
    })
    .await;
    assert_eq!(handler.num_connections(), 0);
    assert_eq!(listener_a.num_connections(), 0);
    assert_eq!(listener_b.num_connections(), 0);

    // cx_total - cx_destroy = cx_active holds per listener at quiescence.
    assert_eq!(
        stats_a.downstream_cx_total.get() - stats_a.downstream_cx_destroy.get(),
        stats_a.downstream_cx_active.get() as u64
    );
    assert_eq!(
        stats_b.downstream_cx_total.get() - stats_b.downstream_cx_destroy.get(),
        stats_b.downstream_cx_active.get() as u64
    );
}
