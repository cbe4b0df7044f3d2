//! Runtime listener configuration.
//!
//! A [`ListenerInfo`] is the read-only view of one configured listener that
//! the per-worker handlers consume. It is built once (from YAML via
//! [`ListenerInfo::from_config`], or programmatically via
//! [`ListenerInfoBuilder`]) and shared by every worker: the listen socket is
//! bound here and dup'ed per worker, and the per-listener connection limit
//! and balancer live here so all workers charge the same budget.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::balance::{ConnectionBalancer, ExactBalancer, NopBalancer};
use crate::error::{Error, Result};
use crate::filter::{
    AnyMatcher, BlackholeFilter, EchoFilter, InternalHandoffFilter, ListenerFilter,
    ListenerFilterFactory, ListenerFilterMatcher, NetworkFilter, ProxyProtocolFilter,
    ServerNameFilter, UdpListenerReadFilter,
};
use crate::limit::Resource;
use crate::listener::udp::UdpWorkerRouter;
use crate::network::{ConnectionSocket, UdpRecvData};

use super::types::{
    BalanceKind, FilterChainConfig, ListenerConfig, ListenerFilterConfig, ListenerProtocol,
    NetworkFilterConfig,
};

static NEXT_LISTENER_TAG: AtomicU64 = AtomicU64::new(1);

/// The accepting source a listener is built around. TCP and UDP sockets are
/// bound once and cloned per worker so the kernel balances accepts.
pub enum ListenSocket {
    Tcp(Arc<std::net::TcpListener>),
    Udp(Arc<std::net::UdpSocket>),
    Internal(String),
}

impl ListenSocket {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenSocket::Tcp(listener) => listener.local_addr().ok(),
            ListenSocket::Udp(socket) => socket.local_addr().ok(),
            ListenSocket::Internal(_) => None,
        }
    }
}

/// Criteria a connection must meet to select a filter chain.
#[derive(Debug, Clone, Default)]
pub struct FilterChainMatch {
    pub destination_port: Option<u16>,
    pub server_names: Vec<String>,
}

/// One filter chain instance. Identity (the `Arc` allocation) matters:
/// buckets and drains key off it, so a replaced config's same-named chain is
/// a different chain.
pub struct FilterChain {
    name: String,
    match_: FilterChainMatch,
    filters: Vec<NetworkFilterConfig>,
}

impl FilterChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            match_: FilterChainMatch::default(),
            filters: Vec::new(),
        }
    }

    pub fn with_destination_port(mut self, port: u16) -> Self {
        self.match_.destination_port = Some(port);
        self
    }

    pub fn with_server_names(mut self, names: Vec<String>) -> Self {
        self.match_.server_names = names;
        self
    }

    pub fn with_filter(mut self, filter: NetworkFilterConfig) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter_chain_match(&self) -> &FilterChainMatch {
        &self.match_
    }

    pub(crate) fn create_network_filters(&self) -> Vec<Box<dyn NetworkFilter>> {
        self.filters
            .iter()
            .map(|config| match config {
                NetworkFilterConfig::Echo => Box::new(EchoFilter) as Box<dyn NetworkFilter>,
                NetworkFilterConfig::Blackhole => Box::new(BlackholeFilter),
            })
            .collect()
    }

    fn from_config(config: &FilterChainConfig) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            match_: FilterChainMatch {
                destination_port: config.match_.destination_port,
                server_names: config.match_.server_names.clone(),
            },
            filters: config.filters.clone(),
        })
    }
}

/// Looks up the filter chain for a connection's parameters. Chains with an
/// exact destination-port match win over wildcard chains; within a tier,
/// configuration order decides.
pub struct FilterChainManager {
    chains: Vec<Arc<FilterChain>>,
}

impl FilterChainManager {
    pub fn new(chains: Vec<Arc<FilterChain>>) -> Self {
        Self { chains }
    }

    pub fn chains(&self) -> &[Arc<FilterChain>] {
        &self.chains
    }

    pub fn find(&self, socket: &ConnectionSocket) -> Option<Arc<FilterChain>> {
        let port = socket.local_addr().port();
        let server_name = socket.requested_server_name();

        let matches = |chain: &FilterChain| {
            if let Some(required) = chain.match_.destination_port {
                if port != Some(required) {
                    return false;
                }
            }
            if !chain.match_.server_names.is_empty() {
                match server_name {
                    Some(name) if chain.match_.server_names.iter().any(|s| s == name) => {}
                    _ => return false,
                }
            }
            true
        };

        self.chains
            .iter()
            .find(|c| c.match_.destination_port.is_some() && matches(c))
            .or_else(|| {
                self.chains
                    .iter()
                    .find(|c| c.match_.destination_port.is_none() && matches(c))
            })
            .cloned()
    }
}

/// A listener filter factory paired with its matcher.
pub struct ListenerFilterEntry {
    pub matcher: Arc<dyn ListenerFilterMatcher>,
    pub factory: Arc<dyn ListenerFilterFactory>,
}

pub type UdpDestinationPicker = Arc<dyn Fn(&UdpRecvData) -> usize + Send + Sync>;

pub type UdpReadFilterFactory = Arc<dyn Fn() -> Box<dyn UdpListenerReadFilter> + Send + Sync>;

pub struct ListenerInfo {
    name: String,
    tag: u64,
    listen: ListenSocket,
    listener_filters: Vec<ListenerFilterEntry>,
    filter_chain_manager: FilterChainManager,
    listener_filters_timeout: Duration,
    continue_on_listener_filters_timeout: bool,
    open_connections: Resource,
    balancer: Arc<dyn ConnectionBalancer>,
    hand_off_restored_destinations: bool,
    udp_router: Arc<UdpWorkerRouter>,
    udp_destination_picker: Option<UdpDestinationPicker>,
    udp_read_filter: Option<UdpReadFilterFactory>,
    concurrency: usize,
}

impl ListenerInfo {
    pub fn builder(name: impl Into<String>) -> ListenerInfoBuilder {
        ListenerInfoBuilder::new(name)
    }

    /// Build the runtime info for one configured listener.
    pub fn from_config(
        config: &ListenerConfig,
        tag: u64,
        concurrency: usize,
    ) -> Result<Arc<Self>> {
        let mut builder = ListenerInfoBuilder::new(&config.name)
            .tag(tag)
            .concurrency(concurrency)
            .listener_filters_timeout(Duration::from_millis(config.listener_filters_timeout_ms))
            .continue_on_listener_filters_timeout(config.continue_on_listener_filters_timeout)
            .hand_off_restored_destinations(config.hand_off_restored_destinations);

        if let Some(max) = config.max_connections {
            builder = builder.max_connections(max);
        }

        builder = match config.balance {
            BalanceKind::None => builder,
            BalanceKind::Exact => builder.balancer(Arc::new(ExactBalancer::new())),
        };

        builder = match config.protocol {
            ListenerProtocol::Tcp => builder.tcp(parse_addr(&config.name, &config.address)?),
            ListenerProtocol::Udp => builder.udp(parse_addr(&config.name, &config.address)?),
            ListenerProtocol::Internal => builder.internal(&config.address),
        };

        for filter in &config.listener_filters {
            let factory: Arc<dyn ListenerFilterFactory> = match filter {
                ListenerFilterConfig::ProxyProtocol => {
                    Arc::new(|| -> Box<dyn ListenerFilter> { Box::new(ProxyProtocolFilter) })
                }
                ListenerFilterConfig::ServerName => {
                    Arc::new(|| -> Box<dyn ListenerFilter> { Box::new(ServerNameFilter) })
                }
                ListenerFilterConfig::InternalHandoff { target } => {
                    let target = target.clone();
                    Arc::new(move || -> Box<dyn ListenerFilter> {
                        Box::new(InternalHandoffFilter::new(target.clone()))
                    })
                }
            };
            builder = builder.add_listener_filter(Arc::new(AnyMatcher), factory);
        }

        let mut chains: Vec<Arc<FilterChain>> = config
            .filter_chains
            .iter()
            .map(|c| FilterChain::from_config(c))
            .collect();
        if chains.is_empty() {
            chains.push(Arc::new(FilterChain::new("default")));
        }
        for chain in chains {
            builder = builder.add_filter_chain_arc(chain);
        }

        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn listen_socket(&self) -> &ListenSocket {
        &self.listen
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listen.local_addr()
    }

    pub fn listener_filters(&self) -> &[ListenerFilterEntry] {
        &self.listener_filters
    }

    pub fn filter_chain_manager(&self) -> &FilterChainManager {
        &self.filter_chain_manager
    }

    pub fn filter_chains(&self) -> &[Arc<FilterChain>] {
        self.filter_chain_manager.chains()
    }

    pub fn listener_filters_timeout(&self) -> Duration {
        self.listener_filters_timeout
    }

    pub fn continue_on_listener_filters_timeout(&self) -> bool {
        self.continue_on_listener_filters_timeout
    }

    pub fn open_connections(&self) -> &Resource {
        &self.open_connections
    }

    pub fn balancer(&self) -> &Arc<dyn ConnectionBalancer> {
        &self.balancer
    }

    pub fn hand_off_restored_destinations(&self) -> bool {
        self.hand_off_restored_destinations
    }

    pub fn udp_router(&self) -> &Arc<UdpWorkerRouter> {
        &self.udp_router
    }

    pub fn udp_destination_picker(&self) -> Option<&UdpDestinationPicker> {
        self.udp_destination_picker.as_ref()
    }

    pub fn udp_read_filter(&self) -> Option<&UdpReadFilterFactory> {
        self.udp_read_filter.as_ref()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

enum BindTarget {
    Tcp(SocketAddr),
    /// Reuse an already-bound socket, e.g. when building the replacement
    /// config for an in-place listener update.
    TcpExisting(Arc<std::net::TcpListener>),
    Udp(SocketAddr),
    Internal(String),
}

pub struct ListenerInfoBuilder {
    name: String,
    tag: Option<u64>,
    bind: Option<BindTarget>,
    listener_filters: Vec<ListenerFilterEntry>,
    filter_chains: Vec<Arc<FilterChain>>,
    listener_filters_timeout: Duration,
    continue_on_listener_filters_timeout: bool,
    max_connections: Option<u64>,
    balancer: Option<Arc<dyn ConnectionBalancer>>,
    hand_off_restored_destinations: bool,
    udp_destination_picker: Option<UdpDestinationPicker>,
    udp_read_filter: Option<UdpReadFilterFactory>,
    concurrency: usize,
}

impl ListenerInfoBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: None,
            bind: None,
            listener_filters: Vec::new(),
            filter_chains: Vec::new(),
            listener_filters_timeout: Duration::from_millis(15_000),
            continue_on_listener_filters_timeout: false,
            max_connections: None,
            balancer: None,
            hand_off_restored_destinations: false,
            udp_destination_picker: None,
            udp_read_filter: None,
            concurrency: 1,
        }
    }

    pub fn tag(mut self, tag: u64) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn tcp(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(BindTarget::Tcp(addr));
        self
    }

    pub fn tcp_listener(mut self, listener: Arc<std::net::TcpListener>) -> Self {
        self.bind = Some(BindTarget::TcpExisting(listener));
        self
    }

    pub fn udp(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(BindTarget::Udp(addr));
        self
    }

    pub fn internal(mut self, id: impl Into<String>) -> Self {
        self.bind = Some(BindTarget::Internal(id.into()));
        self
    }

    pub fn add_listener_filter(
        mut self,
        matcher: Arc<dyn ListenerFilterMatcher>,
        factory: Arc<dyn ListenerFilterFactory>,
    ) -> Self {
        self.listener_filters.push(ListenerFilterEntry { matcher, factory });
        self
    }

    pub fn add_filter_chain(self, chain: FilterChain) -> Self {
        self.add_filter_chain_arc(Arc::new(chain))
    }

    pub fn add_filter_chain_arc(mut self, chain: Arc<FilterChain>) -> Self {
        self.filter_chains.push(chain);
        self
    }

    pub fn listener_filters_timeout(mut self, timeout: Duration) -> Self {
        self.listener_filters_timeout = timeout;
        self
    }

    pub fn continue_on_listener_filters_timeout(mut self, continue_on: bool) -> Self {
        self.continue_on_listener_filters_timeout = continue_on;
        self
    }

    pub fn max_connections(mut self, max: u64) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn balancer(mut self, balancer: Arc<dyn ConnectionBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn hand_off_restored_destinations(mut self, hand_off: bool) -> Self {
        self.hand_off_restored_destinations = hand_off;
        self
    }

    pub fn udp_destination_picker(mut self, picker: UdpDestinationPicker) -> Self {
        self.udp_destination_picker = Some(picker);
        self
    }

    pub fn udp_read_filter(mut self, factory: UdpReadFilterFactory) -> Self {
        self.udp_read_filter = Some(factory);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Bind the listen socket and freeze the info.
    pub fn build(self) -> Result<Arc<ListenerInfo>> {
        let listen = match self.bind {
            Some(BindTarget::Tcp(addr)) => {
                let listener = std::net::TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                ListenSocket::Tcp(Arc::new(listener))
            }
            Some(BindTarget::TcpExisting(listener)) => ListenSocket::Tcp(listener),
            Some(BindTarget::Udp(addr)) => {
                let socket = std::net::UdpSocket::bind(addr)?;
                socket.set_nonblocking(true)?;
                ListenSocket::Udp(Arc::new(socket))
            }
            Some(BindTarget::Internal(id)) => ListenSocket::Internal(id),
            None => {
                return Err(Error::Config(format!(
                    "listener {:?} has no bind address",
                    self.name
                )))
            }
        };

        Ok(Arc::new(ListenerInfo {
            name: self.name,
            tag: self
                .tag
                .unwrap_or_else(|| NEXT_LISTENER_TAG.fetch_add(1, Ordering::Relaxed)),
            listen,
            listener_filters: self.listener_filters,
            filter_chain_manager: FilterChainManager::new(self.filter_chains),
            listener_filters_timeout: self.listener_filters_timeout,
            continue_on_listener_filters_timeout: self.continue_on_listener_filters_timeout,
            open_connections: self
                .max_connections
                .map(Resource::new)
                .unwrap_or_else(Resource::unlimited),
            balancer: self.balancer.unwrap_or_else(|| Arc::new(NopBalancer)),
            hand_off_restored_destinations: self.hand_off_restored_destinations,
            udp_router: Arc::new(UdpWorkerRouter::new()),
            udp_destination_picker: self.udp_destination_picker,
            udp_read_filter: self.udp_read_filter,
            concurrency: self.concurrency,
        }))
    }
}

fn parse_addr(listener: &str, address: &str) -> Result<SocketAddr> {
    address.parse().map_err(|_| {
        Error::Config(format!(
            "listener {listener:?} has an invalid address: {address}"
        ))
    })
}
