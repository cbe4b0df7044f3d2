mod info;
mod loader;
mod types;

pub use info::{
    FilterChain, FilterChainManager, FilterChainMatch, ListenSocket, ListenerFilterEntry,
    ListenerInfo, ListenerInfoBuilder, UdpDestinationPicker, UdpReadFilterFactory,
};
pub use types::{
    BalanceKind, Config, FilterChainConfig, FilterChainMatchConfig, ListenerConfig,
    ListenerFilterConfig, ListenerProtocol, NetworkFilterConfig, Settings, TelemetryConfig,
};
