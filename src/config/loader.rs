use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, ListenerProtocol};

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            anyhow::bail!("at least one listener must be defined");
        }

        let mut listener_names = HashSet::new();
        let mut internal_ids = HashSet::new();
        for listener in &self.listeners {
            if !listener_names.insert(&listener.name) {
                anyhow::bail!("duplicate listener name: {}", listener.name);
            }

            match listener.protocol {
                ListenerProtocol::Tcp | ListenerProtocol::Udp => {
                    listener
                        .address
                        .parse::<std::net::SocketAddr>()
                        .with_context(|| {
                            format!(
                                "listener '{}' has an invalid address: {}",
                                listener.name, listener.address
                            )
                        })?;
                }
                ListenerProtocol::Internal => {
                    if listener.address.is_empty() {
                        anyhow::bail!(
                            "internal listener '{}' needs a non-empty id as its address",
                            listener.name
                        );
                    }
                    if !internal_ids.insert(&listener.address) {
                        anyhow::bail!("duplicate internal listener id: {}", listener.address);
                    }
                }
            }

            let mut chain_names = HashSet::new();
            for chain in &listener.filter_chains {
                if !chain_names.insert(&chain.name) {
                    anyhow::bail!(
                        "listener '{}' has a duplicate filter chain name: {}",
                        listener.name,
                        chain.name
                    );
                }
            }
        }

        info!("configuration validated successfully");
        Ok(())
    }
}
