//! A single standalone Redis node.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::server::{RedisServer, RedisServerBuilder};

/// Customizes the node builder before the server is launched. Customizers
/// run in array order, each receiving the builder and the immutable config.
pub type StandaloneCustomizer =
    Arc<dyn Fn(&mut RedisServerBuilder, &StandaloneConfig) + Send + Sync>;

/// Configuration of a standalone topology.
#[derive(Clone, Default)]
pub struct StandaloneConfig {
    /// Port to start on; `0` means "allocate a free port upwards from 6379".
    pub port: u16,
    /// Bind address; empty means the default bind.
    pub bind: String,
    /// Existing config file to launch with. Mutually exclusive with
    /// `settings`; a port inside the file is ignored.
    pub config_file: Option<PathBuf>,
    /// Raw config lines, applied in order.
    pub settings: Vec<String>,
    pub customizers: Vec<StandaloneCustomizer>,
}

impl StandaloneConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.config_file.is_some() && !self.settings.is_empty() {
            return Err(Error::Validation(
                "Either 'config_file' or 'settings' can be set, but not both".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct StandaloneTopology {
    pub node: Arc<RedisServer>,
}

pub async fn build(
    config: &StandaloneConfig,
    ports: &PortAllocator,
) -> Result<StandaloneTopology> {
    config.validate()?;

    let port = if config.port != 0 {
        config.port
    } else {
        ports.next_port(false)?
    };

    let mut builder = RedisServerBuilder::new(port);
    if !config.bind.is_empty() {
        builder.bind(&config.bind);
    }
    if let Some(file) = &config.config_file {
        builder.config_file(file);
    } else {
        for setting in &config.settings {
            builder.setting(setting);
        }
    }
    for customize in &config.customizers {
        customize(&mut builder, config);
    }

    let node = Arc::new(builder.build()?);
    if let Err(e) = node.start().await {
        node.stop_safely().await;
        return Err(e);
    }
    info!(port = node.port(), "Started standalone Redis server");
    Ok(StandaloneTopology { node })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_and_settings_are_mutually_exclusive() {
        let config = StandaloneConfig {
            config_file: Some("/etc/redis/redis.conf".into()),
            settings: vec!["appendonly no".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn either_input_alone_is_valid() {
        let config = StandaloneConfig {
            config_file: Some("/etc/redis/redis.conf".into()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = StandaloneConfig {
            settings: vec!["appendonly no".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn customizers_run_in_array_order() {
        let config = StandaloneConfig {
            customizers: vec![
                Arc::new(|builder: &mut RedisServerBuilder, _: &StandaloneConfig| {
                    builder.setting("maxmemory 64mb");
                }),
                Arc::new(|builder: &mut RedisServerBuilder, _: &StandaloneConfig| {
                    builder.setting("maxmemory 128mb");
                }),
            ],
            ..Default::default()
        };

        let mut builder = RedisServerBuilder::new(7200);
        for customize in &config.customizers {
            customize(&mut builder, &config);
        }
        assert_eq!(
            builder.settings_lines(),
            ["maxmemory 64mb", "maxmemory 128mb"]
        );
    }
}
