//! Compatibility adapter for first-generation plugins
//!
//! Wraps a `LegacyPlugin` so it can be supervised exactly like a current
//! plugin. Identity is synthesized from what the plugin reports, falling back
//! to the executable name; configuration received through `configure` is
//! remembered and handed to the legacy `init`.

use crate::plugin::error::PluginResult;
use crate::plugin::traits::{CommandProvider, ContextProvider, LegacyPlugin, Plugin};
use crate::plugin::types::{PluginConfig, PluginMetadata};
use tokio::sync::RwLock;

const UNKNOWN: &str = "unknown";

/// Presents a `LegacyPlugin` through the `Plugin` contract
pub struct LegacyAdapter<P: LegacyPlugin> {
    inner: P,
    fallback_name: Option<String>,
    config: RwLock<PluginConfig>,
}

impl<P: LegacyPlugin> LegacyAdapter<P> {
    pub fn new(inner: P, fallback_name: Option<&str>) -> Self {
        Self {
            inner,
            fallback_name: fallback_name.map(str::to_string),
            config: RwLock::new(PluginConfig::default()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<P: LegacyPlugin> Plugin for LegacyAdapter<P> {
    fn metadata(&self) -> PluginMetadata {
        let name = self
            .inner
            .name()
            .filter(|n| !n.is_empty())
            .or_else(|| self.fallback_name.clone())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let version = self
            .inner
            .version()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string());

        PluginMetadata::new(&name, &version).with_description("legacy plugin")
    }

    async fn configure(&self, config: &PluginConfig) -> PluginResult<()> {
        *self.config.write().await = config.clone();
        Ok(())
    }

    async fn init(&self) -> PluginResult<()> {
        let config = self.config.read().await.clone();
        self.inner.init(config.as_map()).await
    }

    async fn start(&self) -> PluginResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> PluginResult<()> {
        self.inner.stop().await
    }

    async fn health_check(&self) -> PluginResult<()> {
        self.inner.health_check().await
    }

    async fn release(&self) -> PluginResult<()> {
        self.inner.release().await
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        self.inner.as_command_provider()
    }

    fn as_context_provider(&self) -> Option<&dyn ContextProvider> {
        self.inner.as_context_provider()
    }
}
