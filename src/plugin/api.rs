//! Public API for the plugin system
//!
//! External modules should import from here rather than directly from
//! internal modules.

// Core plugin management
pub use crate::plugin::manager::{
    DiscoveryReport, LoadedPlugin, PluginManager, PluginManagerConfig, PluginOverview,
};

// Error handling
pub use crate::plugin::error::{PluginError, PluginResult, ResolutionError};

// Plugin contracts
pub use crate::plugin::adapter::LegacyAdapter;
pub use crate::plugin::traits::{CommandProvider, ContextProvider, LegacyPlugin, Plugin};

// Plugin metadata and information
pub use crate::plugin::types::{
    CommandEntry, CommandOutput, CommandTable, ContextDetection, FrameworkDetection,
    LifecycleState, PluginCandidate, PluginCommand, PluginConfig, PluginDependency,
    PluginMetadata, PluginStatus, ProjectContext,
};

// Dependency resolution
pub use crate::plugin::resolver::{
    resolve, Advisory, DependencyResolver, PartialResolution, ResolutionPlan,
};

// Lifecycle supervision
pub use crate::plugin::health::HealthMonitor;
pub use crate::plugin::lifecycle::{LifecycleConfig, LifecycleManager, LifecycleReport};

// Plugin registry for management
pub use crate::plugin::registry::{PluginRegistry, RegisteredPlugin, SharedPluginRegistry};

// Plugin discovery and loading
pub use crate::plugin::discovery::{default_search_paths, DiscoveryConfig, PluginDiscovery};
pub use crate::plugin::loader::{PluginLoader, ProcessLoader};
pub use crate::plugin::process::{connect, PluginProcess, ProcessOptions};

// Caching and context enrichment
pub use crate::plugin::cache::{CacheEntry, Lookup, TtlCache};
pub use crate::plugin::context::{detect_context, merge, ContextTarget, DetectionLimits};
