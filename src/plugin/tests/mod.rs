//! Test modules for the plugin system
//!
//! Suites for the resolver, the lifecycle manager, the compatibility adapter
//! and the plugin manager, plus concurrency tests racing lookups against
//! cleanup. Shared mocks live in `utils`.

mod manager;
mod utils;
