//! Plugin System Module
//!
//! Discovers plugin executables, resolves their declared dependencies and
//! supervises them through a common lifecycle. Plugins speak newline-delimited
//! JSON over stdio; first-generation plugins are adapted to the current
//! contract at connect time.

// Internal modules - all access should go through api module
pub(crate) mod adapter;
pub(crate) mod cache;
pub(crate) mod context;
pub(crate) mod discovery;
pub(crate) mod error;
pub(crate) mod health;
pub(crate) mod lifecycle;
pub(crate) mod loader;
pub(crate) mod manager;
pub(crate) mod process;
pub(crate) mod protocol;
pub(crate) mod registry;
pub(crate) mod resolver;
pub(crate) mod traits;
pub(crate) mod types;

// Public API module - the only public interface for the plugin system
pub mod api;

#[cfg(test)]
mod tests;
