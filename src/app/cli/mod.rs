//! CLI module containing argument parsing, configuration and output

pub mod args;
pub mod config;
pub mod display;
