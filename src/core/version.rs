//! Build metadata and protocol version accessors shared across app and plugins.
//! This includes the generated version.rs from the build script into a core module,
//! providing a single source of truth.

include!(concat!(env!("OUT_DIR"), "/version.rs"));

/// Highest plugin protocol generation this host speaks.
/// Falls back to a stable default if parsing fails.
pub fn get_protocol_version() -> u32 {
    PLUGIN_PROTOCOL_VERSION.parse().unwrap_or(2)
}

/// Build time string from the build script (UTC)
pub fn build_time() -> &'static str {
    BUILD_TIME
}

/// Short git hash captured by the build script
pub fn git_hash() -> &'static str {
    GIT_HASH
}

/// Long version string for `--version` output
pub fn long_version() -> String {
    format!(
        "{} (protocol v{}, {} {})",
        env!("CARGO_PKG_VERSION"),
        get_protocol_version(),
        git_hash(),
        build_time()
    )
}
