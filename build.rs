use chrono::Utc;
use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

fn main() {
    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo");
    let dest_path = Path::new(&out_dir).join("version.rs");
    let cargo_toml_path = Path::new(&manifest_dir).join("Cargo.toml");

    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let manifest = fs::read_to_string(&cargo_toml_path).unwrap_or_default();
    let protocol_version = package_metadata(&manifest, "plugin_protocol_version")
        .unwrap_or_else(|| "unknown".to_string());
    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_hash = short_git_hash().unwrap_or_else(|| "unknown".to_string());

    let generated = format!(
        r###"pub const PLUGIN_PROTOCOL_VERSION: &str = "{protocol_version}";
pub const BUILD_TIME: &str = "{build_time}";
pub const GIT_HASH: &str = "{git_hash}";
"###
    );

    // Leave the file alone when nothing changed so dependents are not rebuilt
    if fs::read_to_string(&dest_path).ok().as_deref() != Some(generated.as_str()) {
        fs::write(&dest_path, generated).expect("failed to write version.rs");
    }
}

/// Integer value under `[package.metadata]`
fn package_metadata(manifest: &str, key: &str) -> Option<String> {
    let table = manifest.parse::<toml::Table>().ok()?;
    table
        .get("package")?
        .get("metadata")?
        .get(key)?
        .as_integer()
        .map(|v| v.to_string())
}

fn short_git_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}
