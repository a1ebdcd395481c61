//! Plugin manager: discovery, on-demand loading, caching and commands

use super::utils::{touch_plugin, Harness, MockSpec};
use crate::plugin::context::DetectionLimits;
use crate::plugin::error::{PluginError, ResolutionError};
use crate::plugin::types::{LifecycleState, PluginConfig};
use std::time::Duration;

fn chain() -> Vec<MockSpec> {
    vec![
        MockSpec::new("base"),
        MockSpec::new("docker").requires("base", "^1.0"),
        MockSpec::new("deploy").requires("docker", "^1.0"),
    ]
}

#[tokio::test]
async fn test_discover_plugins_lazy_does_not_load() {
    let harness = Harness::new(chain());
    let paths = harness.manager.discover_plugins_lazy().await;

    let names: Vec<String> = paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            "devctx-plugin-base",
            "devctx-plugin-deploy",
            "devctx-plugin-docker"
        ]
    );
    assert_eq!(harness.loader.load_count("base"), 0);
    assert!(harness.manager.list_plugins().await.is_empty());
}

#[tokio::test]
async fn test_discover_plugins_starts_in_dependency_order() {
    let harness = Harness::new(chain());
    let report = harness.manager.discover_plugins().await;

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.candidates, 3);
    assert_eq!(report.started, vec!["base", "docker", "deploy"]);
    assert_eq!(
        harness.loader.log.plugins_for("start"),
        vec!["base", "docker", "deploy"]
    );
    assert_eq!(
        harness.manager.list_plugins().await,
        vec!["base", "deploy", "docker"]
    );
}

#[tokio::test]
async fn test_present_optional_dependency_starts_first() {
    let harness = Harness::new(vec![
        MockSpec::new("app").optionally("cache", "^1.0"),
        MockSpec::new("cache"),
        MockSpec::new("tool").optionally("ghost", "^1.0"),
    ]);
    let report = harness.manager.discover_plugins().await;

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.started, vec!["cache", "tool", "app"]);
    let cache_start = harness.loader.log.position("cache:start").unwrap();
    assert!(cache_start < harness.loader.log.position("app:start").unwrap());
    assert_eq!(report.advisories.len(), 1);
    assert_eq!(report.advisories[0].plugin, "tool");
    assert_eq!(report.advisories[0].dependency, "ghost");
}

#[tokio::test]
async fn test_discovery_isolates_failures() {
    let harness = Harness::new(vec![
        MockSpec::new("good"),
        MockSpec::new("bad").failing("init"),
        MockSpec::new("dependent").requires("bad", ""),
        MockSpec::new("orphan").requires("nothing", ""),
    ]);
    let report = harness.manager.discover_plugins().await;

    assert_eq!(report.started, vec!["good"]);
    let failed: Vec<&str> = report.failures.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(failed.len(), 3);
    for name in ["bad", "dependent", "orphan"] {
        assert!(failed.contains(&name), "{} should have failed", name);
    }

    let orphan = report.failures.iter().find(|(n, _)| n == "orphan").unwrap();
    assert!(matches!(
        orphan.1,
        PluginError::Resolution(ResolutionError::MissingDependency { .. })
    ));
    let dependent = report
        .failures
        .iter()
        .find(|(n, _)| n == "dependent")
        .unwrap();
    assert!(matches!(
        dependent.1,
        PluginError::Resolution(ResolutionError::DependencyFailed { .. })
    ));

    assert_eq!(harness.manager.list_plugins().await, vec!["good"]);
    assert_eq!(
        harness
            .manager
            .lifecycle()
            .get_plugin_state("bad")
            .await
            .unwrap(),
        LifecycleState::Errored
    );
    assert!(!harness.manager.lifecycle().contains("orphan").await);
}

#[tokio::test]
async fn test_discovery_skips_excluded_plugins() {
    let harness = Harness::with_config(
        vec![MockSpec::new("keep"), MockSpec::new("skip")],
        |config| config.excluded_plugins = vec!["skip".to_string()],
    );
    let report = harness.manager.discover_plugins().await;

    assert_eq!(report.started, vec!["keep"]);
    assert_eq!(harness.loader.load_count("skip"), 0);
}

#[tokio::test]
async fn test_get_plugin_loads_dependencies_on_demand() {
    let harness = Harness::new(chain());

    let plugin = harness.manager.get_plugin("deploy").await.unwrap();
    assert_eq!(plugin.name, "deploy");
    assert_eq!(plugin.path, harness.path_of("deploy"));
    assert_eq!(
        harness.loader.log.plugins_for("start"),
        vec!["base", "docker", "deploy"]
    );

    // Served from the cache afterwards
    harness.manager.get_plugin("deploy").await.unwrap();
    harness.manager.get_plugin("base").await.unwrap();
    for name in ["base", "docker", "deploy"] {
        assert_eq!(harness.loader.load_count(name), 1);
    }
    assert_eq!(harness.loader.log.count("deploy:start"), 1);
}

#[tokio::test]
async fn test_get_plugin_unknown_is_not_found() {
    let harness = Harness::new(vec![]);
    let result = harness.manager.get_plugin("nope").await;
    assert!(matches!(result, Err(PluginError::NotFound { .. })));
}

#[tokio::test]
async fn test_get_plugin_missing_dependency() {
    let harness = Harness::new(vec![MockSpec::new("deploy").requires("ghost", "^1.0")]);

    let result = harness.manager.get_plugin("deploy").await;
    assert!(matches!(
        result,
        Err(PluginError::Resolution(ResolutionError::MissingDependency { ref dependency, .. }))
            if dependency == "ghost"
    ));
    assert!(!harness.manager.lifecycle().contains("deploy").await);
    assert!(harness.manager.list_plugins().await.is_empty());
    assert_eq!(harness.loader.latest("deploy").unwrap().release_count(), 1);
}

#[tokio::test]
async fn test_get_plugin_cycle_unloads_members() {
    let harness = Harness::new(vec![
        MockSpec::new("a").requires("b", ""),
        MockSpec::new("b").requires("a", ""),
    ]);

    let result = harness.manager.get_plugin("a").await;
    assert!(matches!(
        result,
        Err(PluginError::Resolution(ResolutionError::CyclicDependency { .. }))
    ));
    assert!(harness.manager.lifecycle().names().await.is_empty());
    assert_eq!(harness.loader.log.count("a:start"), 0);
}

#[tokio::test]
async fn test_get_plugin_dependency_start_failure() {
    let harness = Harness::new(vec![
        MockSpec::new("app").requires("db", ""),
        MockSpec::new("db").failing("start"),
    ]);

    let result = harness.manager.get_plugin("app").await;
    assert!(matches!(
        result,
        Err(PluginError::Resolution(ResolutionError::DependencyFailed { ref plugin, ref dependency }))
            if plugin == "app" && dependency == "db"
    ));
    assert_eq!(harness.loader.log.count("app:init"), 0);
    assert!(!harness.manager.lifecycle().contains("app").await);

    let status = harness.manager.lifecycle().plugin_status("db").await.unwrap();
    assert_eq!(status.state, LifecycleState::Errored);
}

#[tokio::test]
async fn test_expired_entry_is_terminated_and_reloaded() {
    let harness = Harness::with_config(vec![MockSpec::new("a")], |config| {
        config.cache_ttl = Duration::from_secs(60)
    });

    harness.manager.get_plugin("a").await.unwrap();
    let first = harness.loader.latest("a").unwrap();

    harness.clock.advance_time(Duration::from_secs(61));
    assert!(harness.manager.list_plugins().await.is_empty());

    harness.manager.get_plugin("a").await.unwrap();
    assert_eq!(harness.loader.load_count("a"), 2);
    assert_eq!(harness.loader.log.count("a:stop"), 1);
    assert!(first.release_count() >= 1);
    assert_eq!(harness.manager.list_plugins().await, vec!["a"]);
}

#[tokio::test]
async fn test_lookups_keep_entries_alive() {
    let harness = Harness::with_config(vec![MockSpec::new("a")], |config| {
        config.cache_ttl = Duration::from_secs(60)
    });

    harness.manager.get_plugin("a").await.unwrap();
    for _ in 0..3 {
        harness.clock.advance_time(Duration::from_secs(40));
        harness.manager.get_plugin("a").await.unwrap();
    }
    assert_eq!(harness.loader.load_count("a"), 1);
}

#[tokio::test]
async fn test_zero_ttl_never_expires() {
    let harness = Harness::with_config(vec![MockSpec::new("a")], |config| {
        config.cache_ttl = Duration::ZERO
    });

    harness.manager.get_plugin("a").await.unwrap();
    harness.clock.advance_time(Duration::from_secs(86_400));
    assert_eq!(harness.manager.list_plugins().await, vec!["a"]);
}

#[tokio::test]
async fn test_invalidate_cache_stops_plugin() {
    let harness = Harness::new(vec![MockSpec::new("a"), MockSpec::new("b")]);
    harness.manager.discover_plugins().await;

    assert!(harness.manager.invalidate_cache("a").await);
    assert!(!harness.manager.invalidate_cache("a").await);

    assert_eq!(harness.loader.log.count("a:stop"), 1);
    assert!(!harness.manager.lifecycle().contains("a").await);
    assert_eq!(harness.manager.list_plugins().await, vec!["b"]);

    // Still known, so it reloads on demand
    harness.manager.get_plugin("a").await.unwrap();
    assert_eq!(harness.loader.load_count("a"), 2);
}

#[tokio::test]
async fn test_invalidate_cache_evicts_dependents() {
    let harness = Harness::new(chain());
    harness.manager.discover_plugins().await;

    assert!(harness.manager.invalidate_cache("base").await);
    assert_eq!(
        harness.loader.log.plugins_for("stop"),
        vec!["deploy", "docker", "base"]
    );
    assert!(harness.manager.list_plugins().await.is_empty());
    assert!(harness.manager.lifecycle().names().await.is_empty());

    let docker = harness.manager.get_plugin("docker").await.unwrap();
    assert_eq!(docker.name, "docker");
    assert_eq!(harness.loader.load_count("base"), 2);
    assert_eq!(
        harness
            .manager
            .lifecycle()
            .get_plugin_state("base")
            .await
            .unwrap(),
        LifecycleState::Started
    );
    assert_eq!(harness.manager.list_plugins().await, vec!["base", "docker"]);
}

#[tokio::test]
async fn test_invalidate_middle_of_chain_keeps_its_dependency() {
    let harness = Harness::new(chain());
    harness.manager.discover_plugins().await;

    assert!(harness.manager.invalidate_cache("docker").await);
    assert_eq!(harness.loader.log.plugins_for("stop"), vec!["deploy", "docker"]);
    assert_eq!(harness.manager.list_plugins().await, vec!["base"]);
    assert_eq!(
        harness
            .manager
            .lifecycle()
            .get_plugin_state("base")
            .await
            .unwrap(),
        LifecycleState::Started
    );
}

#[tokio::test]
async fn test_lookups_keep_dependencies_alive() {
    let harness = Harness::with_config(chain(), |config| {
        config.cache_ttl = Duration::from_secs(60)
    });

    harness.manager.get_plugin("docker").await.unwrap();
    for _ in 0..2 {
        harness.clock.advance_time(Duration::from_secs(40));
        harness.manager.get_plugin("docker").await.unwrap();
    }

    assert_eq!(harness.loader.load_count("base"), 1);
    assert_eq!(harness.loader.load_count("docker"), 1);
    assert_eq!(harness.loader.log.count("base:stop"), 0);
    assert_eq!(harness.manager.list_plugins().await, vec!["base", "docker"]);
}

#[tokio::test]
async fn test_expired_dependency_takes_dependents_with_it() {
    let harness = Harness::with_config(chain(), |config| {
        config.cache_ttl = Duration::from_secs(60)
    });

    harness.manager.get_plugin("docker").await.unwrap();
    harness.clock.advance_time(Duration::from_secs(61));

    harness.manager.get_plugin("base").await.unwrap();
    assert_eq!(harness.loader.log.plugins_for("stop"), vec!["docker", "base"]);
    assert!(!harness.manager.lifecycle().contains("docker").await);
    assert_eq!(harness.loader.load_count("base"), 2);
    assert_eq!(harness.manager.list_plugins().await, vec!["base"]);
}

#[tokio::test]
async fn test_clear_cache_stops_dependents_first() {
    let harness = Harness::new(chain());
    harness.manager.discover_plugins().await;

    harness.manager.clear_cache().await;
    assert_eq!(
        harness.loader.log.plugins_for("stop"),
        vec!["deploy", "docker", "base"]
    );
    assert!(harness.manager.list_plugins().await.is_empty());
    assert!(harness.manager.lifecycle().names().await.is_empty());
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let harness = Harness::new(chain());
    harness.manager.discover_plugins().await;

    harness.manager.cleanup().await;
    harness.manager.cleanup().await;

    assert_eq!(harness.loader.log.plugins_for("stop").len(), 3);
    assert!(harness.manager.lifecycle().names().await.is_empty());
    for name in ["base", "docker", "deploy"] {
        assert!(harness.loader.latest(name).unwrap().release_count() >= 1);
    }
}

#[tokio::test]
async fn test_execute_routes_commands_and_aliases() {
    let harness = Harness::new(vec![
        MockSpec::new("node").command("test", &["t"]),
        MockSpec::new("docker").command("up", &[]),
    ]);
    harness.manager.discover_plugins().await;

    let output = harness
        .manager
        .execute("t", &["--watch".to_string()])
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, "test --watch");

    let output = harness.manager.execute("up", &[]).await.unwrap();
    assert_eq!(output.stdout, "up");

    let missing = harness.manager.execute("deploy", &[]).await;
    assert!(matches!(missing, Err(PluginError::CommandNotFound { .. })));
}

#[tokio::test]
async fn test_execute_reloads_evicted_plugin() {
    let harness = Harness::new(vec![MockSpec::new("node").command("test", &[])]);
    harness.manager.discover_plugins().await;
    harness.manager.invalidate_cache("node").await;

    harness.manager.execute("test", &[]).await.unwrap();
    assert_eq!(harness.loader.load_count("node"), 2);
}

#[tokio::test]
async fn test_execute_after_load_discovered_starts_only_the_owner() {
    let harness = Harness::new(vec![
        MockSpec::new("base"),
        MockSpec::new("docker").requires("base", "^1.0").command("up", &[]),
        MockSpec::new("node").command("test", &["t"]),
    ]);
    let report = harness.manager.load_discovered().await;
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.candidates, 3);
    assert!(report.started.is_empty());
    assert!(harness.loader.log.plugins_for("start").is_empty());

    let table = harness.manager.default_commands().await;
    assert_eq!(table.get("t").map(|e| e.plugin.as_str()), Some("node"));

    let output = harness.manager.execute("up", &[]).await.unwrap();
    assert_eq!(output.stdout, "up");
    assert_eq!(harness.loader.log.plugins_for("start"), vec!["base", "docker"]);
    assert_eq!(
        harness
            .manager
            .lifecycle()
            .get_plugin_state("node")
            .await
            .unwrap(),
        LifecycleState::Registered
    );
    for name in ["base", "docker", "node"] {
        assert_eq!(harness.loader.load_count(name), 1);
    }
}

#[tokio::test]
async fn test_shutdown_cancels_running_command() {
    let harness = Harness::new(vec![MockSpec::new("node")
        .command("test", &[])
        .delayed("execute", Duration::from_secs(5))]);
    harness.manager.discover_plugins().await;

    let manager = harness.manager.clone();
    let running = tokio::spawn(async move { manager.execute("test", &[]).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("execute ignored shutdown")
        .unwrap();
    assert!(matches!(
        result,
        Err(PluginError::Cancelled { ref plugin_name, .. }) if plugin_name == "node"
    ));
}

#[tokio::test]
async fn test_default_commands_first_discovered_wins() {
    let harness = Harness::new(vec![
        MockSpec::new("alpha").command("build", &["b"]),
        MockSpec::new("beta").command("build", &[]).command("bench", &["b"]),
    ]);
    harness.manager.discover_plugins().await;

    let table = harness.manager.default_commands().await;
    assert_eq!(table["build"].plugin, "alpha");
    assert_eq!(table["b"].plugin, "alpha");
    assert_eq!(table["bench"].plugin, "beta");
}

#[tokio::test]
async fn test_framework_commands() {
    let harness = Harness::new(vec![
        MockSpec::new("known").command("lint", &[]),
        MockSpec::new("fresh").command("fmt", &[]),
    ]);
    harness.manager.get_plugin("known").await.unwrap();

    let known = harness
        .manager
        .framework_commands(&harness.path_of("known"))
        .await
        .unwrap();
    assert_eq!(known[0].name, "lint");
    assert_eq!(harness.loader.load_count("known"), 1);

    // Unknown plugins are loaded, asked and released without being registered
    let fresh = harness
        .manager
        .framework_commands(&harness.path_of("fresh"))
        .await
        .unwrap();
    assert_eq!(fresh[0].name, "fmt");
    assert_eq!(harness.loader.latest("fresh").unwrap().release_count(), 1);
    assert!(!harness.manager.lifecycle().contains("fresh").await);
    assert_eq!(harness.loader.log.count("fresh:init"), 0);

    let invalid = harness
        .manager
        .framework_commands(&harness.dir.path().join("not-a-plugin"))
        .await;
    assert!(matches!(invalid, Err(PluginError::LoadError { .. })));
}

#[tokio::test]
async fn test_load_plugin_registers_without_starting() {
    let harness = Harness::new(vec![MockSpec::new("a")]);

    let loaded = harness
        .manager
        .load_plugin(&harness.path_of("a"))
        .await
        .unwrap();
    assert_eq!(loaded.name, "a");
    assert_eq!(loaded.metadata.version, "1.0.0");
    assert_eq!(
        harness
            .manager
            .lifecycle()
            .get_plugin_state("a")
            .await
            .unwrap(),
        LifecycleState::Registered
    );

    // get_plugin finishes bringing it up
    harness.manager.get_plugin("a").await.unwrap();
    assert_eq!(harness.loader.load_count("a"), 1);
    assert_eq!(harness.loader.log.count("a:start"), 1);
}

#[tokio::test]
async fn test_load_plugin_rejects_bad_paths() {
    let harness = Harness::new(vec![MockSpec::new("a")]);

    let missing = harness
        .manager
        .load_plugin(&harness.dir.path().join("devctx-plugin-missing"))
        .await;
    assert!(matches!(missing, Err(PluginError::LoadError { .. })));

    let misnamed = harness
        .manager
        .load_plugin(&harness.dir.path().join("random-tool"))
        .await;
    assert!(matches!(misnamed, Err(PluginError::LoadError { .. })));
}

#[cfg(unix)]
#[tokio::test]
async fn test_load_plugin_rejects_non_executable() {
    use std::os::unix::fs::PermissionsExt;

    let harness = Harness::new(vec![MockSpec::new("a")]);
    let path = harness.path_of("a");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

    let result = harness.manager.load_plugin(&path).await;
    assert!(matches!(result, Err(PluginError::LoadError { .. })));
    assert_eq!(harness.loader.load_count("a"), 0);
}

#[tokio::test]
async fn test_plugin_configuration_is_forwarded() {
    let harness = Harness::with_config(vec![MockSpec::new("docker")], |config| {
        let table: toml::Table = toml::from_str("registry = \"ghcr.io\"").unwrap();
        config
            .plugin_configs
            .insert("docker".to_string(), PluginConfig::from_toml(&table).unwrap());
    });

    harness.manager.get_plugin("docker").await.unwrap();
    let configured = harness.loader.latest("docker").unwrap().configured_with();
    assert_eq!(
        configured.unwrap().get("registry"),
        Some(&serde_json::json!("ghcr.io"))
    );
}

#[tokio::test]
async fn test_detect_context_merges_and_skips_slow_plugins() {
    let harness = Harness::with_config(
        vec![
            MockSpec::new("generic").context("node", 0.4),
            MockSpec::new("npm").context("node", 0.9),
            MockSpec::new("slow")
                .context("rust", 1.0)
                .delayed("detect", Duration::from_secs(5)),
            MockSpec::new("plain"),
        ],
        |config| {
            config.detection = DetectionLimits {
                per_plugin: Duration::from_millis(100),
                overall: Duration::from_millis(500),
            }
        },
    );
    harness.manager.discover_plugins().await;

    let context = harness.manager.detect_context(harness.dir.path()).await;
    assert_eq!(context.frameworks["node"].plugin, "npm");
    assert!(!context.frameworks.contains_key("rust"));
    assert_eq!(context.skipped, vec!["slow"]);
    assert_eq!(harness.loader.log.count("plain:detect"), 0);
}

#[tokio::test]
async fn test_plugin_statuses() {
    let harness = Harness::new(vec![
        MockSpec::new("good").version("2.1.0"),
        MockSpec::new("bad").failing("start"),
    ]);
    harness.manager.discover_plugins().await;

    let statuses = harness.manager.plugin_statuses().await;
    let names: Vec<&str> = statuses.iter().map(|s| s.status.name.as_str()).collect();
    assert_eq!(names, vec!["bad", "good"]);

    let bad = &statuses[0];
    assert_eq!(bad.status.state, LifecycleState::Errored);
    assert!(bad.status.last_error.is_some());
    assert!(bad.loaded_at.is_none());

    let good = &statuses[1];
    assert_eq!(good.status.state, LifecycleState::Started);
    assert_eq!(good.version.as_deref(), Some("2.1.0"));
    assert!(good.loaded_at.is_some());
    assert!(good.last_used.is_some());
}

#[tokio::test]
async fn test_project_directory_shadows_later_directories() {
    let global = tempfile::TempDir::new().unwrap();
    touch_plugin(global.path(), "docker");
    touch_plugin(global.path(), "extra");

    let harness = Harness::with_config(
        vec![MockSpec::new("docker"), MockSpec::new("extra")],
        |config| config.search_paths.push(global.path().to_path_buf()),
    );
    std::fs::remove_file(harness.path_of("extra")).unwrap();
    harness.manager.discover_plugins().await;

    let docker = harness.manager.get_plugin("docker").await.unwrap();
    assert_eq!(docker.path, harness.path_of("docker"));
    let extra = harness.manager.get_plugin("extra").await.unwrap();
    assert_eq!(extra.path.parent(), Some(global.path()));
}
