//! Context enrichment
//!
//! Asks every context-capable plugin about the project concurrently and
//! merges the answers. For each framework the most confident answer wins and
//! ties go to the plugin discovered first. Slow plugins are dropped after the
//! per-plugin timeout, and the whole pass ends at the overall deadline with
//! whatever has arrived by then.

use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::traits::Plugin;
use crate::plugin::types::{ContextDetection, FrameworkDetection, ProjectContext};
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Timeouts for one enrichment pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionLimits {
    pub per_plugin: Duration,
    pub overall: Duration,
}

impl Default for DetectionLimits {
    fn default() -> Self {
        Self {
            per_plugin: Duration::from_secs(2),
            overall: Duration::from_secs(5),
        }
    }
}

/// A plugin taking part in enrichment
#[derive(Clone)]
pub struct ContextTarget {
    pub name: String,
    pub discovery_index: usize,
    pub instance: Arc<dyn Plugin>,
}

/// Run detection on every target and merge the results
pub async fn detect_context(
    targets: Vec<ContextTarget>,
    project_root: &Path,
    limits: DetectionLimits,
) -> ProjectContext {
    let deadline = Instant::now() + limits.overall;
    let mut outstanding: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();

    let mut pending: FuturesUnordered<_> = targets
        .into_iter()
        .map(|target| async move {
            let result = detect_one(&target, project_root, limits.per_plugin).await;
            (target.name, target.discovery_index, result)
        })
        .collect();

    let mut answers: Vec<(String, usize, ContextDetection)> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, pending.next()).await {
            Ok(Some((name, index, result))) => {
                outstanding.retain(|n| n != &name);
                match result {
                    Ok(detection) => answers.push((name, index, detection)),
                    Err(e) => {
                        log::debug!("Context detection skipped for '{}': {}", name, e);
                        skipped.push(name);
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                log::warn!(
                    "Context detection deadline reached; {} plugin(s) still running",
                    outstanding.len()
                );
                skipped.append(&mut outstanding);
                break;
            }
        }
    }

    skipped.sort();
    let mut context = merge(answers);
    context.skipped = skipped;
    context
}

async fn detect_one(
    target: &ContextTarget,
    project_root: &Path,
    limit: Duration,
) -> PluginResult<ContextDetection> {
    let provider =
        target
            .instance
            .as_context_provider()
            .ok_or_else(|| PluginError::OperationFailed {
                plugin_name: target.name.clone(),
                operation: "detect-context".to_string(),
                cause: "plugin does not provide context".to_string(),
            })?;

    match tokio::time::timeout(limit, provider.detect_context(project_root)).await {
        Ok(result) => result,
        Err(_) => Err(PluginError::Timeout {
            plugin_name: target.name.clone(),
            operation: "detect-context".to_string(),
            timeout: limit,
        }),
    }
}

/// Combine detections, visiting plugins in discovery order
pub fn merge(mut answers: Vec<(String, usize, ContextDetection)>) -> ProjectContext {
    answers.sort_by_key(|(_, index, _)| *index);

    let mut context = ProjectContext::default();
    for (name, _, detection) in answers {
        if !detection.values.is_empty() {
            context.extensions.insert(name.clone(), detection.values);
        }

        let Some(framework) = detection.framework.filter(|f| !f.is_empty()) else {
            continue;
        };
        let confidence = if detection.confidence.is_nan() {
            0.0
        } else {
            detection.confidence
        };

        let replace = match context.frameworks.get(&framework) {
            Some(current) => confidence > current.confidence,
            None => true,
        };
        if replace {
            context.frameworks.insert(
                framework,
                FrameworkDetection {
                    plugin: name,
                    confidence,
                },
            );
        }
    }
    context
}
