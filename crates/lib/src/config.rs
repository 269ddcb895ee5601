//! Capability snapshot for one build invocation.
//!
//! Resolved once, before the orchestrator is constructed, and never consulted
//! again from the environment.
//!
//! # Environment
//!
//! | Variable                         | Field                  | Default         |
//! |----------------------------------|------------------------|-----------------|
//! | `OKTETO_SMART_BUILDS_ENABLED`    | `smart_builds_enabled` | `true`          |
//! | `OKTETO_MANAGED_CONTEXT`         | `is_managed`           | `false`         |
//! | `OKTETO_GLOBAL_REGISTRY_ACCESS`  | `has_global_access`    | `false`         |
//! | `OKTETO_DEV_NAMESPACE`           | `dev_namespace`        | `okteto.dev`    |
//! | `OKTETO_GLOBAL_NAMESPACE`        | `global_namespace`     | `okteto.global` |
//! | `SMARTBUILD_PARALLELISM`         | `parallelism`          | `1`             |

use serde::Serialize;
use tracing::warn;

use crate::consts::{DEV_REGISTRY_NAMESPACE, GLOBAL_REGISTRY_NAMESPACE};
use crate::repository::Repository;

pub const SMART_BUILDS_ENABLED_VAR: &str = "OKTETO_SMART_BUILDS_ENABLED";
pub const MANAGED_CONTEXT_VAR: &str = "OKTETO_MANAGED_CONTEXT";
pub const GLOBAL_ACCESS_VAR: &str = "OKTETO_GLOBAL_REGISTRY_ACCESS";
pub const DEV_NAMESPACE_VAR: &str = "OKTETO_DEV_NAMESPACE";
pub const GLOBAL_NAMESPACE_VAR: &str = "OKTETO_GLOBAL_NAMESPACE";
pub const PARALLELISM_VAR: &str = "SMARTBUILD_PARALLELISM";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildConfig {
  pub smart_builds_enabled: bool,
  pub has_global_access: bool,
  /// The source tree had no uncommitted changes when the snapshot was taken.
  pub is_clean_project: bool,
  /// Running against a managed context with private and shared registries.
  pub is_managed: bool,
  pub dev_namespace: String,
  pub global_namespace: String,
  /// Maximum units built concurrently within one round. Never zero.
  pub parallelism: usize,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      smart_builds_enabled: true,
      has_global_access: false,
      is_clean_project: false,
      is_managed: false,
      dev_namespace: DEV_REGISTRY_NAMESPACE.to_string(),
      global_namespace: GLOBAL_REGISTRY_NAMESPACE.to_string(),
      parallelism: 1,
    }
  }
}

impl BuildConfig {
  /// Resolve the snapshot from the process environment and the repository state.
  pub fn from_env(repository: &dyn Repository) -> Self {
    let defaults = Self::default();

    let is_clean_project = repository.is_clean().unwrap_or_else(|e| {
      warn!(error = %e, "could not determine repository status, treating it as dirty");
      false
    });

    Self {
      smart_builds_enabled: env_bool(SMART_BUILDS_ENABLED_VAR, defaults.smart_builds_enabled),
      has_global_access: env_bool(GLOBAL_ACCESS_VAR, defaults.has_global_access),
      is_clean_project,
      is_managed: env_bool(MANAGED_CONTEXT_VAR, defaults.is_managed),
      dev_namespace: env_string(DEV_NAMESPACE_VAR).unwrap_or(defaults.dev_namespace),
      global_namespace: env_string(GLOBAL_NAMESPACE_VAR).unwrap_or(defaults.global_namespace),
      parallelism: env_parallelism(defaults.parallelism),
    }
  }

  /// Whether cache lookups (and fingerprint-keyed pushes) apply to this run.
  pub fn caching_active(&self, no_cache: bool) -> bool {
    !no_cache && self.smart_builds_enabled && self.is_clean_project
  }
}

fn env_string(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
  let Some(raw) = env_string(name) else {
    return default;
  };
  match raw.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => true,
    "0" | "false" | "no" | "off" => false,
    _ => {
      warn!(variable = name, value = %raw, default, "invalid boolean, using default");
      default
    }
  }
}

fn env_parallelism(default: usize) -> usize {
  let Some(raw) = env_string(PARALLELISM_VAR) else {
    return default;
  };
  match raw.trim().parse::<usize>() {
    Ok(n) if n > 0 => n,
    _ => {
      warn!(variable = PARALLELISM_VAR, value = %raw, default, "invalid parallelism, using default");
      default
    }
  }
}
