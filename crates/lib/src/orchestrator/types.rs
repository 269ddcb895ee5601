//! Types for build orchestration.
//!
//! This module defines the error taxonomy, the per-unit outcome records and
//! the options accepted by [`super::Orchestrator::build`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::CacheError;
use crate::executor::ExecutorError;
use crate::expand::ExpandError;
use crate::fingerprint::Fingerprint;
use crate::image::ImageReference;
use crate::plan::BuildPlan;
use crate::registry::RegistryError;

use super::graph::SchedulingError;

/// What one invocation should build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
  /// Units to build; empty means every unit of the plan.
  pub units: Vec<String>,
  /// Skip cache lookups and fingerprint-keyed pushes.
  pub no_cache: bool,
  /// Reference the requested unit is published under.
  pub tag: Option<String>,
  pub target: Option<String>,
  pub cache_from: Vec<String>,
  /// Secret id -> local path, merged over the unit's own secrets.
  pub secrets: BTreeMap<String, String>,
}

impl BuildOptions {
  /// Whether any option only valid for a single unit is set.
  pub fn has_unit_overrides(&self) -> bool {
    self.tag.is_some() || self.target.is_some() || !self.cache_from.is_empty() || !self.secrets.is_empty()
  }
}

/// Failures of a single unit's collaborators.
#[derive(Debug, Error)]
pub enum UnitError {
  #[error(transparent)]
  Executor(#[from] ExecutorError),

  #[error("failed to access image '{reference}' at the registry: {source}")]
  Digest {
    reference: String,
    #[source]
    source: RegistryError,
  },

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("failed to prepare volume mounts: {0}")]
  Volume(#[from] std::io::Error),

  #[error("failed to expand unit values: {0}")]
  Expand(#[from] ExpandError),
}

/// Errors that abort a build.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("no units to build")]
  NoUnitsToBuild,

  #[error("units not defined in the plan: {}", .0.join(", "))]
  UnknownUnits(Vec<String>),

  #[error("tag, target, cache-from and secret options require exactly one unit")]
  FlagsRequireSingleUnit,

  #[error("unit '{unit}': build with volume mounts is not supported outside a managed context")]
  VolumeMountsUnsupported { unit: String },

  #[error("unit '{unit}': an image is required outside a managed context")]
  ImageRequired { unit: String },

  #[error("unit '{unit}': volume mounts need a Dockerfile or an image to layer onto")]
  MissingBaseImage { unit: String },

  #[error(transparent)]
  Scheduling(#[from] SchedulingError),

  #[error("error building unit '{unit}': {source}")]
  Unit {
    unit: String,
    #[source]
    source: UnitError,
  },

  #[error("build cancelled")]
  Cancelled,

  #[error("unit build task failed: {0}")]
  TaskFailed(String),

  #[error("failed to expand plan: {0}")]
  Expand(#[from] ExpandError),
}

impl BuildError {
  pub(crate) fn unit(unit: &str, source: impl Into<UnitError>) -> Self {
    Self::Unit {
      unit: unit.to_string(),
      source: source.into(),
    }
  }

  /// A remediation hint for errors the user can fix.
  pub fn hint(&self) -> Option<&'static str> {
    match self {
      Self::VolumeMountsUnsupported { .. } => Some("Please connect to a managed context and try again"),
      Self::ImageRequired { .. } => Some("Define an 'image' for the unit or connect to a managed context"),
      Self::MissingBaseImage { .. } => Some("Define a 'dockerfile' or an 'image' for the unit"),
      Self::FlagsRequireSingleUnit => Some("Select a single unit when using --tag, --target, --cache-from or --secret"),
      Self::UnknownUnits(_) => Some("Check the unit names defined under 'build' in the plan"),
      _ => None,
    }
  }
}

/// Lifecycle state of a unit within one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
  /// Not attempted, or abandoned before it finished.
  Pending,
  Built,
  Failed,
}

/// Time spent in each phase of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitTimings {
  pub fingerprint: Duration,
  pub cache_lookup: Duration,
  pub build: Duration,
}

impl UnitTimings {
  pub fn total(&self) -> Duration {
    self.fingerprint + self.cache_lookup + self.build
  }
}

/// The record emitted for every unit of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildOutcome {
  pub unit: String,
  pub status: UnitStatus,
  /// An image was built (as opposed to reused or published as-is).
  pub built: bool,
  pub cache_hit: bool,
  pub reference: Option<ImageReference>,
  pub fingerprint: Option<Fingerprint>,
  pub error: Option<String>,
  pub timings: UnitTimings,
}

impl BuildOutcome {
  pub fn pending(unit: &str) -> Self {
    Self {
      unit: unit.to_string(),
      status: UnitStatus::Pending,
      built: false,
      cache_hit: false,
      reference: None,
      fingerprint: None,
      error: None,
      timings: UnitTimings::default(),
    }
  }
}

/// Result of one `build` call.
#[derive(Debug, Serialize)]
pub struct BuildReport {
  pub outcomes: BTreeMap<String, BuildOutcome>,
  /// Exported variables after the last unit finished.
  pub environment: BTreeMap<String, String>,
  /// The error that stopped the build, if any.
  #[serde(serialize_with = "serialize_error")]
  pub error: Option<BuildError>,
  /// The plan with every variable reference expanded. Set on success.
  #[serde(skip)]
  pub plan: Option<BuildPlan>,
}

fn serialize_error<S: Serializer>(error: &Option<BuildError>, serializer: S) -> Result<S::Ok, S::Error> {
  match error {
    Some(e) => serializer.serialize_some(&e.to_string()),
    None => serializer.serialize_none(),
  }
}

impl BuildReport {
  pub fn new(units: &[String]) -> Self {
    Self {
      outcomes: units.iter().map(|u| (u.clone(), BuildOutcome::pending(u))).collect(),
      environment: BTreeMap::new(),
      error: None,
      plan: None,
    }
  }

  pub fn is_success(&self) -> bool {
    self.error.is_none() && self.outcomes.values().all(|o| o.status == UnitStatus::Built)
  }

  pub fn built_count(&self) -> usize {
    self.outcomes.values().filter(|o| o.built).count()
  }

  pub fn cache_hit_count(&self) -> usize {
    self.outcomes.values().filter(|o| o.cache_hit).count()
  }

  /// The report on success, or the error that stopped the build.
  pub fn into_result(mut self) -> Result<Self, BuildError> {
    match self.error.take() {
      Some(e) => Err(e),
      None => Ok(self),
    }
  }
}

/// Receives the outcome records of every build.
pub trait BuildTracker: Send + Sync {
  fn track(&self, plan_name: &str, outcomes: &[BuildOutcome]);
}

/// Emits one `tracing` event per outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracker;

impl BuildTracker for LogTracker {
  fn track(&self, plan_name: &str, outcomes: &[BuildOutcome]) {
    for outcome in outcomes {
      let reference = outcome.reference.as_ref().map(ToString::to_string).unwrap_or_default();
      match outcome.status {
        UnitStatus::Failed => warn!(
          plan = plan_name,
          unit = %outcome.unit,
          error = outcome.error.as_deref().unwrap_or_default(),
          duration_ms = outcome.timings.total().as_millis() as u64,
          "unit failed"
        ),
        _ => info!(
          plan = plan_name,
          unit = %outcome.unit,
          status = ?outcome.status,
          built = outcome.built,
          cache_hit = outcome.cache_hit,
          reference = %reference,
          duration_ms = outcome.timings.total().as_millis() as u64,
          "unit outcome"
        ),
      }
    }
  }
}
