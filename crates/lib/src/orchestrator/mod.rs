//! Build orchestration.
//!
//! This module provides the entry point for building the units of a plan.
//! It handles:
//! - Pre-build validation of the selection and configuration
//! - Round-based scheduling over the dependency graph
//! - Cache short-circuiting through fingerprint lookups
//! - Two-stage volume-mount builds
//! - Publishing each unit's outputs to the exported environment

pub mod graph;
pub mod types;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::cache::{CacheLookup, ImageChecker};
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::environment::ExportedEnvironment;
use crate::executor::{Builder, ExecuteOptions};
use crate::expand::{Layered, ProcessEnv, VarSource, expand};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::image::ImageReference;
use crate::plan::{BuildArg, BuildPlan, BuildUnit};
use crate::registry::Registry;
use crate::repository::Repository;
use crate::tag::{ImageTagger, StandardTagger, VolumeMountTagger};
use crate::volumes::{accessible_mounts, write_volume_dockerfile};

pub use graph::{BuildGraph, SchedulingError};
pub use types::{
  BuildError, BuildOptions, BuildOutcome, BuildReport, BuildTracker, LogTracker, UnitError, UnitStatus, UnitTimings,
};

type SharedVars = Arc<dyn VarSource + Send + Sync>;

/// Builds the units of a plan through the builder and registry collaborators.
pub struct Orchestrator {
  builder: Arc<dyn Builder>,
  registry: Arc<dyn Registry>,
  fingerprinter: Arc<Fingerprinter>,
  config: Arc<BuildConfig>,
  tracker: Arc<dyn BuildTracker>,
  ambient: SharedVars,
}

impl Orchestrator {
  pub fn new(
    builder: Arc<dyn Builder>,
    registry: Arc<dyn Registry>,
    repository: Arc<dyn Repository>,
    config: BuildConfig,
  ) -> Self {
    Self {
      builder,
      registry,
      fingerprinter: Arc::new(Fingerprinter::new(repository)),
      config: Arc::new(config),
      tracker: Arc::new(LogTracker),
      ambient: Arc::new(ProcessEnv),
    }
  }

  pub fn with_tracker(mut self, tracker: Arc<dyn BuildTracker>) -> Self {
    self.tracker = tracker;
    self
  }

  /// Replace the process environment as the fallback variable source.
  pub fn with_ambient_vars(mut self, vars: SharedVars) -> Self {
    self.ambient = vars;
    self
  }

  /// Build every selected unit of `plan`, dependencies first.
  ///
  /// Validation and configuration errors are returned before anything is
  /// built. Failures once building has started (a unit error, an
  /// unsatisfiable dependency, cancellation) stop the build and are recorded
  /// in [`BuildReport::error`] alongside the outcomes reached so far; use
  /// [`BuildReport::into_result`] to turn them into an `Err`.
  pub async fn build(
    &self,
    plan: &BuildPlan,
    options: &BuildOptions,
    cancel: &CancelToken,
  ) -> Result<BuildReport, BuildError> {
    let selected = self.select_units(plan, options)?;
    let graph = BuildGraph::from_plan(plan, &selected)?;
    let override_unit = options.has_unit_overrides().then(|| selected[0].clone());
    self.validate_units(plan, &graph, options, override_unit.as_deref())?;

    info!(plan = %plan.name, units = graph.unit_count(), "starting build");

    let env = Arc::new(ExportedEnvironment::new(self.config.smart_builds_enabled));
    let dependencies = graph
      .units()
      .into_iter()
      .map(|unit| {
        let deps = graph.transitive_dependencies(&unit);
        (unit, deps)
      })
      .collect();
    let runner = UnitRunner {
      builder: self.builder.clone(),
      registry: self.registry.clone(),
      fingerprinter: self.fingerprinter.clone(),
      config: self.config.clone(),
      ambient: self.ambient.clone(),
      env: env.clone(),
      plan: Arc::new(plan.clone()),
      options: Arc::new(options.clone()),
      dependencies: Arc::new(dependencies),
      override_unit,
      cancel: cancel.clone(),
    };

    let mut report = BuildReport::new(&graph.units());
    report.error = self.run_rounds(&graph, &runner, &mut report.outcomes).await;

    if report.error.is_none() {
      let vars = Layered::new(env.as_ref(), self.ambient.as_ref());
      match plan.expand(&vars) {
        Ok(expanded) => report.plan = Some(expanded),
        Err(e) => report.error = Some(BuildError::Expand(e)),
      }
    }
    report.environment = env.snapshot();

    let outcomes: Vec<BuildOutcome> = report.outcomes.values().cloned().collect();
    self.tracker.track(&plan.name, &outcomes);

    info!(
      plan = %plan.name,
      built = report.built_count(),
      cache_hits = report.cache_hit_count(),
      failed = report.error.is_some(),
      "build complete"
    );

    Ok(report)
  }

  fn select_units(&self, plan: &BuildPlan, options: &BuildOptions) -> Result<Vec<String>, BuildError> {
    let selected: Vec<String> = if options.units.is_empty() {
      plan.units.keys().cloned().collect()
    } else {
      options.units.clone()
    };

    if selected.is_empty() {
      return Err(BuildError::NoUnitsToBuild);
    }

    let mut unknown: Vec<String> = selected.iter().filter(|u| plan.unit(u).is_none()).cloned().collect();
    if !unknown.is_empty() {
      unknown.sort();
      unknown.dedup();
      return Err(BuildError::UnknownUnits(unknown));
    }

    if options.has_unit_overrides() && selected.len() != 1 {
      return Err(BuildError::FlagsRequireSingleUnit);
    }

    Ok(selected)
  }

  fn validate_units(
    &self,
    plan: &BuildPlan,
    graph: &BuildGraph,
    options: &BuildOptions,
    override_unit: Option<&str>,
  ) -> Result<(), BuildError> {
    for name in graph.units() {
      let Some(unit) = plan.unit(&name) else {
        continue;
      };
      let tag_override = options.tag.as_ref().filter(|_| override_unit == Some(name.as_str()));

      if unit.has_volume_mounts() && !self.config.is_managed {
        return Err(BuildError::VolumeMountsUnsupported { unit: name });
      }
      if !self.config.is_managed && unit.explicit_image().is_none() && tag_override.is_none() {
        return Err(BuildError::ImageRequired { unit: name });
      }
      if unit.has_volume_mounts() && !unit.has_dockerfile() && unit.explicit_image().is_none() && tag_override.is_none()
      {
        return Err(BuildError::MissingBaseImage { unit: name });
      }
    }
    Ok(())
  }

  async fn run_rounds(
    &self,
    graph: &BuildGraph,
    runner: &UnitRunner,
    outcomes: &mut BTreeMap<String, BuildOutcome>,
  ) -> Option<BuildError> {
    let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
    let mut done: HashSet<String> = HashSet::new();
    let mut round = 0;

    while done.len() < graph.unit_count() {
      if runner.cancel.is_cancelled() {
        return Some(BuildError::Cancelled);
      }

      let ready = graph.ready(&done);
      if ready.is_empty() {
        let err = graph.stuck(&done);
        error!(error = %err, "scheduling stopped");
        return Some(err.into());
      }

      debug!(round, units = ?ready, "building round");
      let results = run_round(&ready, runner, semaphore.clone()).await;

      let mut first_error = None;
      for (name, timings, result) in results {
        match result {
          Ok(unit) => {
            info!(unit = %name, reference = %unit.reference, built = unit.built, cache_hit = unit.cache_hit, "unit ready");
            if let Some(outcome) = outcomes.get_mut(&name) {
              outcome.status = UnitStatus::Built;
              outcome.built = unit.built;
              outcome.cache_hit = unit.cache_hit;
              outcome.reference = Some(unit.reference);
              outcome.fingerprint = unit.fingerprint;
              outcome.timings = timings;
            }
            done.insert(name);
          }
          Err(BuildError::Cancelled) => {
            first_error.get_or_insert(BuildError::Cancelled);
          }
          Err(e) => {
            error!(unit = %name, error = %e, "unit failed");
            if let Some(outcome) = outcomes.get_mut(&name) {
              outcome.status = UnitStatus::Failed;
              outcome.error = Some(e.to_string());
              outcome.timings = timings;
            }
            first_error.get_or_insert(e);
          }
        }
      }

      if first_error.is_some() {
        return first_error;
      }
      round += 1;
    }

    None
  }
}

/// Run one round, at most `semaphore` permits at a time.
///
/// The first failure aborts the rest of the round; aborted units are not reported.
async fn run_round(
  units: &[String],
  runner: &UnitRunner,
  semaphore: Arc<Semaphore>,
) -> Vec<(String, UnitTimings, Result<UnitSuccess, BuildError>)> {
  let mut join_set = JoinSet::new();

  for name in units {
    let runner = runner.clone();
    let semaphore = semaphore.clone();
    let name = name.clone();

    join_set.spawn(async move {
      let Ok(_permit) = semaphore.acquire().await else {
        return (name, UnitTimings::default(), Err(BuildError::Cancelled));
      };
      let mut timings = UnitTimings::default();
      let result = runner.run(&name, &mut timings).await;
      (name, timings, result)
    });
  }

  let mut results = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(result) => {
        if result.2.is_err() {
          join_set.abort_all();
        }
        results.push(result);
      }
      Err(e) if e.is_cancelled() => {}
      Err(e) => {
        error!(error = %e, "unit task panicked");
        join_set.abort_all();
        results.push((String::new(), UnitTimings::default(), Err(BuildError::TaskFailed(e.to_string()))));
      }
    }
  }

  results
}

struct UnitSuccess {
  reference: ImageReference,
  fingerprint: Option<Fingerprint>,
  built: bool,
  cache_hit: bool,
}

/// Everything a unit task needs, cheap to clone into each task.
#[derive(Clone)]
struct UnitRunner {
  builder: Arc<dyn Builder>,
  registry: Arc<dyn Registry>,
  fingerprinter: Arc<Fingerprinter>,
  config: Arc<BuildConfig>,
  ambient: SharedVars,
  env: Arc<ExportedEnvironment>,
  plan: Arc<BuildPlan>,
  options: Arc<BuildOptions>,
  /// Transitive dependencies of every unit in the graph.
  dependencies: Arc<BTreeMap<String, Vec<String>>>,
  override_unit: Option<String>,
  cancel: CancelToken,
}

impl UnitRunner {
  async fn run(&self, name: &str, timings: &mut UnitTimings) -> Result<UnitSuccess, BuildError> {
    if self.cancel.is_cancelled() {
      return Err(BuildError::Cancelled);
    }
    let Some(declared) = self.plan.unit(name) else {
      return Err(BuildError::UnknownUnits(vec![name.to_string()]));
    };

    let overridden = self.override_unit.as_deref() == Some(name);
    let declared = if overridden {
      self.apply_overrides(declared)
    } else {
      declared.clone()
    };
    // Fields may reference outputs of dependencies built in earlier rounds.
    let unit = declared
      .expand_fields(&self.vars())
      .map_err(|e| BuildError::unit(name, e))?;
    let tag_override = match self.options.tag.as_deref().filter(|_| overridden) {
      Some(tag) => Some(expand(tag, &self.vars()).map_err(|e| BuildError::unit(name, e))?),
      None => None,
    };

    info!(unit = name, "building unit");

    let success = if unit.has_dockerfile() {
      let tagger = StandardTagger::new((*self.config).clone());
      let stage1 = self
        .build_stage(name, &unit.without_volume_mounts(), &tagger, tag_override.as_deref(), timings)
        .await?;
      if unit.has_volume_mounts() {
        let base = stage1.reference.clone();
        let stage2 = self
          .build_volume_stage(name, &unit, &base.to_string(), &base.content_identity(), timings)
          .await?;
        UnitSuccess {
          built: stage1.built || stage2.built,
          ..stage2
        }
      } else {
        stage1
      }
    } else if unit.has_volume_mounts() {
      let base = tag_override
        .or_else(|| unit.explicit_image().map(str::to_string))
        .ok_or_else(|| BuildError::MissingBaseImage { unit: name.to_string() })?;
      let identity = ImageReference::parse(&base).content_identity();
      self.build_volume_stage(name, &unit, &base, &identity, timings).await?
    } else {
      self.publish_image(name, &unit, tag_override.as_deref()).await?
    };

    self.env.set_unit(name, &success.reference);
    Ok(success)
  }

  fn apply_overrides(&self, declared: &BuildUnit) -> BuildUnit {
    let mut unit = declared.clone();
    if let Some(target) = &self.options.target {
      unit.target = Some(target.clone());
    }
    if !self.options.cache_from.is_empty() {
      unit.cache_from = self.options.cache_from.clone();
    }
    unit.secrets.extend(self.options.secrets.clone());
    unit
  }

  fn vars(&self) -> Layered<'_> {
    Layered::new(self.env.as_ref(), self.ambient.as_ref())
  }

  fn caching_active(&self) -> bool {
    self.config.caching_active(self.options.no_cache)
  }

  /// Build (or reuse) the image of `unit` from its own Dockerfile.
  async fn build_stage(
    &self,
    name: &str,
    unit: &BuildUnit,
    tagger: &dyn ImageTagger,
    tag_override: Option<&str>,
    timings: &mut UnitTimings,
  ) -> Result<UnitSuccess, BuildError> {
    let started = Instant::now();
    let fingerprint = self.fingerprinter.service_fingerprint(&self.plan, unit, &self.vars());
    timings.fingerprint += started.elapsed();
    debug!(unit = name, fingerprint = %fingerprint, "computed fingerprint");

    if let Some(hit) = self.check_cache(name, tagger, &fingerprint, timings).await? {
      return Ok(UnitSuccess {
        reference: hit,
        fingerprint: Some(fingerprint),
        built: false,
        cache_hit: true,
      });
    }

    let reference = match tag_override {
      Some(tag) => ImageReference::parse(tag),
      None => tagger.reference(&self.plan, name, unit),
    };
    let mut tags = vec![reference.tagged()];
    if self.caching_active() {
      tags.push(tagger.cache_push_reference(&self.plan, name, &fingerprint).tagged());
    }

    let options = ExecuteOptions {
      context: self.plan.resolve_path(&unit.context),
      dockerfile: self.plan.resolve_path(unit.dockerfile.as_deref().unwrap_or_default()),
      tags,
      build_args: self.build_args(name, unit)?,
      secrets: unit
        .secrets
        .iter()
        .map(|(id, path)| (id.clone(), self.plan.resolve_path(path)))
        .collect(),
      target: unit.target.clone(),
      cache_from: unit.cache_from.clone(),
    };

    let reference = self.execute(name, &options, &reference, timings).await?;
    Ok(UnitSuccess {
      reference,
      fingerprint: Some(fingerprint),
      built: true,
      cache_hit: false,
    })
  }

  /// Layer the unit's accessible volume mounts onto `base`.
  ///
  /// The stage is keyed on `base_identity`, not on `base` itself.
  async fn build_volume_stage(
    &self,
    name: &str,
    unit: &BuildUnit,
    base: &str,
    base_identity: &str,
    timings: &mut UnitTimings,
  ) -> Result<UnitSuccess, BuildError> {
    let tagger = VolumeMountTagger::new((*self.config).clone());

    let started = Instant::now();
    let fingerprint = self
      .fingerprinter
      .volume_stage_fingerprint(&self.plan, unit, base_identity, &self.vars());
    timings.fingerprint += started.elapsed();

    if let Some(hit) = self.check_cache(name, &tagger, &fingerprint, timings).await? {
      return Ok(UnitSuccess {
        reference: hit,
        fingerprint: Some(fingerprint),
        built: false,
        cache_hit: true,
      });
    }

    info!(unit = name, base, "including volume mounts");
    let mounts = accessible_mounts(&self.plan, unit);
    let dockerfile = write_volume_dockerfile(&self.plan, base, &mounts).map_err(|e| BuildError::unit(name, e))?;

    let reference = tagger.reference(&self.plan, name, unit);
    let mut tags = vec![reference.tagged()];
    if self.caching_active() {
      tags.push(tagger.cache_push_reference(&self.plan, name, &fingerprint).tagged());
    }

    let options = ExecuteOptions {
      context: self.plan.root.clone(),
      dockerfile: dockerfile.path().to_path_buf(),
      tags,
      ..Default::default()
    };

    let reference = self.execute(name, &options, &reference, timings).await?;
    Ok(UnitSuccess {
      reference,
      fingerprint: Some(fingerprint),
      built: true,
      cache_hit: false,
    })
  }

  /// Publish an image-only unit without building it.
  async fn publish_image(
    &self,
    name: &str,
    unit: &BuildUnit,
    tag_override: Option<&str>,
  ) -> Result<UnitSuccess, BuildError> {
    let image = tag_override
      .map(str::to_string)
      .or_else(|| unit.explicit_image().map(str::to_string))
      .unwrap_or_default();

    let reference = match self
      .cancel
      .run(self.registry.resolve_digest(&image))
      .await
      .map_err(|_| BuildError::Cancelled)?
    {
      Ok(resolved) => resolved,
      Err(e) => {
        debug!(unit = name, image = %image, error = %e, "publishing image without digest");
        ImageReference::parse(&image)
      }
    };

    info!(unit = name, reference = %reference, "unit has no Dockerfile, publishing image as-is");
    Ok(UnitSuccess {
      reference,
      fingerprint: None,
      built: false,
      cache_hit: false,
    })
  }

  async fn check_cache(
    &self,
    name: &str,
    tagger: &dyn ImageTagger,
    fingerprint: &Fingerprint,
    timings: &mut UnitTimings,
  ) -> Result<Option<ImageReference>, BuildError> {
    if !self.caching_active() {
      return Ok(None);
    }

    let started = Instant::now();
    let checker = ImageChecker::new(self.registry.clone());
    let lookup = self
      .cancel
      .run(checker.check_built(&self.plan, name, tagger, fingerprint))
      .await
      .map_err(|_| BuildError::Cancelled)?
      .map_err(|e| BuildError::unit(name, e))?;
    timings.cache_lookup += started.elapsed();

    Ok(match lookup {
      CacheLookup::Hit(reference) => Some(reference),
      CacheLookup::Miss => None,
    })
  }

  /// Run the builder and resolve the digest of what it pushed.
  async fn execute(
    &self,
    name: &str,
    options: &ExecuteOptions,
    reference: &ImageReference,
    timings: &mut UnitTimings,
  ) -> Result<ImageReference, BuildError> {
    let started = Instant::now();
    info!(unit = name, tag = options.primary_tag(), "building image");

    self
      .cancel
      .run(self.builder.execute(options, &self.cancel))
      .await
      .map_err(|_| BuildError::Cancelled)?
      .map_err(|e| BuildError::unit(name, e))?;
    timings.build += started.elapsed();

    let tagged = reference.tagged();
    self
      .cancel
      .run(self.registry.resolve_digest(&tagged))
      .await
      .map_err(|_| BuildError::Cancelled)?
      .map_err(|source| {
        BuildError::unit(
          name,
          UnitError::Digest {
            reference: tagged.clone(),
            source,
          },
        )
      })
  }

  /// Expanded declared arguments, then the exports of the unit's dependencies it does not declare.
  fn build_args(&self, name: &str, unit: &BuildUnit) -> Result<Vec<BuildArg>, BuildError> {
    let mut args = unit
      .expanded_args(&self.vars())
      .map_err(|e| BuildError::unit(name, e))?;
    let dependencies = self.dependencies.get(name).map(Vec::as_slice).unwrap_or_default();
    for (key, value) in self.env.visible_to(dependencies) {
      if !args.iter().any(|a| a.name == key) {
        args.push(BuildArg { name: key, value });
      }
    }
    Ok(args)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{FakeBuilder, FakeRegistry, FakeRepository};
  use crate::plan::VolumeMount;
  use std::path::Path;
  use std::sync::Mutex;
  use std::time::Duration;
  use tempfile::TempDir;

  fn managed() -> BuildConfig {
    BuildConfig {
      is_managed: true,
      is_clean_project: true,
      ..BuildConfig::default()
    }
  }

  fn dockerfile_unit(deps: &[&str]) -> BuildUnit {
    BuildUnit {
      context: ".".to_string(),
      dockerfile: Some("Dockerfile".to_string()),
      depends_on: deps.iter().map(|d| d.to_string()).collect(),
      ..Default::default()
    }
  }

  fn chain_plan(root: &Path) -> BuildPlan {
    BuildPlan::new("p", root)
      .with_unit("a", dockerfile_unit(&[]))
      .with_unit("b", dockerfile_unit(&["a"]))
  }

  fn orchestrator(builder: &Arc<FakeBuilder>, registry: &Arc<FakeRegistry>, config: BuildConfig) -> Orchestrator {
    Orchestrator::new(
      builder.clone(),
      registry.clone(),
      Arc::new(FakeRepository::at("abc")),
      config,
    )
    .with_ambient_vars(Arc::new(BTreeMap::<String, String>::new()))
  }

  fn fakes() -> (Arc<FakeBuilder>, Arc<FakeRegistry>) {
    let registry = Arc::new(FakeRegistry::default());
    (Arc::new(FakeBuilder::new(registry.clone())), registry)
  }

  fn units(names: &[&str]) -> BuildOptions {
    BuildOptions {
      units: names.iter().map(|n| n.to_string()).collect(),
      ..Default::default()
    }
  }

  #[derive(Default)]
  struct RecordingTracker {
    outcomes: Mutex<Vec<BuildOutcome>>,
  }

  impl BuildTracker for RecordingTracker {
    fn track(&self, _plan_name: &str, outcomes: &[BuildOutcome]) {
      self.outcomes.lock().unwrap().extend_from_slice(outcomes);
    }
  }

  #[tokio::test]
  async fn dependencies_build_first_and_receive_exports() {
    let temp = TempDir::new().unwrap();
    let (builder, registry) = fakes();
    let tracker = Arc::new(RecordingTracker::default());
    let orchestrator = orchestrator(&builder, &registry, managed()).with_tracker(tracker.clone());

    let report = orchestrator
      .build(&chain_plan(temp.path()), &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    assert!(report.is_success());
    assert_eq!(
      builder.built_tags(),
      vec!["okteto.dev/p-a:okteto".to_string(), "okteto.dev/p-b:okteto".to_string()]
    );

    let b_args = &builder.calls()[1].options.build_args;
    let a_image = b_args.iter().find(|arg| arg.name == "OKTETO_BUILD_A_IMAGE").unwrap();
    assert!(a_image.value.starts_with("okteto.dev/p-a:okteto@sha256:"));

    assert_eq!(tracker.outcomes.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn failure_leaves_dependents_pending() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::default());
    let builder = Arc::new(FakeBuilder::new(registry.clone()).failing_on("p-a"));
    let orchestrator = orchestrator(&builder, &registry, managed());

    let report = orchestrator
      .build(&chain_plan(temp.path()), &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    assert!(matches!(report.error, Some(BuildError::Unit { ref unit, .. }) if unit == "a"));
    assert_eq!(report.outcomes["a"].status, UnitStatus::Failed);
    assert_eq!(report.outcomes["b"].status, UnitStatus::Pending);
    assert_eq!(builder.call_count(), 1);
    assert!(!report.environment.contains_key("OKTETO_BUILD_B_IMAGE"));
    assert!(report.into_result().is_err());
  }

  #[tokio::test]
  async fn cyclic_dependencies_terminate_with_scheduling_error() {
    let (builder, registry) = fakes();
    let plan = BuildPlan::new("p", Path::new("/nonexistent"))
      .with_unit("a", dockerfile_unit(&["b"]))
      .with_unit("b", dockerfile_unit(&["a"]))
      .with_unit("c", dockerfile_unit(&[]));
    let orchestrator = orchestrator(&builder, &registry, managed());

    let report = tokio::time::timeout(
      Duration::from_secs(5),
      orchestrator.build(&plan, &BuildOptions::default(), &CancelToken::new()),
    )
    .await
    .expect("build must not hang")
    .unwrap();

    assert!(matches!(
      report.error,
      Some(BuildError::Scheduling(SchedulingError::Unsatisfiable { ref units })) if units == &["a", "b"]
    ));
    assert_eq!(report.outcomes["c"].status, UnitStatus::Built);
    assert_eq!(report.outcomes["a"].status, UnitStatus::Pending);
    assert_eq!(builder.built_tags(), vec!["okteto.dev/p-c:okteto".to_string()]);
  }

  #[tokio::test]
  async fn volume_stage_copies_only_existing_paths() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("data")).unwrap();
    let unit = BuildUnit {
      volumes: vec![VolumeMount::new("data", "/app/data"), VolumeMount::new("missing", "/app/missing")],
      ..dockerfile_unit(&[])
    };
    let plan = BuildPlan::new("p", temp.path()).with_unit("api", unit);
    let (builder, registry) = fakes();

    let report = orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    assert!(report.is_success());
    let calls = builder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].options.primary_tag(), "okteto.dev/p-api:okteto");
    assert_eq!(calls[1].options.primary_tag(), "okteto.dev/p-api:okteto-with-volume-mounts");
    assert_eq!(calls[1].options.context, temp.path());

    let content = calls[1].dockerfile_content.clone().unwrap();
    assert!(content.starts_with("FROM okteto.dev/p-api:okteto@sha256:"));
    assert!(content.contains("COPY data /app/data\n"));
    assert!(!content.contains("missing"));

    let reference = report.outcomes["api"].reference.clone().unwrap();
    assert_eq!(reference.tagged(), "okteto.dev/p-api:okteto-with-volume-mounts");
  }

  #[tokio::test]
  async fn volume_unit_rerun_hits_cache() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("Dockerfile"), "FROM alpine").unwrap();
    std::fs::create_dir(temp.path().join("data")).unwrap();
    let unit = BuildUnit {
      volumes: vec![VolumeMount::new("data", "/app/data")],
      ..dockerfile_unit(&[])
    };
    let plan = BuildPlan::new("p", temp.path()).with_unit("api", unit);
    let (builder, registry) = fakes();

    let first = orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();
    assert!(first.outcomes["api"].built);
    assert_eq!(builder.call_count(), 2);

    let second = orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();
    let outcome = &second.outcomes["api"];
    assert!(outcome.cache_hit);
    assert!(!outcome.built);
    assert_eq!(outcome.fingerprint, first.outcomes["api"].fingerprint);
    assert_eq!(builder.call_count(), 2);
  }

  #[tokio::test]
  async fn volume_unit_without_dockerfile_layers_onto_explicit_image() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("data")).unwrap();
    let plan = BuildPlan::new("p", temp.path()).with_unit(
      "api",
      BuildUnit {
        context: ".".to_string(),
        image: Some("okteto/base:1".to_string()),
        volumes: vec![VolumeMount::new("data", "/app/data")],
        ..Default::default()
      },
    );
    let (builder, registry) = fakes();

    let report = orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    assert!(report.is_success());
    let calls = builder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].options.primary_tag(), "okteto.dev/p-api:okteto-with-volume-mounts");
    let content = calls[0].dockerfile_content.clone().unwrap();
    assert!(content.starts_with("FROM okteto/base:1\n"));
    assert!(content.contains("COPY data /app/data\n"));

    let rerun = orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();
    assert!(rerun.outcomes["api"].cache_hit);
    assert_eq!(builder.call_count(), 1);
  }

  #[tokio::test]
  async fn explicit_image_is_expanded_before_tagging() {
    let temp = TempDir::new().unwrap();
    let unit = BuildUnit {
      image: Some("${REG}/api:dev".to_string()),
      ..dockerfile_unit(&[])
    };
    let plan = BuildPlan::new("p", temp.path()).with_unit("api", unit.clone());
    let (builder, registry) = fakes();
    let ambient: BTreeMap<String, String> = [("REG".to_string(), "registry.example.com".to_string())]
      .into_iter()
      .collect();

    let report = orchestrator(&builder, &registry, managed())
      .with_ambient_vars(Arc::new(ambient))
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    assert_eq!(builder.built_tags()[0], "registry.example.com/api:dev");
    assert!(report.environment["OKTETO_BUILD_API_IMAGE"].starts_with("registry.example.com/api:dev@sha256:"));

    let literal = BuildUnit {
      image: Some("registry.example.com/api:dev".to_string()),
      ..unit
    };
    let expected = Fingerprinter::new(Arc::new(FakeRepository::at("abc"))).service_fingerprint(
      &plan,
      &literal,
      &BTreeMap::<String, String>::new(),
    );
    assert_eq!(report.outcomes["api"].fingerprint.as_ref(), Some(&expected));
  }

  #[tokio::test]
  async fn build_args_carry_only_dependency_outputs() {
    let plan = BuildPlan::new("p", Path::new("/nonexistent"))
      .with_unit("a", dockerfile_unit(&[]))
      .with_unit("b", dockerfile_unit(&[]))
      .with_unit("c", dockerfile_unit(&["a"]));
    let (builder, registry) = fakes();
    let config = BuildConfig {
      parallelism: 4,
      ..managed()
    };

    let report = orchestrator(&builder, &registry, config)
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();
    assert!(report.is_success());

    let calls = builder.calls();
    let c_call = calls
      .iter()
      .find(|call| call.options.primary_tag() == "okteto.dev/p-c:okteto")
      .unwrap();
    let names: Vec<&str> = c_call.options.build_args.iter().map(|arg| arg.name.as_str()).collect();
    assert!(names.contains(&"OKTETO_BUILD_A_IMAGE"));
    assert!(names.contains(&"OKTETO_ENABLE_SMART_BUILD"));
    assert!(!names.iter().any(|name| name.starts_with("OKTETO_BUILD_B_")));
  }

  #[tokio::test]
  async fn volume_mounts_require_managed_context() {
    let plan = BuildPlan::new("p", Path::new("/nonexistent")).with_unit(
      "api",
      BuildUnit {
        image: Some("okteto/api".to_string()),
        volumes: vec![VolumeMount::new("data", "/data")],
        ..dockerfile_unit(&[])
      },
    );
    let (builder, registry) = fakes();

    let err = orchestrator(&builder, &registry, BuildConfig::default())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap_err();

    assert!(matches!(err, BuildError::VolumeMountsUnsupported { ref unit } if unit == "api"));
    assert!(err.hint().is_some());
    assert_eq!(builder.call_count(), 0);
  }

  #[tokio::test]
  async fn image_required_outside_managed_context() {
    let (builder, registry) = fakes();
    let err = orchestrator(&builder, &registry, BuildConfig::default())
      .build(&chain_plan(Path::new("/nonexistent")), &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, BuildError::ImageRequired { ref unit } if unit == "a"));
  }

  #[tokio::test]
  async fn rerun_of_unchanged_plan_hits_cache() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("Dockerfile"), "FROM alpine").unwrap();
    let plan = chain_plan(temp.path());
    let (builder, registry) = fakes();

    let first = orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();
    assert!(first.is_success());
    assert_eq!(builder.call_count(), 2);

    let second = orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();
    assert!(second.is_success());
    assert!(second.outcomes.values().all(|o| o.cache_hit && !o.built));
    assert_eq!(builder.call_count(), 2);
  }

  #[tokio::test]
  async fn no_cache_and_dirty_trees_skip_lookups() {
    let temp = TempDir::new().unwrap();
    let plan = BuildPlan::new("p", temp.path()).with_unit("a", dockerfile_unit(&[]));
    let (builder, registry) = fakes();

    orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    let no_cache = BuildOptions {
      no_cache: true,
      ..Default::default()
    };
    let report = orchestrator(&builder, &registry, managed())
      .build(&plan, &no_cache, &CancelToken::new())
      .await
      .unwrap();
    assert!(report.outcomes["a"].built);

    let dirty = BuildConfig {
      is_clean_project: false,
      ..managed()
    };
    orchestrator(&builder, &registry, dirty)
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    assert_eq!(builder.call_count(), 3);
    // Fingerprint-keyed tags are only pushed when caching is active.
    assert_eq!(builder.calls()[0].options.tags.len(), 2);
    assert_eq!(builder.calls()[1].options.tags.len(), 1);
  }

  #[tokio::test]
  async fn shared_cache_hit_is_cloned_to_private_registry() {
    let temp = TempDir::new().unwrap();
    let plan = BuildPlan::new("p", temp.path()).with_unit("a", dockerfile_unit(&[]));
    let (builder, registry) = fakes();
    let config = BuildConfig {
      has_global_access: true,
      ..managed()
    };

    let fingerprint = Fingerprinter::new(Arc::new(FakeRepository::at("abc"))).service_fingerprint(
      &plan,
      &plan.units["a"],
      &BTreeMap::<String, String>::new(),
    );
    registry.publish(&format!("okteto.global/p-a:{}", fingerprint));

    let report = orchestrator(&builder, &registry, config)
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    let outcome = &report.outcomes["a"];
    assert!(outcome.cache_hit);
    assert_eq!(outcome.fingerprint.as_ref(), Some(&fingerprint));
    assert!(outcome.reference.as_ref().unwrap().is_in_namespace("okteto.dev"));
    assert_eq!(registry.clone_count(), 1);
    assert_eq!(builder.call_count(), 0);
  }

  #[tokio::test]
  async fn exports_all_keys_and_expands_plan() {
    let temp = TempDir::new().unwrap();
    let mut plan = BuildPlan::new("p", temp.path()).with_unit("a", dockerfile_unit(&[]));
    plan.deploy.push("helm upgrade --set image=${OKTETO_BUILD_A_IMAGE}".to_string());
    let (builder, registry) = fakes();

    let report = orchestrator(&builder, &registry, managed())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    for suffix in ["IMAGE", "REGISTRY", "REPOSITORY", "TAG", "SHA"] {
      let key = format!("OKTETO_BUILD_A_{}", suffix);
      assert!(!report.environment[&key].is_empty(), "{} is empty", key);
    }
    assert_eq!(report.environment["OKTETO_ENABLE_SMART_BUILD"], "true");

    let expanded = report.plan.unwrap();
    assert!(expanded.deploy[0].starts_with("helm upgrade --set image=okteto.dev/p-a:okteto@sha256:"));
  }

  #[tokio::test]
  async fn image_only_unit_is_published_without_building() {
    let plan = BuildPlan::new("p", Path::new("/nonexistent")).with_unit(
      "web",
      BuildUnit {
        image: Some("okteto/test".to_string()),
        ..Default::default()
      },
    );
    let (builder, registry) = fakes();
    registry.publish("okteto/test");

    let report = orchestrator(&builder, &registry, BuildConfig::default())
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    let outcome = &report.outcomes["web"];
    assert_eq!(outcome.status, UnitStatus::Built);
    assert!(!outcome.built);
    assert!(outcome.reference.as_ref().unwrap().digest.is_some());
    assert_eq!(report.environment["OKTETO_BUILD_WEB_REPOSITORY"], "okteto/test");
    assert_eq!(builder.call_count(), 0);
  }

  #[tokio::test]
  async fn selection_includes_dependencies() {
    let (builder, registry) = fakes();
    let report = orchestrator(&builder, &registry, managed())
      .build(&chain_plan(Path::new("/nonexistent")), &units(&["b"]), &CancelToken::new())
      .await
      .unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(builder.call_count(), 2);
  }

  #[tokio::test]
  async fn selection_errors_are_reported_before_building() {
    let (builder, registry) = fakes();
    let orchestrator = orchestrator(&builder, &registry, managed());
    let token = CancelToken::new();

    let empty = BuildPlan::new("p", Path::new("/nonexistent"));
    assert!(matches!(
      orchestrator.build(&empty, &BuildOptions::default(), &token).await,
      Err(BuildError::NoUnitsToBuild)
    ));

    let plan = chain_plan(Path::new("/nonexistent"));
    assert!(matches!(
      orchestrator.build(&plan, &units(&["x"]), &token).await,
      Err(BuildError::UnknownUnits(ref names)) if names == &["x"]
    ));

    let flags = BuildOptions {
      target: Some("prod".to_string()),
      ..units(&["a", "b"])
    };
    assert!(matches!(
      orchestrator.build(&plan, &flags, &token).await,
      Err(BuildError::FlagsRequireSingleUnit)
    ));

    let missing = BuildPlan::new("p", Path::new("/nonexistent")).with_unit("a", dockerfile_unit(&["db"]));
    assert!(matches!(
      orchestrator.build(&missing, &BuildOptions::default(), &token).await,
      Err(BuildError::Scheduling(SchedulingError::MissingDependency { .. }))
    ));
    assert_eq!(builder.call_count(), 0);
  }

  #[tokio::test]
  async fn overrides_apply_to_the_requested_unit() {
    let plan = BuildPlan::new("p", Path::new("/nonexistent")).with_unit("a", dockerfile_unit(&[]));
    let (builder, registry) = fakes();
    let options = BuildOptions {
      tag: Some("registry.example.com/custom:1".to_string()),
      target: Some("prod".to_string()),
      secrets: [("npmrc".to_string(), "/home/me/.npmrc".to_string())].into_iter().collect(),
      ..units(&["a"])
    };

    let report = orchestrator(&builder, &registry, managed())
      .build(&plan, &options, &CancelToken::new())
      .await
      .unwrap();

    let call = &builder.calls()[0].options;
    assert_eq!(call.primary_tag(), "registry.example.com/custom:1");
    assert_eq!(call.target.as_deref(), Some("prod"));
    assert_eq!(call.secrets["npmrc"], Path::new("/home/me/.npmrc"));
    assert_eq!(
      report.outcomes["a"].reference.as_ref().unwrap().tagged(),
      "registry.example.com/custom:1"
    );
  }

  #[tokio::test]
  async fn cancellation_stops_the_build() {
    let registry = Arc::new(FakeRegistry::default());
    let builder = Arc::new(FakeBuilder::new(registry.clone()).with_delay(Duration::from_secs(30)));
    let orchestrator = orchestrator(&builder, &registry, managed());
    let token = CancelToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      canceller.cancel();
    });

    let report = tokio::time::timeout(
      Duration::from_secs(5),
      orchestrator.build(&chain_plan(Path::new("/nonexistent")), &BuildOptions::default(), &token),
    )
    .await
    .expect("cancellation must interrupt the build")
    .unwrap();

    assert!(matches!(report.error, Some(BuildError::Cancelled)));
    assert_eq!(report.outcomes["a"].status, UnitStatus::Pending);
    assert_eq!(report.outcomes["b"].status, UnitStatus::Pending);
    assert!(!report.environment.contains_key("OKTETO_BUILD_A_IMAGE"));
    assert_eq!(builder.call_count(), 1);
  }

  #[tokio::test]
  async fn cancelled_token_builds_nothing() {
    let (builder, registry) = fakes();
    let token = CancelToken::new();
    token.cancel();

    let report = orchestrator(&builder, &registry, managed())
      .build(&chain_plan(Path::new("/nonexistent")), &BuildOptions::default(), &token)
      .await
      .unwrap();

    assert!(matches!(report.into_result(), Err(BuildError::Cancelled)));
    assert_eq!(builder.call_count(), 0);
  }

  #[tokio::test]
  async fn parallel_rounds_build_independent_units() {
    let registry = Arc::new(FakeRegistry::default());
    let builder = Arc::new(FakeBuilder::new(registry.clone()).with_delay(Duration::from_millis(10)));
    let plan = BuildPlan::new("p", Path::new("/nonexistent"))
      .with_unit("a", dockerfile_unit(&[]))
      .with_unit("b", dockerfile_unit(&[]))
      .with_unit("c", dockerfile_unit(&["a", "b"]));
    let config = BuildConfig {
      parallelism: 4,
      ..managed()
    };

    let report = orchestrator(&builder, &registry, config)
      .build(&plan, &BuildOptions::default(), &CancelToken::new())
      .await
      .unwrap();

    assert!(report.is_success());
    assert_eq!(builder.built_tags().last().map(String::as_str), Some("okteto.dev/p-c:okteto"));
  }
}
