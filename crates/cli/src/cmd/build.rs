//! Implementation of the `smartbuild build` command.
//!
//! Loads a plan, resolves the run configuration and builds the selected units
//! through Docker, reusing cached images whose fingerprint is unchanged.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::debug;

use smartbuild_lib::cancel::CancelToken;
use smartbuild_lib::config::BuildConfig;
use smartbuild_lib::orchestrator::{BuildOptions, BuildReport, Orchestrator, UnitStatus};
use smartbuild_lib::repository::GitRepository;

use super::{ConfigFlags, DEFAULT_PLAN_FILE, load_plan};
use crate::docker::{DockerBuilder, DockerRegistry};
use crate::output::{
  OutputFormat, format_duration, print_cached, print_error, print_info, print_json, print_pending, print_stat,
  print_success, print_warning, truncate_hash,
};

#[derive(Debug, Args)]
pub struct BuildArgs {
  /// Units to build (default: every unit in the plan)
  pub units: Vec<String>,

  /// Path to the plan file
  #[arg(short, long, default_value = DEFAULT_PLAN_FILE)]
  pub file: PathBuf,

  /// Build without looking up or pushing cached images
  #[arg(long)]
  pub no_cache: bool,

  /// Image reference to publish the unit under
  #[arg(short, long)]
  pub tag: Option<String>,

  /// Dockerfile stage to build
  #[arg(long)]
  pub target: Option<String>,

  /// Image to use as an external build cache
  #[arg(long = "cache-from", value_name = "IMAGE")]
  pub cache_from: Vec<String>,

  /// Build secret, as id=path
  #[arg(long = "secret", value_name = "ID=PATH", value_parser = parse_secret)]
  pub secrets: Vec<(String, String)>,

  #[command(flatten)]
  pub config: ConfigFlags,

  /// Output format
  #[arg(long, value_enum, default_value_t)]
  pub output: OutputFormat,
}

impl BuildArgs {
  pub fn options(&self) -> BuildOptions {
    BuildOptions {
      units: self.units.clone(),
      no_cache: self.no_cache,
      tag: self.tag.clone(),
      target: self.target.clone(),
      cache_from: self.cache_from.clone(),
      secrets: self.secrets.iter().cloned().collect(),
    }
  }
}

pub fn parse_secret(raw: &str) -> Result<(String, String), String> {
  match raw.split_once('=') {
    Some((id, path)) if !id.is_empty() && !path.is_empty() => Ok((id.to_string(), path.to_string())),
    _ => Err(format!("invalid secret '{}', expected id=path", raw)),
  }
}

/// Execute the build command.
///
/// Pre-build errors (unknown units, unsupported configuration) are returned
/// before anything runs. Otherwise the per-unit summary is printed even when
/// a unit fails, followed by the error that stopped the build.
pub fn cmd_build(args: &BuildArgs, verbose: bool) -> Result<()> {
  let plan = load_plan(&args.file)?;
  let repository = Arc::new(GitRepository::new(&plan.root));
  let config = args.config.apply(BuildConfig::from_env(repository.as_ref()));
  debug!(config = ?config, "resolved build configuration");

  if config.smart_builds_enabled && !config.is_clean_project && !args.no_cache {
    print_warning("Uncommitted changes detected, cached images will not be reused");
  }

  let registry = Arc::new(DockerRegistry::new(&config));
  let orchestrator = Orchestrator::new(Arc::new(DockerBuilder::default()), registry, repository, config);
  let options = args.options();
  let cancel = CancelToken::new();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async {
    let interrupt = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        interrupt.cancel();
      }
    });
    orchestrator.build(&plan, &options, &cancel).await
  })?;

  if args.output.is_json() {
    print_json(&report)?;
  } else {
    print_report(&report, verbose);
  }

  report.into_result().context("Build failed")?;
  Ok(())
}

fn print_report(report: &BuildReport, verbose: bool) {
  for outcome in report.outcomes.values() {
    let reference = outcome.reference.as_ref().map(ToString::to_string).unwrap_or_default();
    match outcome.status {
      UnitStatus::Built if outcome.cache_hit => print_cached(&format!("{} {} (cached)", outcome.unit, reference)),
      UnitStatus::Built if outcome.built => print_success(&format!(
        "{} {} ({})",
        outcome.unit,
        reference,
        format_duration(outcome.timings.total())
      )),
      UnitStatus::Built => print_info(&format!("{} {} (published)", outcome.unit, reference)),
      UnitStatus::Failed => print_error(&format!(
        "{}: {}",
        outcome.unit,
        outcome.error.as_deref().unwrap_or("failed")
      )),
      UnitStatus::Pending => print_pending(&format!("{} not built", outcome.unit)),
    }

    if verbose {
      if let Some(fingerprint) = &outcome.fingerprint {
        print_stat("Fingerprint", truncate_hash(&fingerprint.0));
      }
      print_stat("Fingerprinting", &format_duration(outcome.timings.fingerprint));
      print_stat("Cache lookup", &format_duration(outcome.timings.cache_lookup));
      print_stat("Build", &format_duration(outcome.timings.build));
    }
  }

  println!();
  print_stat("Built", &report.built_count().to_string());
  print_stat("Cached", &report.cache_hit_count().to_string());

  if !report.environment.is_empty() {
    println!();
    for (key, value) in &report.environment {
      println!("{}={}", key, value);
    }
  }
}
