//! Implementation of the `smartbuild hash` command.
//!
//! Prints the fingerprints of each unit and the image references its tag
//! strategy yields, without building anything or touching a registry.
//!
//! The keys shown are the ones `build` looks up first. For a unit with both a
//! Dockerfile and volume mounts that is its Dockerfile build: the layering
//! stage is keyed on the digest that build produces, which only the registry
//! knows.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use smartbuild_lib::config::BuildConfig;
use smartbuild_lib::expand::ProcessEnv;
use smartbuild_lib::fingerprint::{Fingerprint, Fingerprinter};
use smartbuild_lib::image::ImageReference;
use smartbuild_lib::orchestrator::BuildError;
use smartbuild_lib::plan::{BuildPlan, BuildUnit};
use smartbuild_lib::repository::GitRepository;
use smartbuild_lib::tag::tagger_for;

use super::{ConfigFlags, DEFAULT_PLAN_FILE, load_plan};
use crate::output::{OutputFormat, print_info, print_json, print_stat, truncate_hash};

#[derive(Debug, Args)]
pub struct HashArgs {
  /// Units to fingerprint (default: every unit in the plan)
  pub units: Vec<String>,

  /// Path to the plan file
  #[arg(short, long, default_value = DEFAULT_PLAN_FILE)]
  pub file: PathBuf,

  #[command(flatten)]
  pub config: ConfigFlags,

  /// Output format
  #[arg(long, value_enum, default_value_t)]
  pub output: OutputFormat,
}

/// Fingerprints and references of one unit.
#[derive(Debug, Serialize)]
pub struct UnitHashes {
  pub unit: String,
  pub commit: Fingerprint,
  pub context: Fingerprint,
  pub fingerprint: Fingerprint,
  pub image: String,
  pub cache_images: Vec<String>,
}

/// The unit whose fingerprint `build` looks up first.
///
/// A volume unit without a Dockerfile is keyed on its base image; every other
/// unit on its own inputs without mounts.
fn lookup_unit(unit: &BuildUnit) -> BuildUnit {
  if unit.has_dockerfile() || !unit.has_volume_mounts() {
    return unit.without_volume_mounts();
  }
  let base = unit
    .explicit_image()
    .map(|image| ImageReference::parse(image).content_identity())
    .unwrap_or_default();
  BuildUnit {
    image: Some(base),
    ..unit.clone()
  }
}

pub fn unit_hashes(
  plan: &BuildPlan,
  units: &[String],
  config: &BuildConfig,
  fingerprinter: &Fingerprinter,
) -> Result<Vec<UnitHashes>, BuildError> {
  let selected: Vec<String> = if units.is_empty() {
    plan.units.keys().cloned().collect()
  } else {
    units.to_vec()
  };

  let unknown: Vec<String> = selected.iter().filter(|u| plan.unit(u).is_none()).cloned().collect();
  if !unknown.is_empty() {
    return Err(BuildError::UnknownUnits(unknown));
  }

  let vars = ProcessEnv;
  let mut hashes = Vec::new();
  for name in selected {
    let Some(unit) = plan.unit(&name) else {
      continue;
    };
    let unit = lookup_unit(&unit.expand_fields(&vars).map_err(BuildError::Expand)?);
    let tagger = tagger_for(&unit, config);
    let fingerprint = fingerprinter.service_fingerprint(plan, &unit, &vars);

    hashes.push(UnitHashes {
      commit: fingerprinter.commit_fingerprint(&unit, &vars),
      context: fingerprinter.context_fingerprint(plan, &unit, &vars),
      image: tagger.reference(plan, &name, &unit).to_string(),
      cache_images: tagger
        .cache_references(plan, &name, &fingerprint)
        .iter()
        .map(ToString::to_string)
        .collect(),
      fingerprint,
      unit: name,
    });
  }
  Ok(hashes)
}

pub fn cmd_hash(args: &HashArgs) -> Result<()> {
  let plan = load_plan(&args.file)?;
  let repository = Arc::new(GitRepository::new(&plan.root));
  let config = args.config.apply(BuildConfig::from_env(repository.as_ref()));
  let fingerprinter = Fingerprinter::new(repository);

  let hashes = unit_hashes(&plan, &args.units, &config, &fingerprinter)?;

  if args.output.is_json() {
    return print_json(&hashes);
  }

  for (i, unit) in hashes.iter().enumerate() {
    if i > 0 {
      println!();
    }
    print_info(&unit.unit);
    print_stat("Fingerprint", &unit.fingerprint.0);
    print_stat("Commit", truncate_hash(&unit.commit.0));
    print_stat("Context", truncate_hash(&unit.context.0));
    print_stat("Image", &unit.image);
    for cache in &unit.cache_images {
      print_stat("Cache", cache);
    }
  }
  Ok(())
}
