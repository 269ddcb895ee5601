mod build;
mod hash;

pub use build::{BuildArgs, cmd_build};
pub use hash::{HashArgs, cmd_hash};

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use smartbuild_lib::config::BuildConfig;
use smartbuild_lib::plan::BuildPlan;

pub const DEFAULT_PLAN_FILE: &str = "smartbuild.yml";

/// Flags that take precedence over the environment-derived configuration.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigFlags {
  /// Run as a managed context (synthesized image names, volume mounts)
  #[arg(long)]
  pub managed: bool,

  /// Read and write cached images in the shared namespace
  #[arg(long)]
  pub global_access: bool,

  /// Never reuse cached images
  #[arg(long)]
  pub no_smart_builds: bool,

  /// Units built concurrently within one round
  #[arg(long, value_name = "N")]
  pub parallelism: Option<usize>,
}

impl ConfigFlags {
  pub fn apply(&self, mut config: BuildConfig) -> BuildConfig {
    if self.managed {
      config.is_managed = true;
    }
    if self.global_access {
      config.has_global_access = true;
    }
    if self.no_smart_builds {
      config.smart_builds_enabled = false;
    }
    if let Some(parallelism) = self.parallelism.filter(|n| *n > 0) {
      config.parallelism = parallelism;
    }
    config
  }
}

pub fn load_plan(file: &Path) -> Result<BuildPlan> {
  let path = dunce::canonicalize(file).with_context(|| format!("Plan file not found: {}", file.display()))?;
  BuildPlan::load(&path).with_context(|| format!("Failed to load plan: {}", path.display()))
}
