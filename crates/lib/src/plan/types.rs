use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::expand::{ExpandError, VarSource, expand};

/// A single `--build-arg` style name/value pair. Order within a unit is significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildArg {
  pub name: String,
  pub value: String,
}

impl BuildArg {
  pub fn new(name: &str, value: &str) -> Self {
    Self {
      name: name.to_string(),
      value: value.to_string(),
    }
  }
}

impl std::fmt::Display for BuildArg {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}={}", self.name, self.value)
  }
}

/// A host path to be layered into the unit's image at `remote_path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeMount {
  pub local_path: String,
  pub remote_path: String,
}

impl VolumeMount {
  pub fn new(local_path: &str, remote_path: &str) -> Self {
    Self {
      local_path: local_path.to_string(),
      remote_path: remote_path.to_string(),
    }
  }
}

/// One buildable service entry of a plan.
///
/// The unit's name is its key in [`BuildPlan::units`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildUnit {
  /// Build context, relative to the plan root unless absolute.
  pub context: String,
  /// Dockerfile path, relative to the plan root unless absolute.
  pub dockerfile: Option<String>,
  /// Explicit image reference.
  pub image: Option<String>,
  /// Target stage of a multi-stage Dockerfile.
  pub target: Option<String>,
  pub args: Vec<BuildArg>,
  /// Secret id -> local file path. Sorted by id.
  pub secrets: BTreeMap<String, String>,
  pub cache_from: Vec<String>,
  pub volumes: Vec<VolumeMount>,
  /// Names of units that must be built before this one.
  pub depends_on: Vec<String>,
}

impl BuildUnit {
  pub fn has_dockerfile(&self) -> bool {
    self.dockerfile.as_deref().is_some_and(|d| !d.is_empty())
  }

  pub fn has_volume_mounts(&self) -> bool {
    !self.volumes.is_empty()
  }

  pub fn explicit_image(&self) -> Option<&str> {
    self.image.as_deref().filter(|i| !i.is_empty())
  }

  /// A copy of this unit without its volume mounts (the stage-1 build of a volume unit).
  pub fn without_volume_mounts(&self) -> Self {
    Self {
      volumes: Vec::new(),
      ..self.clone()
    }
  }

  /// Expand every variable reference in the unit's string fields.
  pub fn expand(&self, vars: &dyn VarSource) -> Result<Self, ExpandError> {
    Ok(Self {
      args: self.expanded_args(vars)?,
      ..self.expand_fields(vars)?
    })
  }

  /// Expand every string field except the build arguments, which stay as declared.
  ///
  /// Arguments are materialized separately, once, where they are hashed and
  /// passed to the builder.
  pub fn expand_fields(&self, vars: &dyn VarSource) -> Result<Self, ExpandError> {
    let opt = |v: &Option<String>| v.as_deref().map(|s| expand(s, vars)).transpose();

    Ok(Self {
      context: expand(&self.context, vars)?,
      dockerfile: opt(&self.dockerfile)?,
      image: opt(&self.image)?,
      target: opt(&self.target)?,
      args: self.args.clone(),
      secrets: self
        .secrets
        .iter()
        .map(|(k, v)| Ok((k.clone(), expand(v, vars)?)))
        .collect::<Result<_, ExpandError>>()?,
      cache_from: self
        .cache_from
        .iter()
        .map(|c| expand(c, vars))
        .collect::<Result<_, _>>()?,
      volumes: self.volumes.clone(),
      depends_on: self.depends_on.clone(),
    })
  }

  /// The declared build arguments with their values expanded, in declaration order.
  pub fn expanded_args(&self, vars: &dyn VarSource) -> Result<Vec<BuildArg>, ExpandError> {
    self
      .args
      .iter()
      .map(|arg| {
        Ok(BuildArg {
          name: arg.name.clone(),
          value: expand(&arg.value, vars)?,
        })
      })
      .collect()
  }
}

/// Whether a plan was written directly or derived from a compose file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
  #[default]
  Manifest,
  Compose,
}

/// The set of units requested by one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
  /// Plan name; root of every synthesized image name.
  pub name: String,
  pub kind: PlanKind,
  /// Directory relative unit paths resolve against.
  pub root: PathBuf,
  pub units: BTreeMap<String, BuildUnit>,
  /// Deploy commands; expanded once every unit is built.
  pub deploy: Vec<String>,
}

impl BuildPlan {
  pub fn new(name: &str, root: &Path) -> Self {
    Self {
      name: name.to_string(),
      kind: PlanKind::Manifest,
      root: root.to_path_buf(),
      units: BTreeMap::new(),
      deploy: Vec::new(),
    }
  }

  pub fn with_unit(mut self, name: &str, unit: BuildUnit) -> Self {
    self.units.insert(name.to_string(), unit);
    self
  }

  pub fn is_compose(&self) -> bool {
    self.kind == PlanKind::Compose
  }

  pub fn unit(&self, name: &str) -> Option<&BuildUnit> {
    self.units.get(name)
  }

  /// Resolve a unit-relative path against the plan root.
  pub fn resolve_path(&self, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() { p.to_path_buf() } else { self.root.join(p) }
  }

  /// A copy of the plan with every unit and deploy command expanded.
  pub fn expand(&self, vars: &dyn VarSource) -> Result<Self, ExpandError> {
    Ok(Self {
      name: self.name.clone(),
      kind: self.kind,
      root: self.root.clone(),
      units: self
        .units
        .iter()
        .map(|(name, unit)| Ok((name.clone(), unit.expand(vars)?)))
        .collect::<Result<_, ExpandError>>()?,
      deploy: self
        .deploy
        .iter()
        .map(|cmd| expand(cmd, vars))
        .collect::<Result<_, _>>()?,
    })
  }
}
