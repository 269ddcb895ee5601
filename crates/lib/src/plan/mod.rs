//! Build plans: the named set of units one invocation builds.
//!
//! A plan is constructed once per invocation, usually from a YAML plan file,
//! and is treated as immutable while the orchestrator runs.
//!
//! # File Format
//!
//! ```yaml
//! name: movies
//! build:
//!   api:
//!     context: api
//!     args:
//!       VERSION: "1.0"
//!     depends_on: [base]
//!     volumes:
//!       - ./data:/app/data
//! deploy:
//!   - helm upgrade --install movies chart --set image=${OKTETO_BUILD_API_IMAGE}
//! ```

mod types;

pub use types::*;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while loading a plan file.
#[derive(Debug, Error)]
pub enum PlanError {
  #[error("failed to read plan {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse plan {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("invalid volume '{spec}' for unit '{unit}': expected <local path>:<remote path>")]
  InvalidVolume { unit: String, spec: String },

  #[error("invalid build argument for unit '{unit}': {message}")]
  InvalidArg { unit: String, message: String },
}

#[derive(Debug, Deserialize)]
struct RawPlan {
  name: Option<String>,
  #[serde(default)]
  compose: bool,
  #[serde(default)]
  build: BTreeMap<String, RawUnit>,
  #[serde(default)]
  deploy: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawUnit {
  context: Option<String>,
  dockerfile: Option<String>,
  image: Option<String>,
  target: Option<String>,
  #[serde(default)]
  args: Option<RawArgs>,
  #[serde(default)]
  secrets: BTreeMap<String, String>,
  #[serde(default)]
  cache_from: Vec<String>,
  #[serde(default)]
  volumes: Vec<String>,
  #[serde(default)]
  depends_on: Vec<String>,
}

/// Build arguments as either `[K=V, ...]` or a mapping (document order kept).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArgs {
  List(Vec<String>),
  Map(serde_yaml::Mapping),
}

impl BuildPlan {
  /// Load a plan from a YAML file. The file's directory becomes the plan root.
  pub fn load(path: &Path) -> Result<Self, PlanError> {
    let content = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    let root = path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."));

    Self::from_yaml(&content, &root).map_err(|e| match e {
      PlanError::Parse { source, .. } => PlanError::Parse {
        path: path.to_path_buf(),
        source,
      },
      other => other,
    })
  }

  /// Parse a plan from YAML text, resolving relative paths against `root`.
  pub fn from_yaml(content: &str, root: &Path) -> Result<Self, PlanError> {
    let raw: RawPlan = serde_yaml::from_str(content).map_err(|source| PlanError::Parse {
      path: root.to_path_buf(),
      source,
    })?;

    let name = match raw.name {
      Some(name) if !name.is_empty() => name,
      _ => default_plan_name(root),
    };

    let mut units = BTreeMap::new();
    for (unit_name, raw_unit) in raw.build {
      let unit = convert_unit(&unit_name, raw_unit)?;
      units.insert(unit_name, unit);
    }

    debug!(plan = %name, units = units.len(), "loaded build plan");

    Ok(Self {
      name,
      kind: if raw.compose { PlanKind::Compose } else { PlanKind::Manifest },
      root: root.to_path_buf(),
      units,
      deploy: raw.deploy,
    })
  }
}

fn default_plan_name(root: &Path) -> String {
  root
    .canonicalize()
    .ok()
    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
    .unwrap_or_else(|| "default".to_string())
}

fn convert_unit(name: &str, raw: RawUnit) -> Result<BuildUnit, PlanError> {
  let context = raw.context.clone().unwrap_or_else(|| ".".to_string());

  // Without a context or an image there is nothing else to build from.
  let dockerfile = raw.dockerfile.or_else(|| {
    (raw.context.is_some() || raw.image.is_none())
      .then(|| Path::new(&context).join("Dockerfile").to_string_lossy().to_string())
  });

  let args = match raw.args {
    None => Vec::new(),
    Some(RawArgs::List(items)) => items
      .iter()
      .map(|item| match item.split_once('=') {
        Some((k, v)) => BuildArg::new(k, v),
        None => BuildArg::new(item, ""),
      })
      .collect(),
    Some(RawArgs::Map(mapping)) => mapping
      .iter()
      .map(|(k, v)| {
        let key = yaml_scalar(k).ok_or_else(|| PlanError::InvalidArg {
          unit: name.to_string(),
          message: format!("non-scalar key {:?}", k),
        })?;
        let value = yaml_scalar(v).ok_or_else(|| PlanError::InvalidArg {
          unit: name.to_string(),
          message: format!("non-scalar value for '{}'", key),
        })?;
        Ok(BuildArg { name: key, value })
      })
      .collect::<Result<_, PlanError>>()?,
  };

  let volumes = raw
    .volumes
    .iter()
    .map(|spec| match spec.split_once(':') {
      Some((local, remote)) if !local.is_empty() && !remote.is_empty() => Ok(VolumeMount::new(local, remote)),
      _ => Err(PlanError::InvalidVolume {
        unit: name.to_string(),
        spec: spec.clone(),
      }),
    })
    .collect::<Result<_, _>>()?;

  Ok(BuildUnit {
    context,
    dockerfile,
    image: raw.image,
    target: raw.target,
    args,
    secrets: raw.secrets,
    cache_from: raw.cache_from,
    volumes,
    depends_on: raw.depends_on,
  })
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
  match value {
    serde_yaml::Value::String(s) => Some(s.clone()),
    serde_yaml::Value::Number(n) => Some(n.to_string()),
    serde_yaml::Value::Bool(b) => Some(b.to_string()),
    serde_yaml::Value::Null => Some(String::new()),
    _ => None,
  }
}
