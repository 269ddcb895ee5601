//! Docker-backed build and registry collaborators.
//!
//! Builds run through `docker buildx build --push`; registry queries and
//! cross-namespace copies go through `docker buildx imagetools`. Every child
//! process is killed when its future is dropped, so a cancelled build does not
//! leave a dangling `docker` process behind.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use smartbuild_lib::cancel::CancelToken;
use smartbuild_lib::config::BuildConfig;
use smartbuild_lib::executor::{Builder, ExecuteOptions, ExecutorError};
use smartbuild_lib::image::ImageReference;
use smartbuild_lib::registry::{Registry, RegistryError};

const DOCKER_BINARY: &str = "docker";

/// Lines of stderr kept in a build failure message.
const STDERR_TAIL_LINES: usize = 20;

async fn run_docker(binary: &str, args: &[String]) -> std::io::Result<Output> {
  debug!(binary, args = ?args, "spawning docker");
  Command::new(binary)
    .args(args)
    .stdin(Stdio::null())
    .kill_on_drop(true)
    .output()
    .await
}

fn stderr_tail(output: &Output) -> String {
  let stderr = String::from_utf8_lossy(&output.stderr);
  let lines: Vec<&str> = stderr.lines().collect();
  let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
  lines[start..].join("\n")
}

/// Runs image builds through `docker buildx build`.
#[derive(Debug, Clone)]
pub struct DockerBuilder {
  binary: String,
}

impl Default for DockerBuilder {
  fn default() -> Self {
    Self {
      binary: DOCKER_BINARY.to_string(),
    }
  }
}

/// Arguments of the `docker` invocation building `options`.
pub fn build_command_args(options: &ExecuteOptions) -> Vec<String> {
  let mut args = vec![
    "buildx".to_string(),
    "build".to_string(),
    "--push".to_string(),
    "--file".to_string(),
    options.dockerfile.display().to_string(),
  ];
  for tag in &options.tags {
    args.push("--tag".to_string());
    args.push(tag.clone());
  }
  for arg in &options.build_args {
    args.push("--build-arg".to_string());
    args.push(arg.to_string());
  }
  for (id, path) in &options.secrets {
    args.push("--secret".to_string());
    args.push(format!("id={},src={}", id, path.display()));
  }
  if let Some(target) = &options.target {
    args.push("--target".to_string());
    args.push(target.clone());
  }
  for source in &options.cache_from {
    args.push("--cache-from".to_string());
    args.push(source.clone());
  }
  args.push(options.context.display().to_string());
  args
}

#[async_trait]
impl Builder for DockerBuilder {
  async fn execute(&self, options: &ExecuteOptions, cancel: &CancelToken) -> Result<(), ExecutorError> {
    let args = build_command_args(options);
    info!(tag = options.primary_tag(), context = %options.context.display(), "running docker build");

    let output = cancel
      .run(run_docker(&self.binary, &args))
      .await
      .map_err(|_| ExecutorError::Cancelled)?
      .map_err(|e| ExecutorError::Spawn(e.to_string()))?;

    if !output.status.success() {
      return Err(ExecutorError::Failed {
        tag: options.primary_tag().to_string(),
        message: stderr_tail(&output),
      });
    }
    Ok(())
  }
}

/// Queries and copies images through `docker buildx imagetools`.
#[derive(Debug, Clone)]
pub struct DockerRegistry {
  binary: String,
  dev_namespace: String,
  global_namespace: String,
}

impl DockerRegistry {
  pub fn new(config: &BuildConfig) -> Self {
    Self {
      binary: DOCKER_BINARY.to_string(),
      dev_namespace: config.dev_namespace.clone(),
      global_namespace: config.global_namespace.clone(),
    }
  }

  /// The private counterpart of a shared image, tagged `tag`.
  pub fn private_target(&self, image: &ImageReference, tag: &str) -> String {
    let (name, _) = self.repository_and_tag(&image.tagged());
    let global_prefix = format!("{}/", self.global_namespace.trim_end_matches('/'));
    let repository = name.strip_prefix(&global_prefix).unwrap_or(&image.repository);
    format!("{}/{}:{}", self.dev_namespace.trim_end_matches('/'), repository, tag)
  }
}

/// Extract the manifest digest from `imagetools inspect --format '{{json .Manifest}}'` output.
pub fn parse_manifest_digest(stdout: &str) -> Option<String> {
  let manifest: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
  manifest
    .get("digest")
    .and_then(serde_json::Value::as_str)
    .filter(|d| !d.is_empty())
    .map(str::to_string)
}

fn is_not_found(stderr: &str) -> bool {
  let stderr = stderr.to_lowercase();
  stderr.contains("not found") || stderr.contains("manifest unknown") || stderr.contains("name unknown")
}

#[async_trait]
impl Registry for DockerRegistry {
  async fn resolve_digest(&self, image: &str) -> Result<ImageReference, RegistryError> {
    let args = vec![
      "buildx".to_string(),
      "imagetools".to_string(),
      "inspect".to_string(),
      image.to_string(),
      "--format".to_string(),
      "{{json .Manifest}}".to_string(),
    ];
    let output = run_docker(&self.binary, &args).await.map_err(|e| RegistryError::Request {
      reference: image.to_string(),
      message: e.to_string(),
    })?;

    if !output.status.success() {
      let stderr = stderr_tail(&output);
      if is_not_found(&stderr) {
        return Err(RegistryError::NotFound(image.to_string()));
      }
      return Err(RegistryError::Request {
        reference: image.to_string(),
        message: stderr,
      });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let digest = parse_manifest_digest(&stdout).ok_or_else(|| RegistryError::Request {
      reference: image.to_string(),
      message: "inspect output carries no digest".to_string(),
    })?;
    Ok(ImageReference::parse(image).with_digest(&digest))
  }

  fn is_shared_registry(&self, image: &ImageReference) -> bool {
    image.is_in_namespace(&self.global_namespace)
  }

  async fn clone_to_private(&self, image: &ImageReference, tag: &str) -> Result<ImageReference, RegistryError> {
    let target = self.private_target(image, tag);
    info!(source = %image, target = %target, "copying shared image to private namespace");

    let args = vec![
      "buildx".to_string(),
      "imagetools".to_string(),
      "create".to_string(),
      "--tag".to_string(),
      target.clone(),
      image.to_string(),
    ];
    let output = run_docker(&self.binary, &args).await.map_err(|e| RegistryError::Request {
      reference: target.clone(),
      message: e.to_string(),
    })?;
    if !output.status.success() {
      return Err(RegistryError::Request {
        reference: target,
        message: stderr_tail(&output),
      });
    }

    self.resolve_digest(&target).await
  }
}
