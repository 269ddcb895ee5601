//! Literal conventions shared across the engine.

/// Tag marking the current canonical build of a unit.
pub const DEFAULT_IMAGE_TAG: &str = "okteto";

/// Tag marking the volume-mount-augmented variant of a unit's image.
pub const VOLUME_MOUNTS_IMAGE_TAG: &str = "okteto-with-volume-mounts";

/// Alias of the caller's private registry namespace.
pub const DEV_REGISTRY_NAMESPACE: &str = "okteto.dev";

/// Alias of the shared registry namespace.
pub const GLOBAL_REGISTRY_NAMESPACE: &str = "okteto.global";

/// Prefix of every per-unit exported variable (`OKTETO_BUILD_<UNIT>_IMAGE`, ...).
pub const BUILD_ENV_PREFIX: &str = "OKTETO_BUILD";

/// Exported variable recording whether smart builds were enabled for the run.
pub const SMART_BUILD_ENV_VAR: &str = "OKTETO_ENABLE_SMART_BUILD";

/// Ignore file read from the root of a build context.
pub const DOCKERIGNORE_FILE: &str = ".dockerignore";

/// Entries never folded into a build-context hash.
pub const CONTEXT_HASH_EXCLUSIONS: &[&str] = &[".git"];

/// Registry assumed when an image reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";
