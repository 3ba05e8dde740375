//! Backend adapters: one per platform a kernel can be provisioned on.
//!
//! Every adapter implements the same capability set (spawn, discover,
//! status, native signal, resource teardown) behind the [`Backend`] trait;
//! the supervisor drives them without knowing which platform is underneath.

pub mod crd;
pub mod distributed;
pub mod docker;
pub mod k8s;
pub mod registry;
pub mod yarn;

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use snafu::Snafu;
use tether_base::consts::kernel_env;

pub use self::registry::ProvisionerRegistry;
use crate::config::ProvisionerConfig;

/// Everything an adapter needs to launch and manage one kernel.
#[derive(Clone, Debug)]
pub struct LaunchContext {
    pub kernel_id: String,
    pub username: String,
    /// The kernel spec's display name, used in operator-facing messages.
    pub kernel_name: String,
    /// Fully substituted launcher command line.
    pub argv: Vec<String>,
    /// Environment propagated to the launcher.
    pub env: HashMap<String, String>,
    pub config: ProvisionerConfig,
}

/// What a discovery probe learned about where the kernel landed.
#[derive(Clone, Debug)]
pub enum Discovery {
    /// Resource not locatable yet; keep polling.
    Pending,
    /// Resource located; `ip` may lag `host` by a probe or two.
    Located { host: String, ip: Option<String> },
    /// The backend reports the resource entered an error state.
    Failed { detail: String },
}

/// The capability set every platform adapter supplies.
#[async_trait]
pub trait Backend: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Pre-launch environment preparation: image/namespace/mode injection
    /// and identity checks. Runs before argv substitution so downstream
    /// inherits the final values.
    async fn prepare(&mut self, ctx: &mut LaunchContext) -> Result<(), Error> {
        let _unused = ctx;
        Ok(())
    }

    /// Creates the backend resource running the kernel launcher.
    async fn spawn(&mut self, ctx: &LaunchContext) -> Result<(), Error>;

    /// One cheap probe for where the kernel landed.
    async fn discover(&mut self, ctx: &LaunchContext) -> Result<Discovery, Error>;

    /// Steady-state liveness: `None` while the resource is (or may still
    /// be) running, `Some(code)` once it is provably gone.
    async fn status(&mut self, ctx: &LaunchContext) -> Result<Option<i32>, Error>;

    /// Platform-level signal delivery for kernels whose launcher cannot be
    /// reached message-based. Returns `true` when the adapter handled it.
    async fn send_native_signal(&mut self, ctx: &LaunchContext, signum: i32)
    -> Result<bool, Error>;

    /// Removes every backend resource created for this kernel, including
    /// partially created ones after a failed launch. Idempotent.
    async fn terminate_resources(&mut self, ctx: &LaunchContext, restart: bool)
    -> Result<(), Error>;

    /// Opaque identity of the created resource (pod name, container id,
    /// application id, remote pid), once known.
    fn backend_handle(&self) -> Option<String> { None }

    /// How long a graceful shutdown may take before the forceful kill.
    fn shutdown_wait_time(&self, recommended: Duration) -> Duration { recommended }
}

/// Shared pre-launch handling for container-based adapters: resolve the
/// kernel image, honor working-dir mirroring, and reject prohibited
/// identities. Resolved values are written back into the env so the
/// launcher sees them.
pub(crate) fn prepare_container_env(
    config: &ProvisionerConfig,
    env: &mut HashMap<String, String>,
) -> Result<(), Error> {
    let image = env
        .get(kernel_env::IMAGE)
        .cloned()
        .or_else(|| config.image_name.clone())
        .ok_or(Error::MissingImageName)?;
    let executor_image = env
        .get(kernel_env::EXECUTOR_IMAGE)
        .cloned()
        .or_else(|| config.executor_image_name.clone())
        .unwrap_or_else(|| image.clone());

    env.insert(kernel_env::IMAGE.to_string(), image);
    env.insert(kernel_env::EXECUTOR_IMAGE.to_string(), executor_image);

    if !config.mirror_working_dirs {
        env.remove(kernel_env::WORKING_DIR);
    }

    config.enforce_prohibited_ids(env).map_err(|source| Error::Policy { source })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("No provisioner is registered under the name '{name}'"))]
    UnknownProvisioner { name: String },

    #[snafu(display("Kernel spec does not select a provisioner"))]
    MissingProvisionerStanza,

    #[snafu(display(
        "No kernel image is configured; set the image_name config option or KERNEL_IMAGE"
    ))]
    MissingImageName,

    #[snafu(display(
        "No YARN endpoint is configured and no local Hadoop configuration was found; set \
         GP_YARN_ENDPOINT"
    ))]
    MissingYarnEndpoint,

    #[snafu(display(
        "Kerberos/SPNEGO-secured YARN endpoints are not supported by this engine; unset \
         GP_YARN_ENDPOINT_SECURITY_ENABLED"
    ))]
    YarnSecurityUnsupported,

    #[snafu(display("{source}"))]
    Policy { source: crate::config::Error },

    #[snafu(display("{source}"))]
    PortPolicy { source: crate::ports::Error },

    #[snafu(display("{source}"))]
    HostSelection { source: crate::balancer::Error },

    #[snafu(display("{source}"))]
    Ssh { source: crate::ssh::Error },

    #[snafu(display("Failed to start launcher process, error: {source}"))]
    SpawnProcess { source: std::io::Error },

    #[snafu(display("Kubernetes API call failed while {operation}, error: {source}"))]
    KubeApi {
        operation: String,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("Failed to initialize Kubernetes client, error: {source}"))]
    KubeConfig {
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("Docker API call failed while {operation}, error: {source}"))]
    DockerApi { operation: String, source: bollard::errors::Error },

    #[snafu(display("Failed to initialize Docker client, error: {source}"))]
    DockerConfig { source: bollard::errors::Error },

    #[snafu(display("YARN resource manager request failed, error: {source}"))]
    YarnApi { source: reqwest::Error },

    #[snafu(display("Failure occurred starting kernel on '{host}'. Returned result: {detail}"))]
    LaunchFailed { host: String, detail: String },

    #[snafu(display("Error occurred starting kernel: {detail}. Check server logs."))]
    StartupFailed { detail: String },

    #[snafu(display(
        "Found more than one {resource} ({count}) for kernel_id '{kernel_id}'"
    ))]
    AmbiguousResource { resource: &'static str, count: usize, kernel_id: String },
}

impl From<crate::ssh::Error> for Error {
    fn from(source: crate::ssh::Error) -> Self { Self::Ssh { source } }
}

impl From<crate::balancer::Error> for Error {
    fn from(source: crate::balancer::Error) -> Self { Self::HostSelection { source } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_env_resolves_image_from_config() {
        let config = ProvisionerConfig {
            image_name: Some("example.com/kernels/py:3".to_string()),
            ..ProvisionerConfig::default()
        };
        let mut env = HashMap::new();
        prepare_container_env(&config, &mut env).unwrap();
        assert_eq!(env.get(kernel_env::IMAGE).map(String::as_str), Some("example.com/kernels/py:3"));
        // Executor image falls back to the kernel image.
        assert_eq!(
            env.get(kernel_env::EXECUTOR_IMAGE).map(String::as_str),
            Some("example.com/kernels/py:3")
        );
    }

    #[test]
    fn container_env_prefers_request_supplied_image() {
        let config = ProvisionerConfig {
            image_name: Some("example.com/kernels/py:3".to_string()),
            ..ProvisionerConfig::default()
        };
        let mut env =
            HashMap::from([(kernel_env::IMAGE.to_string(), "example.com/custom:1".to_string())]);
        prepare_container_env(&config, &mut env).unwrap();
        assert_eq!(env.get(kernel_env::IMAGE).map(String::as_str), Some("example.com/custom:1"));
    }

    #[test]
    fn container_env_requires_an_image() {
        let mut env = HashMap::new();
        let err = prepare_container_env(&ProvisionerConfig::default(), &mut env).unwrap_err();
        assert!(matches!(err, Error::MissingImageName));
    }

    #[test]
    fn working_dir_dropped_unless_mirroring() {
        let config = ProvisionerConfig {
            image_name: Some("img".to_string()),
            ..ProvisionerConfig::default()
        };
        let mut env =
            HashMap::from([(kernel_env::WORKING_DIR.to_string(), "/home/alice".to_string())]);
        prepare_container_env(&config, &mut env).unwrap();
        assert!(!env.contains_key(kernel_env::WORKING_DIR));

        let config = ProvisionerConfig { mirror_working_dirs: true, ..config };
        let mut env =
            HashMap::from([(kernel_env::WORKING_DIR.to_string(), "/home/alice".to_string())]);
        prepare_container_env(&config, &mut env).unwrap();
        assert_eq!(env.get(kernel_env::WORKING_DIR).map(String::as_str), Some("/home/alice"));
    }

    #[test]
    fn prohibited_uid_surfaces_as_policy_error() {
        let config = ProvisionerConfig {
            image_name: Some("img".to_string()),
            ..ProvisionerConfig::default()
        };
        let mut env = HashMap::from([(kernel_env::UID.to_string(), "0".to_string())]);
        let err = prepare_container_env(&config, &mut env).unwrap_err();
        assert!(matches!(err, Error::Policy { source: crate::config::Error::ProhibitedUid { .. } }));
    }
}
