//! Kernel lifecycle management on Docker, in both plain-container and swarm
//! flavors.
//!
//! Both flavors share the naming scheme (`{username}-{kernel_id}`) and the
//! identity labels; the mode is conveyed to the kernel launcher through
//! `GP_DOCKER_MODE` so in-container tooling knows which API it was started
//! under. Swarm kernels run as one-shot services (restart policy `none`);
//! plain kernels run as auto-removed containers.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions},
    models::{
        ContainerStateStatusEnum, HostConfig, NetworkAttachmentConfig, ServiceSpec,
        ServiceSpecMode, ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec,
        TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum,
    },
    service::ListServicesOptions,
    task::ListTasksOptions,
};
use snafu::ResultExt;
use tether_base::consts::{gp_env, kernel_env};

use super::{
    Backend, Discovery, DockerApiSnafu, Error, LaunchContext, k8s::sanitize_name,
    prepare_container_env,
};

const COMPONENT_LABEL_VALUE: &str = "kernel";

/// Which Docker API flavor a kernel is provisioned through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DockerMode {
    Container,
    Swarm,
}

impl DockerMode {
    const fn as_env_value(self) -> &'static str {
        match self {
            Self::Container => "docker",
            Self::Swarm => "swarm",
        }
    }
}

pub struct DockerProvisioner {
    mode: DockerMode,
    docker: Option<Docker>,
    container_name: Option<String>,
}

impl DockerProvisioner {
    #[must_use]
    pub fn new(mode: DockerMode) -> Self { Self { mode, docker: None, container_name: None } }

    fn docker(&mut self) -> Result<Docker, Error> {
        if let Some(docker) = &self.docker {
            return Ok(docker.clone());
        }
        let docker =
            Docker::connect_with_local_defaults().context(super::DockerConfigSnafu)?;
        self.docker = Some(docker.clone());
        Ok(docker)
    }

    fn labels(ctx: &LaunchContext) -> HashMap<String, String> {
        HashMap::from([
            ("kernel_id".to_string(), ctx.kernel_id.clone()),
            ("component".to_string(), COMPONENT_LABEL_VALUE.to_string()),
            ("app".to_string(), ctx.config.app_name.clone()),
        ])
    }

    fn label_filter(ctx: &LaunchContext) -> HashMap<String, Vec<String>> {
        HashMap::from([("label".to_string(), vec![format!("kernel_id={}", ctx.kernel_id)])])
    }

    fn env_list(ctx: &LaunchContext) -> Vec<String> {
        let mut pairs: Vec<_> =
            ctx.env.iter().map(|(key, value)| format!("{key}={value}")).collect();
        pairs.sort();
        pairs
    }

    async fn spawn_container(&mut self, ctx: &LaunchContext, name: &str) -> Result<(), Error> {
        let docker = self.docker()?;
        let config = Config {
            image: ctx.env.get(kernel_env::IMAGE).cloned(),
            cmd: Some(ctx.argv.clone()),
            env: Some(Self::env_list(ctx)),
            labels: Some(Self::labels(ctx)),
            user: Some(format!(
                "{}:{}",
                ctx.env.get(kernel_env::UID).map_or("1000", String::as_str),
                ctx.env.get(kernel_env::GID).map_or("100", String::as_str),
            )),
            working_dir: ctx.env.get(kernel_env::WORKING_DIR).cloned(),
            host_config: Some(HostConfig {
                network_mode: Some(ctx.config.docker_network.clone()),
                auto_remove: Some(true),
                ..HostConfig::default()
            }),
            ..Config::default()
        };

        let _created = docker
            .create_container(Some(CreateContainerOptions { name, platform: None }), config)
            .await
            .with_context(|_| DockerApiSnafu { operation: format!("creating container '{name}'") })?;
        docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .with_context(|_| DockerApiSnafu { operation: format!("starting container '{name}'") })?;
        Ok(())
    }

    async fn spawn_service(&mut self, ctx: &LaunchContext, name: &str) -> Result<(), Error> {
        let docker = self.docker()?;
        let spec = ServiceSpec {
            name: Some(name.to_string()),
            labels: Some(Self::labels(ctx)),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
                ..ServiceSpecMode::default()
            }),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: ctx.env.get(kernel_env::IMAGE).cloned(),
                    command: Some(ctx.argv.clone()),
                    env: Some(Self::env_list(ctx)),
                    labels: Some(Self::labels(ctx)),
                    ..TaskSpecContainerSpec::default()
                }),
                // One-shot workload: a kernel that exits must not be revived
                // behind the supervisor's back.
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
                    ..TaskSpecRestartPolicy::default()
                }),
                networks: Some(vec![NetworkAttachmentConfig {
                    target: Some(ctx.config.docker_network.clone()),
                    ..NetworkAttachmentConfig::default()
                }]),
                ..TaskSpec::default()
            }),
            ..ServiceSpec::default()
        };

        let _created = docker
            .create_service(spec, None::<bollard::auth::DockerCredentials>)
            .await
            .with_context(|_| DockerApiSnafu { operation: format!("creating service '{name}'") })?;
        Ok(())
    }

    /// The swarm task currently desired-running for this kernel's service,
    /// as a JSON value (the interesting fields are deeply optional).
    async fn running_task(&mut self, ctx: &LaunchContext) -> Result<Option<serde_json::Value>, Error> {
        let docker = self.docker()?;
        let services = docker
            .list_services(Some(ListServicesOptions { filters: Self::label_filter(ctx), status: false }))
            .await
            .with_context(|_| DockerApiSnafu { operation: "listing services".to_string() })?;
        if services.len() > 1 {
            return Err(Error::AmbiguousResource {
                resource: "service",
                count: services.len(),
                kernel_id: ctx.kernel_id.clone(),
            });
        }
        let Some(service) = services.into_iter().next() else { return Ok(None) };
        let service_name = service.spec.and_then(|spec| spec.name).unwrap_or_default();
        self.container_name = Some(service_name.clone());

        let filters = HashMap::from([
            ("service".to_string(), vec![service_name]),
            ("desired-state".to_string(), vec!["running".to_string()]),
        ]);
        let tasks = docker
            .list_tasks(Some(ListTasksOptions { filters }))
            .await
            .with_context(|_| DockerApiSnafu { operation: "listing tasks".to_string() })?;
        if tasks.len() > 1 {
            return Err(Error::AmbiguousResource {
                resource: "task",
                count: tasks.len(),
                kernel_id: ctx.kernel_id.clone(),
            });
        }
        Ok(tasks.into_iter().next().map(|task| serde_json::to_value(task).unwrap_or_default()))
    }

    async fn discover_swarm(&mut self, ctx: &LaunchContext) -> Result<Discovery, Error> {
        let Some(task) = self.running_task(ctx).await? else { return Ok(Discovery::Pending) };

        let state = task
            .pointer("/Status/State")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        if matches!(
            state.as_str(),
            "failed" | "rejected" | "complete" | "shutdown" | "orphaned" | "remove"
        ) {
            return Ok(Discovery::Failed { detail: format!("task state '{state}'") });
        }
        if state == "running" {
            // First address of the first network attachment, sans prefix.
            let ip = task
                .pointer("/NetworksAttachments/0/Addresses/0")
                .and_then(serde_json::Value::as_str)
                .map(|address| address.split('/').next().unwrap_or(address).to_string());
            let host = self.container_name.clone().unwrap_or_else(|| ctx.kernel_id.clone());
            return Ok(Discovery::Located { host, ip });
        }
        Ok(Discovery::Pending)
    }

    async fn discover_container(&mut self, ctx: &LaunchContext) -> Result<Discovery, Error> {
        let Some(name) = self.container_name.clone() else { return Ok(Discovery::Pending) };
        let docker = self.docker()?;

        let inspected = match docker
            .inspect_container(&name, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
        {
            Ok(inspected) => inspected,
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                return Ok(Discovery::Pending);
            }
            Err(source) => {
                return Err(Error::DockerApi {
                    operation: format!("inspecting container '{name}'"),
                    source,
                });
            }
        };

        let status = inspected.state.and_then(|state| state.status);
        match status {
            Some(ContainerStateStatusEnum::RUNNING) => {
                let networks = inspected.network_settings.as_ref().and_then(|settings| {
                    settings.networks.as_ref().and_then(|networks| {
                        networks
                            .get(&ctx.config.docker_network)
                            .and_then(|endpoint| endpoint.ip_address.clone())
                    })
                });
                let ip = match networks {
                    Some(ip) => Some(ip),
                    None => {
                        tracing::warn!(
                            "Docker network '{}' could not be located in container attributes; \
                             falling back to the default address",
                            ctx.config.docker_network
                        );
                        inspected
                            .network_settings
                            .and_then(|settings| settings.ip_address)
                            .filter(|ip| !ip.is_empty())
                    }
                };
                Ok(Discovery::Located { host: name, ip })
            }
            Some(
                ContainerStateStatusEnum::RESTARTING
                | ContainerStateStatusEnum::REMOVING
                | ContainerStateStatusEnum::PAUSED
                | ContainerStateStatusEnum::EXITED
                | ContainerStateStatusEnum::DEAD,
            ) => Ok(Discovery::Failed {
                detail: format!("container state '{}'", status.unwrap_or(ContainerStateStatusEnum::EMPTY)),
            }),
            _ => Ok(Discovery::Pending),
        }
    }

    async fn container_alive(&mut self, ctx: &LaunchContext) -> Result<bool, Error> {
        let docker = self.docker()?;
        let containers = docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Self::label_filter(ctx),
                ..ListContainersOptions::default()
            }))
            .await
            .with_context(|_| DockerApiSnafu { operation: "listing containers".to_string() })?;
        let state = containers
            .into_iter()
            .next()
            .and_then(|container| serde_json::to_value(container).ok())
            .and_then(|value| {
                value.get("State").and_then(serde_json::Value::as_str).map(str::to_lowercase)
            })
            .unwrap_or_default();
        Ok(matches!(state.as_str(), "created" | "running"))
    }
}

#[async_trait]
impl Backend for DockerProvisioner {
    fn name(&self) -> &'static str {
        match self.mode {
            DockerMode::Container => "docker",
            DockerMode::Swarm => "docker-swarm",
        }
    }

    async fn prepare(&mut self, ctx: &mut LaunchContext) -> Result<(), Error> {
        prepare_container_env(&ctx.config, &mut ctx.env)?;
        ctx.env
            .insert(gp_env::DOCKER_NETWORK.to_string(), ctx.config.docker_network.clone());
        ctx.env
            .insert(gp_env::DOCKER_MODE.to_string(), self.mode.as_env_value().to_string());
        self.container_name =
            Some(sanitize_name(&format!("{}-{}", ctx.username, ctx.kernel_id)));
        Ok(())
    }

    async fn spawn(&mut self, ctx: &LaunchContext) -> Result<(), Error> {
        let name = self.container_name.clone().expect("prepare() names the container");
        match self.mode {
            DockerMode::Container => self.spawn_container(ctx, &name).await?,
            DockerMode::Swarm => self.spawn_service(ctx, &name).await?,
        }
        tracing::info!(
            kernel_id = %ctx.kernel_id,
            "Kernel launched. Kernel image: {}, {}: '{name}'",
            ctx.env.get(kernel_env::IMAGE).map_or("<unset>", String::as_str),
            if self.mode == DockerMode::Swarm { "service" } else { "container" },
        );
        Ok(())
    }

    async fn discover(&mut self, ctx: &LaunchContext) -> Result<Discovery, Error> {
        match self.mode {
            DockerMode::Container => self.discover_container(ctx).await,
            DockerMode::Swarm => self.discover_swarm(ctx).await,
        }
    }

    async fn status(&mut self, ctx: &LaunchContext) -> Result<Option<i32>, Error> {
        let alive = match self.mode {
            DockerMode::Container => self.container_alive(ctx).await?,
            DockerMode::Swarm => match self.running_task(ctx).await? {
                Some(task) => {
                    let state = task
                        .pointer("/Status/State")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_lowercase();
                    matches!(state.as_str(), "preparing" | "starting" | "running")
                }
                None => false,
            },
        };
        Ok(if alive { None } else { Some(0) })
    }

    async fn send_native_signal(
        &mut self,
        _ctx: &LaunchContext,
        _signum: i32,
    ) -> Result<bool, Error> {
        // Interrupts travel over the communication port; forceful
        // termination goes through resource teardown.
        Ok(false)
    }

    async fn terminate_resources(
        &mut self,
        ctx: &LaunchContext,
        _restart: bool,
    ) -> Result<(), Error> {
        let Some(name) = self.container_name.clone() else { return Ok(()) };
        let docker = self.docker()?;

        let result = match self.mode {
            DockerMode::Swarm => docker.delete_service(&name).await,
            DockerMode::Container => {
                docker
                    .remove_container(
                        &name,
                        Some(RemoveContainerOptions { force: true, ..RemoveContainerOptions::default() }),
                    )
                    .await
            }
        };
        match result {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(source) => {
                return Err(Error::DockerApi {
                    operation: format!("removing '{name}'"),
                    source,
                });
            }
        }
        tracing::debug!(kernel_id = %ctx.kernel_id, "Docker resource '{name}' has been terminated");
        self.container_name = None;
        Ok(())
    }

    fn backend_handle(&self) -> Option<String> { self.container_name.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionerConfig;

    fn sample_context() -> LaunchContext {
        LaunchContext {
            kernel_id: "4a2f1c9e".to_string(),
            username: "Alice.Smith".to_string(),
            kernel_name: "Python (docker)".to_string(),
            argv: vec!["/usr/local/bin/launch_kernel".to_string()],
            env: HashMap::new(),
            config: ProvisionerConfig {
                image_name: Some("example.com/kernels/py:3".to_string()),
                ..ProvisionerConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn prepare_conveys_mode_and_network() {
        let mut swarm = DockerProvisioner::new(DockerMode::Swarm);
        let mut ctx = sample_context();
        swarm.prepare(&mut ctx).await.unwrap();
        assert_eq!(ctx.env.get(gp_env::DOCKER_MODE).map(String::as_str), Some("swarm"));
        assert_eq!(ctx.env.get(gp_env::DOCKER_NETWORK).map(String::as_str), Some("bridge"));
        assert_eq!(swarm.backend_handle().as_deref(), Some("alice-smith-4a2f1c9e"));

        let mut plain = DockerProvisioner::new(DockerMode::Container);
        let mut ctx = sample_context();
        plain.prepare(&mut ctx).await.unwrap();
        assert_eq!(ctx.env.get(gp_env::DOCKER_MODE).map(String::as_str), Some("docker"));
    }

    #[test]
    fn env_list_is_deterministic() {
        let mut ctx = sample_context();
        ctx.env.insert("B_KEY".to_string(), "2".to_string());
        ctx.env.insert("A_KEY".to_string(), "1".to_string());
        let env = DockerProvisioner::env_list(&ctx);
        assert_eq!(env, vec!["A_KEY=1".to_string(), "B_KEY=2".to_string()]);
    }

    #[test]
    fn label_filter_selects_by_kernel_id() {
        let ctx = sample_context();
        let filter = DockerProvisioner::label_filter(&ctx);
        assert_eq!(filter.get("label").unwrap(), &vec!["kernel_id=4a2f1c9e".to_string()]);
    }
}
