//! Resolution of a kernel spec's `provisioner_name` to a backend adapter.
//!
//! The registry is process-owned (not a global): the host application
//! builds one at startup, which also pins the shared pieces every launch
//! needs (the response manager and the distributed host pool). Additional
//! backends can be slotted in without touching the supervisor.

use std::{collections::HashMap, sync::Arc};

use snafu::ResultExt;
use uuid::Uuid;

use super::{
    Backend, Error, crd::{CrdKind, CustomResourceProvisioner}, distributed::DistributedProvisioner,
    docker::{DockerMode, DockerProvisioner}, k8s::KubernetesProvisioner, yarn::YarnProvisioner,
};
use crate::{
    balancer::HostPool,
    config::ProvisionerConfig,
    provisioner::KernelSupervisor,
    response::ResponseManager,
    spec::KernelSpec,
};

type Factory =
    Box<dyn Fn(&ProvisionerRegistry, &ProvisionerConfig) -> Result<Box<dyn Backend>, Error> + Send + Sync>;

pub struct ProvisionerRegistry {
    global_config: ProvisionerConfig,
    response_manager: Arc<ResponseManager>,
    host_pool: Arc<HostPool>,
    factories: HashMap<String, Factory>,
}

impl ProvisionerRegistry {
    /// Builds a registry with the built-in backends registered.
    pub fn new(
        global_config: ProvisionerConfig,
        response_manager: Arc<ResponseManager>,
    ) -> Result<Self, Error> {
        let host_pool = Arc::new(HostPool::new(
            global_config.remote_hosts.iter().cloned(),
            global_config.load_balancing_algorithm,
        )?);

        let mut registry = Self {
            global_config,
            response_manager,
            host_pool,
            factories: HashMap::new(),
        };

        registry.register("kubernetes", |_registry, _config| {
            Ok(Box::new(KubernetesProvisioner::new()))
        });
        registry.register("spark-operator", |_registry, _config| {
            Ok(Box::new(CustomResourceProvisioner::new(CrdKind::spark_operator())))
        });
        registry.register("docker", |_registry, _config| {
            Ok(Box::new(DockerProvisioner::new(DockerMode::Container)))
        });
        registry.register("docker-swarm", |_registry, _config| {
            Ok(Box::new(DockerProvisioner::new(DockerMode::Swarm)))
        });
        registry.register("yarn", |_registry, config| {
            Ok(Box::new(YarnProvisioner::new(config)?))
        });
        registry.register("distributed", |registry, config| {
            Ok(Box::new(DistributedProvisioner::new(registry.pool_for(config)?)))
        });

        Ok(registry)
    }

    /// Registers (or replaces) a backend factory under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Self, &ProvisionerConfig) -> Result<Box<dyn Backend>, Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    #[must_use]
    pub fn response_manager(&self) -> &Arc<ResponseManager> { &self.response_manager }

    #[must_use]
    pub fn global_config(&self) -> &ProvisionerConfig { &self.global_config }

    /// Resolves the spec to a backend adapter and the merged configuration
    /// the launch will run under. Config-level validation happens here so a
    /// bad launch fails before any backend resource exists.
    pub fn resolve(
        &self,
        spec: &KernelSpec,
    ) -> Result<(Box<dyn Backend>, ProvisionerConfig), Error> {
        let stanza =
            spec.metadata.kernel_provisioner.as_ref().ok_or(Error::MissingProvisionerStanza)?;
        let factory = self
            .factories
            .get(&stanza.provisioner_name)
            .ok_or_else(|| Error::UnknownProvisioner { name: stanza.provisioner_name.clone() })?;

        let merged = self
            .global_config
            .merge(&stanza.config)
            .map_err(|source| Error::Policy { source })?;
        merged.validate().context(super::PortPolicySnafu)?;

        let backend = factory(self, &merged)?;
        Ok((backend, merged))
    }

    /// Creates a supervisor for one kernel described by `spec`.
    ///
    /// `kernel_id` is normally supplied by the host; a fresh UUID is
    /// assigned when absent.
    pub fn provision(
        &self,
        spec: &KernelSpec,
        kernel_id: Option<String>,
    ) -> Result<KernelSupervisor, Error> {
        let (backend, config) = self.resolve(spec)?;
        let kernel_id = kernel_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(KernelSupervisor::new(
            kernel_id,
            spec.clone(),
            config,
            backend,
            Arc::clone(&self.response_manager),
        ))
    }

    /// The host pool a distributed launch should draw from: the shared
    /// process-wide pool, unless the merged config overrides the host list
    /// or algorithm (then the kernel gets a dedicated pool).
    fn pool_for(&self, config: &ProvisionerConfig) -> Result<Arc<HostPool>, Error> {
        if config.remote_hosts == self.global_config.remote_hosts
            && config.load_balancing_algorithm == self.global_config.load_balancing_algorithm
        {
            return Ok(Arc::clone(&self.host_pool));
        }
        Ok(Arc::new(HostPool::new(
            config.remote_hosts.iter().cloned(),
            config.load_balancing_algorithm,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use serde_json::json;

    use super::*;
    use crate::{crypto::Keypair, response::ResponseSettings, spec::KernelSpec};

    static KEYPAIR: LazyLock<Arc<Keypair>> =
        LazyLock::new(|| Arc::new(Keypair::generate().expect("keypair generation")));

    async fn test_registry(config: ProvisionerConfig) -> ProvisionerRegistry {
        let settings = ResponseSettings {
            ip: Some(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
            preferred_port: 0,
            ..ResponseSettings::default()
        };
        let manager = Arc::new(
            ResponseManager::with_settings(settings, Arc::clone(&KEYPAIR)).await.unwrap(),
        );
        ProvisionerRegistry::new(config, manager).unwrap()
    }

    fn spec_for(provisioner_name: &str, config: serde_json::Value) -> KernelSpec {
        serde_json::from_value(json!({
            "display_name": "Test Kernel",
            "language": "python",
            "argv": ["launcher", "--kernel-id", "{kernel_id}"],
            "metadata": {
                "kernel_provisioner": {
                    "provisioner_name": provisioner_name,
                    "config": config
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn resolves_builtin_backends() {
        let registry = test_registry(ProvisionerConfig::default()).await;
        for name in ["kubernetes", "spark-operator", "docker", "docker-swarm", "distributed"] {
            let (backend, _config) = registry.resolve(&spec_for(name, json!({}))).unwrap();
            assert_eq!(backend.name(), name, "factory mismatch for {name}");
        }
    }

    #[tokio::test]
    async fn unknown_provisioner_is_rejected() {
        let registry = test_registry(ProvisionerConfig::default()).await;
        let err = registry.resolve(&spec_for("mesos", json!({}))).unwrap_err();
        assert!(matches!(err, Error::UnknownProvisioner { .. }));
    }

    #[tokio::test]
    async fn spec_without_stanza_is_rejected() {
        let registry = test_registry(ProvisionerConfig::default()).await;
        let spec: KernelSpec = serde_json::from_value(json!({
            "display_name": "Local", "language": "python", "argv": ["python"]
        }))
        .unwrap();
        assert!(matches!(registry.resolve(&spec).unwrap_err(), Error::MissingProvisionerStanza));
    }

    #[tokio::test]
    async fn stanza_config_overrides_globals() {
        let registry = test_registry(ProvisionerConfig::default()).await;
        let spec = spec_for("distributed", json!({ "remote_hosts": ["h1", "h2"] }));
        let (_backend, config) = registry.resolve(&spec).unwrap();
        assert_eq!(config.remote_hosts, vec!["h1".to_string(), "h2".to_string()]);
    }

    #[tokio::test]
    async fn undersized_port_range_fails_resolution_before_spawn() {
        let registry = test_registry(ProvisionerConfig::default()).await;
        let spec = spec_for("distributed", json!({ "port_range": "40000..40000" }));
        let err = registry.resolve(&spec).unwrap_err();
        assert!(matches!(
            err,
            Error::PortPolicy { source: crate::ports::Error::PortRangeTooSmall { .. } }
        ));
    }

    #[tokio::test]
    async fn yarn_without_endpoint_is_rejected_at_resolution() {
        if std::env::var("HADOOP_CONF_DIR").is_ok() {
            return;
        }
        let registry = test_registry(ProvisionerConfig::default()).await;
        let err = registry.resolve(&spec_for("yarn", json!({}))).unwrap_err();
        assert!(matches!(err, Error::MissingYarnEndpoint));

        let spec = spec_for("yarn", json!({ "yarn_endpoint": "http://rm:8088" }));
        assert!(registry.resolve(&spec).is_ok());
    }
}
