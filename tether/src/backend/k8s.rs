//! Kernel lifecycle management on Kubernetes.
//!
//! Each kernel becomes one pod, labelled so discovery can find it again:
//! `kernel_id=<id>,component=kernel,app=<app>`. Namespace selection follows
//! three modes: share the operator's namespace, honor a caller-provided
//! `KERNEL_NAMESPACE`, or auto-create `{username}-{kernel_id}` together
//! with a RoleBinding to the configured cluster role (auto-created
//! namespaces are deleted again on teardown).

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        core::v1::{Container, EnvVar, Namespace, Pod, PodSecurityContext, PodSpec,
            ResourceRequirements},
        rbac::v1::{RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{
    Api,
    api::{DeleteParams, ListParams, ObjectMeta, PostParams, PropagationPolicy},
};
use snafu::ResultExt;
use tether_base::consts::kernel_env;

use super::{Backend, Discovery, Error, KubeApiSnafu, LaunchContext, prepare_container_env};

pub(crate) const CONTAINER_NAME: &str = "kernel";
const COMPONENT_LABEL_VALUE: &str = "kernel";

/// States in which the pod is starting or healthy.
const INITIAL_PHASES: &[&str] = &["Pending", "Running"];
/// States that fail the launch outright.
const ERROR_PHASES: &[&str] = &["Failed"];

pub struct KubernetesProvisioner {
    client: Option<kube::Client>,
    pub(crate) pod_name: Option<String>,
    pub(crate) namespace: Option<String>,
    delete_namespace: bool,
    restarting: bool,
}

impl KubernetesProvisioner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: None,
            pod_name: None,
            namespace: None,
            delete_namespace: false,
            restarting: false,
        }
    }

    pub(crate) async fn client(&mut self) -> Result<kube::Client, Error> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = kube::Client::try_default().await.context(super::KubeConfigSnafu)?;
        self.client = Some(client.clone());
        Ok(client)
    }

    fn label_selector(ctx: &LaunchContext) -> String {
        format!("kernel_id={},component={COMPONENT_LABEL_VALUE}", ctx.kernel_id)
    }

    pub(crate) fn labels(ctx: &LaunchContext) -> BTreeMap<String, String> {
        BTreeMap::from_iter([
            ("kernel_id".to_string(), ctx.kernel_id.clone()),
            ("component".to_string(), COMPONENT_LABEL_VALUE.to_string()),
            ("app".to_string(), ctx.config.app_name.clone()),
        ])
    }

    /// Determines pod name and namespace, creating the namespace when the
    /// configuration calls for a per-kernel one.
    pub(crate) async fn resolve_identity(&mut self, ctx: &mut LaunchContext) -> Result<(), Error> {
        let pod_name = ctx
            .env
            .get(kernel_env::POD_NAME)
            .cloned()
            .unwrap_or_else(|| format!("{}-{}", ctx.username, ctx.kernel_id));
        let pod_name = sanitize_name(&pod_name);
        ctx.env.insert(kernel_env::POD_NAME.to_string(), pod_name.clone());
        self.pod_name = Some(pod_name);

        let service_account = ctx
            .env
            .get(kernel_env::SERVICE_ACCOUNT_NAME)
            .cloned()
            .unwrap_or_else(|| ctx.config.default_kernel_service_account_name.clone());
        ctx.env.insert(kernel_env::SERVICE_ACCOUNT_NAME.to_string(), service_account.clone());

        let namespace = match ctx.env.get(kernel_env::NAMESPACE).cloned() {
            Some(namespace) => {
                tracing::info!("KERNEL_NAMESPACE provided by client: {namespace}");
                namespace
            }
            None if ctx.config.shared_namespace => {
                let namespace = ctx.config.namespace.clone();
                tracing::warn!(
                    "Shared namespace has been configured. All kernels will reside in the \
                     namespace: {namespace}"
                );
                namespace
            }
            None => self.create_kernel_namespace(ctx, &service_account).await?,
        };
        ctx.env.insert(kernel_env::NAMESPACE.to_string(), namespace.clone());
        self.namespace = Some(namespace);
        Ok(())
    }

    async fn create_kernel_namespace(
        &mut self,
        ctx: &LaunchContext,
        service_account: &str,
    ) -> Result<String, Error> {
        let client = self.client().await?;
        let namespace_name =
            self.pod_name.clone().unwrap_or_else(|| sanitize_name(&ctx.kernel_id));

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace_name.clone()),
                labels: Some(Self::labels(ctx)),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };

        let api = Api::<Namespace>::all(client.clone());
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                self.delete_namespace = true;
                tracing::info!("Created kernel namespace: {namespace_name}");
            }
            // A restart may find the previous namespace still present.
            Err(kube::Error::Api(response)) if response.code == 409 && self.restarting => {
                self.restarting = false;
                self.delete_namespace = true;
                tracing::info!("Re-using kernel namespace: {namespace_name}");
                return Ok(namespace_name);
            }
            Err(source) => {
                return Err(Error::KubeApi {
                    operation: format!("creating namespace '{namespace_name}'"),
                    source: Box::new(source),
                });
            }
        }

        // Bind the configured cluster role so in-namespace kernels (e.g.
        // spark-on-k8s drivers) can manage their own executor pods. Scoped
        // to the namespace, so the shared ClusterRole is reused as-is.
        let binding = RoleBinding {
            metadata: ObjectMeta {
                name: Some(ctx.config.kernel_cluster_role.clone()),
                labels: Some(Self::labels(ctx)),
                ..ObjectMeta::default()
            },
            role_ref: RoleRef {
                api_group: String::new(),
                kind: "ClusterRole".to_string(),
                name: ctx.config.kernel_cluster_role.clone(),
            },
            subjects: Some(vec![Subject {
                api_group: Some(String::new()),
                kind: "ServiceAccount".to_string(),
                name: service_account.to_string(),
                namespace: Some(namespace_name.clone()),
            }]),
        };

        let bindings = Api::<RoleBinding>::namespaced(client.clone(), &namespace_name);
        if let Err(source) = bindings.create(&PostParams::default(), &binding).await {
            // Roll the namespace back so a broken binding doesn't leak it.
            let _cleanup = api
                .delete(&namespace_name, &delete_params())
                .await
                .inspect(|_| tracing::warn!("Deleted kernel namespace: {namespace_name}"));
            return Err(Error::KubeApi {
                operation: format!("creating role binding for namespace '{namespace_name}'"),
                source: Box::new(source),
            });
        }
        tracing::info!(
            "Created kernel role-binding '{}' in namespace: {namespace_name} for service \
             account: {service_account}",
            ctx.config.kernel_cluster_role
        );

        Ok(namespace_name)
    }

    async fn find_pod(&mut self, ctx: &LaunchContext) -> Result<Option<Pod>, Error> {
        let client = self.client().await?;
        let namespace = self.namespace.clone().unwrap_or_else(|| ctx.config.namespace.clone());
        let api = Api::<Pod>::namespaced(client, &namespace);
        let pods = api
            .list(&ListParams::default().labels(&Self::label_selector(ctx)))
            .await
            .with_context(|_| KubeApiSnafu {
                operation: format!("listing pods in namespace '{namespace}'"),
            })?;
        Ok(pods.items.into_iter().next())
    }

    pub(crate) async fn delete_pod(&mut self, ctx: &LaunchContext) -> Result<(), Error> {
        let Some(pod_name) = self.pod_name.clone() else { return Ok(()) };
        let client = self.client().await?;
        let namespace = self.namespace.clone().unwrap_or_else(|| ctx.config.namespace.clone());
        let api = Api::<Pod>::namespaced(client, &namespace);
        match api.delete(&pod_name, &delete_params()).await {
            Ok(_) => {
                tracing::debug!(
                    kernel_id = %ctx.kernel_id,
                    "Pod {namespace}.{pod_name} has been terminated"
                );
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(Error::KubeApi {
                operation: format!("deleting pod '{namespace}.{pod_name}'"),
                source: Box::new(source),
            }),
        }
    }

    pub(crate) async fn delete_namespace_if_owned(
        &mut self,
        ctx: &LaunchContext,
        restart: bool,
    ) -> Result<(), Error> {
        self.restarting = restart;
        if !self.delete_namespace || restart {
            return Ok(());
        }
        let Some(namespace) = self.namespace.clone() else { return Ok(()) };
        let client = self.client().await?;
        let api = Api::<Namespace>::all(client);
        match api.delete(&namespace, &delete_params()).await {
            Ok(_) => {
                tracing::debug!(kernel_id = %ctx.kernel_id, "Namespace {namespace} deleted");
                self.delete_namespace = false;
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                self.delete_namespace = false;
                Ok(())
            }
            Err(source) => Err(Error::KubeApi {
                operation: format!("deleting namespace '{namespace}'"),
                source: Box::new(source),
            }),
        }
    }
}

impl Default for KubernetesProvisioner {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Backend for KubernetesProvisioner {
    fn name(&self) -> &'static str { "kubernetes" }

    async fn prepare(&mut self, ctx: &mut LaunchContext) -> Result<(), Error> {
        prepare_container_env(&ctx.config, &mut ctx.env)?;
        self.resolve_identity(ctx).await
    }

    async fn spawn(&mut self, ctx: &LaunchContext) -> Result<(), Error> {
        let pod_name = self.pod_name.clone().expect("prepare() resolves the pod name");
        let namespace = self.namespace.clone().expect("prepare() resolves the namespace");

        let pod = build_pod_manifest(ctx, &pod_name, &namespace);
        let client = self.client().await?;
        let api = Api::<Pod>::namespaced(client, &namespace);
        let _created =
            api.create(&PostParams::default(), &pod).await.with_context(|_| KubeApiSnafu {
                operation: format!("creating pod '{pod_name}' in namespace '{namespace}'"),
            })?;

        tracing::info!(
            kernel_id = %ctx.kernel_id,
            "Kernel launched. Kernel image: {}, pod: {namespace}.{pod_name}",
            ctx.env.get(kernel_env::IMAGE).map_or("<unset>", String::as_str),
        );
        Ok(())
    }

    async fn discover(&mut self, ctx: &LaunchContext) -> Result<Discovery, Error> {
        let Some(pod) = self.find_pod(ctx).await? else { return Ok(Discovery::Pending) };

        let pod_name = pod.metadata.name.unwrap_or_default();
        let status = pod.status.unwrap_or_default();
        let phase = status.phase.unwrap_or_default();

        if ERROR_PHASES.contains(&phase.as_str()) {
            return Ok(Discovery::Failed { detail: format!("pod phase '{phase}'") });
        }
        if phase == "Running"
            && let Some(pod_ip) = status.pod_ip
        {
            return Ok(Discovery::Located { host: pod_name, ip: Some(pod_ip) });
        }
        Ok(Discovery::Pending)
    }

    async fn status(&mut self, ctx: &LaunchContext) -> Result<Option<i32>, Error> {
        let phase = self
            .find_pod(ctx)
            .await?
            .and_then(|pod| pod.status)
            .and_then(|status| status.phase)
            .unwrap_or_default();
        if INITIAL_PHASES.contains(&phase.as_str()) { Ok(None) } else { Ok(Some(0)) }
    }

    async fn send_native_signal(
        &mut self,
        _ctx: &LaunchContext,
        _signum: i32,
    ) -> Result<bool, Error> {
        // Pods have no signal surface beyond deletion; interrupts travel
        // over the communication port.
        Ok(false)
    }

    async fn terminate_resources(
        &mut self,
        ctx: &LaunchContext,
        restart: bool,
    ) -> Result<(), Error> {
        self.delete_pod(ctx).await?;
        self.delete_namespace_if_owned(ctx, restart).await?;
        self.pod_name = None;
        Ok(())
    }

    fn backend_handle(&self) -> Option<String> {
        match (&self.namespace, &self.pod_name) {
            (Some(namespace), Some(pod_name)) => Some(format!("{namespace}/{pod_name}")),
            _ => None,
        }
    }
}

pub(crate) fn delete_params() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        propagation_policy: Some(PropagationPolicy::Background),
        ..DeleteParams::default()
    }
}

/// Rewrites a name to satisfy the DNS-label convention pods require.
pub(crate) fn sanitize_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            sanitized.push(ch);
        } else if !sanitized.ends_with('-') {
            sanitized.push('-');
        }
    }
    sanitized.trim_matches('-').to_string()
}

/// Builds the pod manifest for a kernel launch.
fn build_pod_manifest(ctx: &LaunchContext, pod_name: &str, namespace: &str) -> Pod {
    let env: Vec<EnvVar> = ctx
        .env
        .iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        })
        .collect();

    let security_context = pod_security_context(ctx);
    let resources = resource_requirements(ctx);
    let working_dir = ctx.env.get(kernel_env::WORKING_DIR).cloned();
    let service_account_name = ctx.env.get(kernel_env::SERVICE_ACCOUNT_NAME).cloned();

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(KubernetesProvisioner::labels(ctx)),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            service_account_name,
            security_context,
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: ctx.env.get(kernel_env::IMAGE).cloned(),
                command: Some(ctx.argv.clone()),
                env: Some(env),
                working_dir,
                resources,
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

fn pod_security_context(ctx: &LaunchContext) -> Option<PodSecurityContext> {
    let run_as_user = ctx.env.get(kernel_env::UID).and_then(|uid| uid.parse().ok());
    let run_as_group = ctx.env.get(kernel_env::GID).and_then(|gid| gid.parse().ok());
    if run_as_user.is_none() && run_as_group.is_none() {
        return None;
    }
    Some(PodSecurityContext { run_as_user, run_as_group, ..PodSecurityContext::default() })
}

fn resource_requirements(ctx: &LaunchContext) -> Option<ResourceRequirements> {
    let quantities = |keys: [(&str, &str); 3]| -> Option<BTreeMap<String, Quantity>> {
        let map: BTreeMap<String, Quantity> = keys
            .into_iter()
            .filter_map(|(env_key, resource)| {
                ctx.env.get(env_key).map(|value| (resource.to_string(), Quantity(value.clone())))
            })
            .collect();
        (!map.is_empty()).then_some(map)
    };

    let requests = quantities([
        (kernel_env::CPUS, "cpu"),
        (kernel_env::MEMORY, "memory"),
        (kernel_env::GPUS, "nvidia.com/gpu"),
    ]);
    let limits = quantities([
        (kernel_env::CPUS_LIMIT, "cpu"),
        (kernel_env::MEMORY_LIMIT, "memory"),
        (kernel_env::GPUS_LIMIT, "nvidia.com/gpu"),
    ]);

    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ResourceRequirements { requests, limits, ..ResourceRequirements::default() })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::ProvisionerConfig;

    fn sample_context() -> LaunchContext {
        LaunchContext {
            kernel_id: "4a2f1c9e".to_string(),
            username: "alice".to_string(),
            kernel_name: "Python on Kubernetes".to_string(),
            argv: vec![
                "/usr/local/bin/launch_kernel".to_string(),
                "--kernel-id".to_string(),
                "4a2f1c9e".to_string(),
            ],
            env: HashMap::from([
                (kernel_env::IMAGE.to_string(), "example.com/kernels/py:3".to_string()),
                (kernel_env::UID.to_string(), "1000".to_string()),
                (kernel_env::GID.to_string(), "100".to_string()),
                (kernel_env::CPUS.to_string(), "2".to_string()),
                (kernel_env::MEMORY.to_string(), "4Gi".to_string()),
                (kernel_env::MEMORY_LIMIT.to_string(), "8Gi".to_string()),
                (kernel_env::SERVICE_ACCOUNT_NAME.to_string(), "kernels".to_string()),
            ]),
            config: ProvisionerConfig::default(),
        }
    }

    #[test]
    fn sanitizes_pod_names() {
        assert_eq!(sanitize_name("Alice.Smith-4A2F"), "alice-smith-4a2f");
        assert_eq!(sanitize_name("--weird__name--"), "weird-name");
        assert_eq!(sanitize_name("ok-already-1"), "ok-already-1");
    }

    #[test]
    fn manifest_carries_identity_labels() {
        let ctx = sample_context();
        let pod = build_pod_manifest(&ctx, "alice-4a2f1c9e", "kernels-ns");

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("kernel_id").map(String::as_str), Some("4a2f1c9e"));
        assert_eq!(labels.get("component").map(String::as_str), Some("kernel"));
        assert_eq!(labels.get("app").map(String::as_str), Some(tether_base::APP_LABEL_VALUE));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("kernels-ns"));
    }

    #[test]
    fn manifest_runs_launcher_with_requested_identity_and_resources() {
        let ctx = sample_context();
        let pod = build_pod_manifest(&ctx, "alice-4a2f1c9e", "kernels-ns");
        let spec = pod.spec.unwrap();

        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.service_account_name.as_deref(), Some("kernels"));

        let security = spec.security_context.unwrap();
        assert_eq!(security.run_as_user, Some(1000));
        assert_eq!(security.run_as_group, Some(100));

        let container = &spec.containers[0];
        assert_eq!(container.name, CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("example.com/kernels/py:3"));
        assert_eq!(container.command.as_ref().unwrap()[0], "/usr/local/bin/launch_kernel");

        let resources = container.resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests.get("cpu"), Some(&Quantity("2".to_string())));
        assert_eq!(requests.get("memory"), Some(&Quantity("4Gi".to_string())));
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(limits.get("memory"), Some(&Quantity("8Gi".to_string())));
        assert!(limits.get("cpu").is_none());
    }

    #[test]
    fn manifest_env_reaches_the_launcher() {
        let ctx = sample_context();
        let pod = build_pod_manifest(&ctx, "p", "ns");
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        assert!(env.iter().any(|var| var.name == kernel_env::IMAGE));
        assert!(env.iter().any(|var| var.name == kernel_env::CPUS));
    }
}
