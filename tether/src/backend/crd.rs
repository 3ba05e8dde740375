//! Kernel lifecycle management through a Kubernetes custom resource.
//!
//! Some platforms (notably the Spark operator) want a CRD instance rather
//! than a bare pod: the operator materializes the driver pod itself. This
//! adapter submits the custom object, watches its `applicationState` until
//! the operator reports `running`, then defers to pod-level discovery for
//! the driver's address. Teardown deletes the custom object (the operator
//! reaps its pods) plus any auto-created namespace.

use async_trait::async_trait;
use kube::{
    Api,
    api::{ApiResource, DynamicObject, GroupVersionKind, PostParams},
};
use serde_json::json;
use snafu::ResultExt;
use tether_base::consts::kernel_env;

use super::{
    Backend, Discovery, Error, KubeApiSnafu, LaunchContext,
    k8s::{self, KubernetesProvisioner},
};

/// Which custom resource definition carries the kernel.
#[derive(Clone, Debug)]
pub struct CrdKind {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
}

impl CrdKind {
    /// The `sparkoperator.k8s.io/v1beta2 SparkApplication` preset.
    #[must_use]
    pub fn spark_operator() -> Self {
        Self {
            group: "sparkoperator.k8s.io".to_string(),
            version: "v1beta2".to_string(),
            plural: "sparkapplications".to_string(),
            kind: "SparkApplication".to_string(),
        }
    }

    fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

/// Submission states reported under `status.applicationState.state`.
const ERROR_STATES: &[&str] = &["failed", "submission_failed", "failing"];

#[derive(Debug)]
pub struct CustomResourceProvisioner {
    /// Pod-level identity and namespace handling is shared with the plain
    /// Kubernetes adapter.
    pods: KubernetesProvisioner,
    crd: CrdKind,
    resource_name: Option<String>,
}

impl CustomResourceProvisioner {
    #[must_use]
    pub fn new(crd: CrdKind) -> Self {
        Self { pods: KubernetesProvisioner::new(), crd, resource_name: None }
    }

    fn namespace(&self, ctx: &LaunchContext) -> String {
        self.pods.namespace.clone().unwrap_or_else(|| ctx.config.namespace.clone())
    }

    async fn custom_object_api(
        &mut self,
        ctx: &LaunchContext,
    ) -> Result<Api<DynamicObject>, Error> {
        let namespace = self.namespace(ctx);
        let client = self.pods.client().await?;
        Ok(Api::namespaced_with(client, &namespace, &self.crd.api_resource()))
    }

    async fn application_state(&mut self, ctx: &LaunchContext) -> Result<Option<String>, Error> {
        let Some(resource_name) = self.resource_name.clone() else { return Ok(None) };
        let api = self.custom_object_api(ctx).await?;
        match api.get_opt(&resource_name).await {
            Ok(Some(object)) => Ok(object
                .data
                .pointer("/status/applicationState/state")
                .and_then(serde_json::Value::as_str)
                .map(str::to_lowercase)),
            Ok(None) => Ok(None),
            Err(source) => Err(Error::KubeApi {
                operation: format!("reading {} '{resource_name}'", self.crd.kind),
                source: Box::new(source),
            }),
        }
    }
}

#[async_trait]
impl Backend for CustomResourceProvisioner {
    fn name(&self) -> &'static str { "custom-resource" }

    async fn prepare(&mut self, ctx: &mut LaunchContext) -> Result<(), Error> {
        self.pods.prepare(ctx).await?;

        let resource_name =
            ctx.env.get(kernel_env::POD_NAME).cloned().map(|name| k8s::sanitize_name(&name));
        let resource_name = resource_name.unwrap_or_else(|| k8s::sanitize_name(&ctx.kernel_id));
        ctx.env.insert(kernel_env::RESOURCE_NAME.to_string(), resource_name.clone());
        ctx.env.insert(kernel_env::CRD_GROUP.to_string(), self.crd.group.clone());
        ctx.env.insert(kernel_env::CRD_VERSION.to_string(), self.crd.version.clone());
        ctx.env.insert(kernel_env::CRD_PLURAL.to_string(), self.crd.plural.clone());
        self.resource_name = Some(resource_name);
        Ok(())
    }

    async fn spawn(&mut self, ctx: &LaunchContext) -> Result<(), Error> {
        let resource_name = self.resource_name.clone().expect("prepare() names the resource");
        let namespace = self.namespace(ctx);
        let object = build_custom_object(ctx, &self.crd, &resource_name, &namespace);

        let api = self.custom_object_api(ctx).await?;
        let _created =
            api.create(&PostParams::default(), &object).await.with_context(|_| KubeApiSnafu {
                operation: format!(
                    "creating {} '{resource_name}' in namespace '{namespace}'",
                    self.crd.kind
                ),
            })?;

        tracing::info!(
            kernel_id = %ctx.kernel_id,
            "Kernel launched as {} {namespace}/{resource_name}",
            self.crd.kind,
        );
        Ok(())
    }

    async fn discover(&mut self, ctx: &LaunchContext) -> Result<Discovery, Error> {
        match self.application_state(ctx).await? {
            Some(state) if ERROR_STATES.contains(&state.as_str()) => Ok(Discovery::Failed {
                detail: format!("{} submission state '{state}'", self.crd.kind),
            }),
            // Operator reports the application running: the driver pod now
            // carries the kernel, so pod discovery takes over.
            Some(state) if state == "running" => self.pods.discover(ctx).await,
            _ => Ok(Discovery::Pending),
        }
    }

    async fn status(&mut self, ctx: &LaunchContext) -> Result<Option<i32>, Error> {
        match self.application_state(ctx).await? {
            Some(state)
                if matches!(state.as_str(), "submitted" | "pending" | "running") =>
            {
                Ok(None)
            }
            _ => Ok(Some(0)),
        }
    }

    async fn send_native_signal(
        &mut self,
        ctx: &LaunchContext,
        signum: i32,
    ) -> Result<bool, Error> {
        self.pods.send_native_signal(ctx, signum).await
    }

    async fn terminate_resources(
        &mut self,
        ctx: &LaunchContext,
        restart: bool,
    ) -> Result<(), Error> {
        if let Some(resource_name) = self.resource_name.clone() {
            let api = self.custom_object_api(ctx).await?;
            match api.delete(&resource_name, &k8s::delete_params()).await {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(source) => {
                    return Err(Error::KubeApi {
                        operation: format!("deleting {} '{resource_name}'", self.crd.kind),
                        source: Box::new(source),
                    });
                }
            }
            self.resource_name = None;
        }
        self.pods.delete_namespace_if_owned(ctx, restart).await
    }

    fn backend_handle(&self) -> Option<String> { self.resource_name.clone() }
}

fn build_custom_object(
    ctx: &LaunchContext,
    crd: &CrdKind,
    resource_name: &str,
    namespace: &str,
) -> DynamicObject {
    let labels = KubernetesProvisioner::labels(ctx);
    let image = ctx.env.get(kernel_env::IMAGE).cloned().unwrap_or_default();
    let executor_image =
        ctx.env.get(kernel_env::EXECUTOR_IMAGE).cloned().unwrap_or_else(|| image.clone());
    let service_account = ctx.env.get(kernel_env::SERVICE_ACCOUNT_NAME).cloned();
    let extra_spark_opts = ctx.env.get(kernel_env::EXTRA_SPARK_OPTS).cloned();

    let mut object = DynamicObject::new(resource_name, &crd.api_resource());
    object.metadata.namespace = Some(namespace.to_string());
    object.metadata.labels = Some(labels);
    object.data = json!({
        "spec": {
            "type": "Python",
            "mode": "cluster",
            "image": image,
            "mainApplicationFile": ctx.argv.first(),
            "arguments": ctx.argv.get(1..),
            "sparkConf": extra_spark_opts.map(|opts| json!({ "spark.kernel.extraOpts": opts })),
            "driver": {
                "serviceAccount": service_account,
                "labels": KubernetesProvisioner::labels(ctx),
                "envVars": ctx.env,
            },
            "executor": {
                "image": executor_image,
                "labels": { "kernel_id": ctx.kernel_id, "app": ctx.config.app_name },
            },
        }
    });
    object
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
            kernel_name: "Spark".to_string(),
            argv: vec!["/opt/spark/run.py".to_string(), "--RemoteProcessProxy.spark".to_string()],
            env: HashMap::from([
                (kernel_env::IMAGE.to_string(), "example.com/spark-kernel:3".to_string()),
                (kernel_env::SERVICE_ACCOUNT_NAME.to_string(), "spark".to_string()),
            ]),
            config: ProvisionerConfig::default(),
        }
    }

    #[test]
    fn spark_operator_preset_targets_the_expected_crd() {
        let crd = CrdKind::spark_operator();
        assert_eq!(crd.group, "sparkoperator.k8s.io");
        assert_eq!(crd.version, "v1beta2");
        assert_eq!(crd.plural, "sparkapplications");
        assert_eq!(crd.kind, "SparkApplication");
    }

    #[test]
    fn custom_object_carries_labels_and_spec() {
        let ctx = sample_context();
        let object =
            build_custom_object(&ctx, &CrdKind::spark_operator(), "alice-4a2f1c9e", "spark-ns");

        assert_eq!(object.metadata.name.as_deref(), Some("alice-4a2f1c9e"));
        assert_eq!(object.metadata.namespace.as_deref(), Some("spark-ns"));
        let labels = object.metadata.labels.unwrap();
        assert_eq!(labels.get("kernel_id").map(String::as_str), Some("4a2f1c9e"));

        assert_eq!(
            object.data.pointer("/spec/image").and_then(serde_json::Value::as_str),
            Some("example.com/spark-kernel:3")
        );
        assert_eq!(
            object.data.pointer("/spec/driver/serviceAccount").and_then(serde_json::Value::as_str),
            Some("spark")
        );
    }
}
