//! Kernel lifecycle management on Hadoop YARN.
//!
//! The kernel spec's launch script submits the application itself (with the
//! kernel id as the application name); this adapter runs that script as a
//! local child process, then locates the resulting application through the
//! ResourceManager REST API, records the application-master host, and
//! manages state/termination through the same API. An alternate endpoint
//! may be configured for HA resource managers; requests fail over in order.

use std::{
    process::Stdio,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use tether_base::consts::gp_env;

use super::{Backend, Discovery, Error, LaunchContext, SpawnProcessSnafu, YarnApiSnafu};
use crate::config::ProvisionerConfig;

const INITIAL_STATES: &[&str] = &["NEW", "SUBMITTED", "ACCEPTED", "RUNNING"];
const FINAL_STATES: &[&str] = &["FINISHED", "FAILED", "KILLED"];

/// Used when only a local Hadoop configuration directory is present; the
/// ResourceManager REST API defaults to this port on the local node.
const LOCAL_RM_ENDPOINT: &str = "http://localhost:8088";

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct App {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, rename = "amHostHttpAddress")]
    pub am_host_http_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppsResponse {
    #[serde(default)]
    apps: Option<AppList>,
}

#[derive(Debug, Deserialize)]
struct AppList {
    #[serde(default)]
    app: Vec<App>,
}

#[derive(Debug, Deserialize)]
struct AppResponse {
    app: App,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

pub struct YarnProvisioner {
    http: reqwest::Client,
    endpoints: Vec<String>,
    /// SimpleAuth identity conveyed as the `user.name` query parameter.
    auth_user: Option<String>,
    shutdown_wait_time: Duration,

    application_id: Option<String>,
    last_known_state: Option<String>,
    assigned_host: Option<String>,
    local_child: Option<tokio::process::Child>,
    started_time_begin_ms: u128,
}

impl YarnProvisioner {
    pub fn new(config: &ProvisionerConfig) -> Result<Self, Error> {
        if config.yarn_endpoint_security_enabled {
            return Err(Error::YarnSecurityUnsupported);
        }

        let mut endpoints = Vec::new();
        if let Some(endpoint) = &config.yarn_endpoint {
            endpoints.push(endpoint.clone());
            // The alternate endpoint only matters when a primary is set.
            if let Some(alternate) = &config.alt_yarn_endpoint {
                endpoints.push(alternate.clone());
            }
        } else if std::env::var("HADOOP_CONF_DIR").is_ok() {
            endpoints.push(LOCAL_RM_ENDPOINT.to_string());
        } else {
            return Err(Error::MissingYarnEndpoint);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .context(YarnApiSnafu)?;

        let shutdown_wait_time = std::env::var(gp_env::YARN_SHUTDOWN_WAIT_TIME)
            .ok()
            .and_then(|raw| raw.parse::<f64>().ok())
            .map_or(tether_base::consts::defaults::YARN_SHUTDOWN_WAIT_TIME, Duration::from_secs_f64);

        Ok(Self {
            http,
            endpoints,
            auth_user: None,
            shutdown_wait_time,
            application_id: None,
            last_known_state: None,
            assigned_host: None,
            local_child: None,
            started_time_begin_ms: 0,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, Error> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            let url = format!("{}/ws/v1/cluster/{path}", endpoint.trim_end_matches('/'));
            let mut request = self.http.get(&url).query(query);
            if let Some(user) = &self.auth_user {
                request = request.query(&[("user.name", user.as_str())]);
            }
            match request.send().await.and_then(reqwest::Response::error_for_status) {
                Ok(response) => return response.json().await.context(YarnApiSnafu),
                Err(source) => {
                    tracing::warn!("YARN endpoint '{endpoint}' failed: {source}. Continuing...");
                    last_error = Some(source);
                }
            }
        }
        Err(Error::YarnApi { source: last_error.expect("at least one endpoint is configured") })
    }

    async fn query_app_by_name(&self, kernel_id: &str) -> Result<Option<App>, Error> {
        let query =
            [("startedTimeBegin", self.started_time_begin_ms.to_string())];
        let response: AppsResponse = self.get_json("apps", &query).await?;
        let apps = response.apps.map(|list| list.app).unwrap_or_default();
        Ok(select_app_by_name(&apps, kernel_id, true))
    }

    async fn query_app_by_id(&self, application_id: &str) -> Result<Option<App>, Error> {
        match self.get_json::<AppResponse>(&format!("apps/{application_id}"), &[]).await {
            Ok(response) => Ok(Some(response.app)),
            Err(err) => {
                tracing::warn!(
                    "Query for application ID '{application_id}' failed: {err}. Continuing..."
                );
                Ok(None)
            }
        }
    }

    /// State of the application; falls back to the last known state when
    /// the ResourceManager cannot be reached.
    async fn query_app_state(&mut self, application_id: &str) -> Option<String> {
        match self.get_json::<StateResponse>(&format!("apps/{application_id}/state"), &[]).await {
            Ok(response) => {
                self.last_known_state = Some(response.state.clone());
                Some(response.state)
            }
            Err(err) => {
                tracing::warn!(
                    "Query for application '{application_id}' state failed: {err}. Continuing \
                     with last known state = '{:?}'...",
                    self.last_known_state
                );
                self.last_known_state.clone()
            }
        }
    }

    async fn kill_application(&self, application_id: &str) {
        let mut killed = false;
        for endpoint in &self.endpoints {
            let url = format!(
                "{}/ws/v1/cluster/apps/{application_id}/state",
                endpoint.trim_end_matches('/')
            );
            let result = self
                .http
                .put(&url)
                .json(&serde_json::json!({ "state": "KILLED" }))
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            match result {
                Ok(_) => {
                    killed = true;
                    break;
                }
                Err(err) => tracing::warn!(
                    "Termination of application '{application_id}' via '{endpoint}' failed: {err}"
                ),
            }
        }
        if !killed {
            tracing::warn!("Termination of application '{application_id}' failed. Continuing...");
        }
    }

    /// Surfaces an immediate local failure of the launch script so callers
    /// need not wait out the full launch timeout.
    fn detect_launch_failure(&mut self) -> Result<(), Error> {
        if let Some(child) = &mut self.local_child
            && let Ok(Some(status)) = child.try_wait()
            && !status.success()
        {
            self.local_child = None;
            return Err(Error::StartupFailed {
                detail: format!("launch script exited with {status}"),
            });
        }
        Ok(())
    }

    async fn resolve_host_ip(host: &str) -> Option<String> {
        tokio::net::lookup_host((host, 0u16))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip().to_string())
    }
}

#[async_trait]
impl Backend for YarnProvisioner {
    fn name(&self) -> &'static str { "yarn" }

    async fn prepare(&mut self, ctx: &mut LaunchContext) -> Result<(), Error> {
        // The kernelspec's launch script performs the impersonation
        // (--proxy-user) when enabled, so the setting must reach its env.
        ctx.env.insert(
            gp_env::IMPERSONATION_ENABLED.to_string(),
            ctx.config.impersonation_enabled.to_string(),
        );
        self.auth_user = Some(ctx.username.clone());
        self.application_id = None;
        self.last_known_state = None;
        self.assigned_host = None;
        self.started_time_begin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        Ok(())
    }

    async fn spawn(&mut self, ctx: &LaunchContext) -> Result<(), Error> {
        let (program, args) = ctx
            .argv
            .split_first()
            .ok_or_else(|| Error::StartupFailed { detail: "empty argv".to_string() })?;

        let log_path = ctx.config.kernel_log_dir.join(format!("kernel-{}.log", ctx.kernel_id));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context(SpawnProcessSnafu)?;
        let stderr_file = log_file.try_clone().context(SpawnProcessSnafu)?;

        let child = tokio::process::Command::new(program)
            .args(args)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .context(SpawnProcessSnafu)?;

        tracing::info!(
            kernel_id = %ctx.kernel_id,
            pid = child.id(),
            "Kernel launched against YARN RM {:?}, log: {}",
            self.endpoints.first(),
            log_path.display(),
        );
        self.local_child = Some(child);
        Ok(())
    }

    async fn discover(&mut self, ctx: &LaunchContext) -> Result<Discovery, Error> {
        if self.application_id.is_none() {
            self.detect_launch_failure()?;
            match self.query_app_by_name(&ctx.kernel_id).await {
                Ok(Some(app)) => {
                    tracing::info!(
                        kernel_id = %ctx.kernel_id,
                        "ApplicationID: '{}' assigned, state: {:?}",
                        app.id,
                        app.state,
                    );
                    self.last_known_state = app.state.clone();
                    self.application_id = Some(app.id);
                }
                Ok(None) => return Ok(Discovery::Pending),
                Err(err) => {
                    tracing::warn!("Query for kernel ID '{}' failed: {err}", ctx.kernel_id);
                    return Ok(Discovery::Pending);
                }
            }
        }

        let application_id = self.application_id.clone().expect("assigned above");
        let Some(app) = self.query_app_by_id(&application_id).await? else {
            return Ok(Discovery::Pending);
        };
        let state = app.state.clone().unwrap_or_default();
        self.last_known_state = app.state.clone();

        if FINAL_STATES.contains(&state.as_str()) {
            return Ok(Discovery::Failed {
                detail: format!(
                    "ApplicationID: '{application_id}' unexpectedly found in state '{state}' \
                     during kernel startup"
                ),
            });
        }

        if self.assigned_host.is_none()
            && let Some(am_address) = &app.am_host_http_address
        {
            let host = am_address.split(':').next().unwrap_or(am_address).to_string();
            self.assigned_host = Some(host);
        }

        match &self.assigned_host {
            Some(host) => {
                let ip = Self::resolve_host_ip(host).await;
                Ok(Discovery::Located { host: host.clone(), ip })
            }
            None => Ok(Discovery::Pending),
        }
    }

    async fn status(&mut self, _ctx: &LaunchContext) -> Result<Option<i32>, Error> {
        let Some(application_id) = self.application_id.clone() else { return Ok(Some(0)) };
        match self.query_app_state(&application_id).await {
            Some(state) if INITIAL_STATES.contains(&state.as_str()) => Ok(None),
            // Unknown state (RM unreachable with no history): give the
            // application the benefit of the doubt, the next poll retries.
            None => Ok(None),
            Some(_) => Ok(Some(0)),
        }
    }

    async fn send_native_signal(
        &mut self,
        _ctx: &LaunchContext,
        _signum: i32,
    ) -> Result<bool, Error> {
        // YARN has no interrupt surface; signals travel over the
        // communication port and kills go through the application API.
        Ok(false)
    }

    async fn terminate_resources(
        &mut self,
        ctx: &LaunchContext,
        _restart: bool,
    ) -> Result<(), Error> {
        if let Some(application_id) = self.application_id.clone() {
            self.kill_application(&application_id).await;

            let mut attempts = 0;
            while attempts < ctx.config.max_poll_attempts {
                match self.query_app_state(&application_id).await {
                    Some(state) if FINAL_STATES.contains(&state.as_str()) => break,
                    _ => {
                        attempts += 1;
                        tokio::time::sleep(ctx.config.poll_interval).await;
                    }
                }
            }
            tracing::debug!(
                kernel_id = %ctx.kernel_id,
                "YarnProvisioner terminated application {application_id}, state: {:?}",
                self.last_known_state,
            );
        }

        // Reap a possibly defunct launch script.
        if let Some(mut child) = self.local_child.take() {
            let _unused = child.kill().await;
            let _unused = child.wait().await;
        }
        self.application_id = None;
        self.assigned_host = None;
        Ok(())
    }

    fn backend_handle(&self) -> Option<String> { self.application_id.clone() }

    fn shutdown_wait_time(&self, recommended: Duration) -> Duration {
        // YARN applications take longer than most to unwind.
        recommended.max(self.shutdown_wait_time)
    }
}

/// Picks the application whose name matches the kernel id, preferring the
/// top-most application id (a restart reuses the name; YARN increments the
/// id).
///
/// The final-state check applies only to that single top pick: when
/// `ignore_final_states` is set and the newest matching application has
/// already finished, the result is `None` so the caller keeps polling for
/// the fresh submission instead of binding to a stale older application.
pub(crate) fn select_app_by_name(
    apps: &[App],
    kernel_id: &str,
    ignore_final_states: bool,
) -> Option<App> {
    let mut target: Option<App> = None;
    for app in apps {
        if !app.name.as_deref().is_some_and(|name| name.contains(kernel_id)) {
            continue;
        }
        match &target {
            Some(best) if app.id <= best.id => {}
            _ => target = Some(app.clone()),
        }
    }
    target.filter(|app| {
        !(ignore_final_states
            && app.state.as_deref().is_some_and(|state| FINAL_STATES.contains(&state)))
    })
}
