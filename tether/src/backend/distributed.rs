//! Kernel lifecycle management across a set of SSH-reachable hosts.
//!
//! The load balancer (or a `KERNEL_REMOTE_HOST` pin) picks the target
//! host; the launcher command is wrapped in an SSH invocation that exports
//! the kernel environment, runs the launcher under `nohup` with its output
//! redirected to a per-kernel log, and echoes the background pid so the
//! engine can manage the remote process. Launches that land on the local
//! host skip SSH entirely.

use std::{
    net::IpAddr,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use snafu::ResultExt;
use tether_base::consts::kernel_env;

use super::{Backend, Discovery, Error, LaunchContext, SpawnProcessSnafu};
use crate::{
    balancer::HostPool,
    config::ProvisionerConfig,
    ssh::{Session, SshSettings},
};

pub struct DistributedProvisioner {
    pool: Arc<HostPool>,
    assigned_host: Option<String>,
    assigned_ip: Option<String>,
    remote_pid: Option<i64>,
    local_child: Option<tokio::process::Child>,
    kernel_log_path: Option<PathBuf>,
}

impl DistributedProvisioner {
    #[must_use]
    pub fn new(pool: Arc<HostPool>) -> Self {
        Self {
            pool,
            assigned_host: None,
            assigned_ip: None,
            remote_pid: None,
            local_child: None,
            kernel_log_path: None,
        }
    }

    fn ssh_settings(config: &ProvisionerConfig, host: &str) -> SshSettings {
        if config.remote_gss_ssh {
            tracing::debug!("Connecting to remote host via GSS credentials is delegated to key material");
        }
        let user = config
            .remote_user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        SshSettings {
            host: host.to_string(),
            port: config.ssh_port,
            user,
            password: config.remote_pwd.clone(),
            private_key_path: config.ssh_private_key_file_path.clone(),
            strict_host_key_checking: true,
        }
    }

    async fn resolve_ip(host: &str, ssh_port: u16) -> Option<String> {
        tokio::net::lookup_host((host, ssh_port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip().to_string())
    }

    fn is_local(host: &str, ip: Option<&str>) -> bool {
        host == "localhost"
            || ip
                .and_then(|ip| ip.parse::<IpAddr>().ok())
                .is_some_and(|ip| ip.is_loopback())
    }

    async fn launch_local(&mut self, ctx: &LaunchContext, log_path: &PathBuf) -> Result<(), Error> {
        let (program, args) = ctx
            .argv
            .split_first()
            .ok_or_else(|| Error::StartupFailed { detail: "empty argv".to_string() })?;

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
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

        self.remote_pid = child.id().map(i64::from);
        self.local_child = Some(child);
        Ok(())
    }

    async fn launch_remote(&mut self, ctx: &LaunchContext, log_path: &PathBuf) -> Result<(), Error> {
        let host = self.assigned_host.clone().expect("host selected before launch");
        let command = build_startup_command(ctx, log_path);
        tracing::debug!("Invoking cmd: '{command}' on host: {host}");

        let session = Session::connect(&Self::ssh_settings(&ctx.config, &host)).await?;
        let (code, output) = session.exec_capture(&command).await?;
        let _closed = session.close().await;

        let result = output.lines().last().map(str::trim).unwrap_or_default().to_string();
        if code != 0 {
            return Err(Error::LaunchFailed { host, detail: format!("exit {code}: {result}") });
        }
        let pid = result.parse::<i64>().map_err(|_| Error::LaunchFailed {
            host: host.clone(),
            detail: format!("expected a pid, got '{result}'"),
        })?;
        self.remote_pid = Some(pid);
        Ok(())
    }

    async fn exec_on_assigned_host(&self, ctx: &LaunchContext, command: &str) -> Result<u32, Error> {
        let host = self.assigned_host.clone().ok_or_else(|| Error::LaunchFailed {
            host: "<unassigned>".to_string(),
            detail: "no host has been assigned".to_string(),
        })?;
        let session = Session::connect(&Self::ssh_settings(&ctx.config, &host)).await?;
        let (code, _output) = session.exec_capture(command).await?;
        let _closed = session.close().await;
        Ok(code)
    }
}

#[async_trait]
impl Backend for DistributedProvisioner {
    fn name(&self) -> &'static str { "distributed" }

    async fn spawn(&mut self, ctx: &LaunchContext) -> Result<(), Error> {
        let pinned = ctx.env.get(kernel_env::REMOTE_HOST).map(String::as_str);
        let host = self.pool.select(&ctx.kernel_id, pinned)?;
        let ip = Self::resolve_ip(&host, ctx.config.ssh_port).await;
        self.assigned_host = Some(host.clone());
        self.assigned_ip = ip.clone();

        let log_path =
            ctx.config.kernel_log_dir.join(format!("kernel-{}.log", ctx.kernel_id));
        self.kernel_log_path = Some(log_path.clone());

        let launch = if Self::is_local(&host, ip.as_deref()) {
            self.launch_local(ctx, &log_path).await
        } else {
            self.launch_remote(ctx, &log_path).await
        };
        if let Err(err) = launch {
            self.pool.release(&ctx.kernel_id);
            return Err(err);
        }

        tracing::info!(
            kernel_id = %ctx.kernel_id,
            "Kernel launched. Host: '{host}', pid: {:?}, log file: {host}:{}",
            self.remote_pid,
            log_path.display(),
        );
        Ok(())
    }

    async fn discover(&mut self, _ctx: &LaunchContext) -> Result<Discovery, Error> {
        // The SSH target is chosen synchronously at spawn time.
        match &self.assigned_host {
            Some(host) => {
                Ok(Discovery::Located { host: host.clone(), ip: self.assigned_ip.clone() })
            }
            None => Ok(Discovery::Pending),
        }
    }

    async fn status(&mut self, _ctx: &LaunchContext) -> Result<Option<i32>, Error> {
        if let Some(child) = &mut self.local_child
            && let Ok(Some(status)) = child.try_wait()
        {
            return Ok(Some(status.code().unwrap_or(0)));
        }
        // Remote liveness rides on the communication-port probe; an SSH
        // `kill -0` round-trip per poll would blow the polling budget.
        Ok(None)
    }

    async fn send_native_signal(
        &mut self,
        ctx: &LaunchContext,
        signum: i32,
    ) -> Result<bool, Error> {
        if let Some(child) = &mut self.local_child {
            if signum == 9 || signum == 15 {
                let _unused = child.kill().await;
                return Ok(true);
            }
            return Ok(false);
        }

        let Some(pid) = self.remote_pid else { return Ok(false) };
        let kill = if ctx.config.impersonation_enabled {
            format!("sudo -u {} kill -{signum} {pid}", ctx.username)
        } else {
            format!("kill -{signum} {pid}")
        };
        Ok(self.exec_on_assigned_host(ctx, &kill).await? == 0)
    }

    async fn terminate_resources(
        &mut self,
        ctx: &LaunchContext,
        _restart: bool,
    ) -> Result<(), Error> {
        if let Some(mut child) = self.local_child.take() {
            let _unused = child.kill().await;
            let _unused = child.wait().await;
        } else if self.remote_pid.is_some() {
            // Best effort: the launcher usually exits on its own after the
            // shutdown request.
            if let Err(err) = self.send_native_signal(ctx, 9).await {
                tracing::warn!(
                    kernel_id = %ctx.kernel_id,
                    "Failed to deliver final kill to remote kernel: {err}"
                );
            }
        }
        self.pool.release(&ctx.kernel_id);
        self.remote_pid = None;
        self.assigned_host = None;
        self.assigned_ip = None;
        Ok(())
    }

    fn backend_handle(&self) -> Option<String> {
        self.remote_pid.map(|pid| pid.to_string())
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Builds the remote startup command: environment exports, `nohup` with
/// output redirection, and a trailing `echo $!` so the invocation returns
/// the background pid.
fn build_startup_command(ctx: &LaunchContext, log_path: &PathBuf) -> String {
    let mut command = String::new();

    let mut keys: Vec<&String> = ctx
        .env
        .keys()
        .filter(|key| key.starts_with("KERNEL_") || key.starts_with("GP_"))
        .collect();
    keys.sort();
    for key in keys {
        if let Some(value) = ctx.env.get(key) {
            command.push_str(&format!("export {key}={};", shell_quote(value)));
        }
    }

    let launcher = ctx.argv.join(" ");
    let launcher = if ctx.config.impersonation_enabled {
        format!("sudo -u {} {launcher}", ctx.username)
    } else {
        launcher
    };

    command.push_str(&format!("nohup {launcher} >> {} 2>&1 & echo $!", log_path.display()));
    command
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::balancer::LoadBalancingAlgorithm;

    fn sample_context(impersonation: bool) -> LaunchContext {
        LaunchContext {
            kernel_id: "4a2f1c9e".to_string(),
            username: "alice".to_string(),
            kernel_name: "Python (distributed)".to_string(),
            argv: vec![
                "/usr/local/bin/launch_kernel".to_string(),
                "--kernel-id".to_string(),
                "4a2f1c9e".to_string(),
            ],
            env: HashMap::from([
                (kernel_env::ID.to_string(), "4a2f1c9e".to_string()),
                (kernel_env::USERNAME.to_string(), "alice".to_string()),
                ("GP_IMPERSONATION_ENABLED".to_string(), impersonation.to_string()),
                ("HOME".to_string(), "/home/alice".to_string()),
            ]),
            config: ProvisionerConfig {
                impersonation_enabled: impersonation,
                ..ProvisionerConfig::default()
            },
        }
    }

    #[test]
    fn startup_command_exports_nohups_and_echoes_pid() {
        let ctx = sample_context(false);
        let command = build_startup_command(&ctx, &PathBuf::from("/tmp/kernel-4a2f1c9e.log"));

        assert!(command.contains("export KERNEL_ID='4a2f1c9e';"));
        assert!(command.contains("export KERNEL_USERNAME='alice';"));
        assert!(command.contains("export GP_IMPERSONATION_ENABLED='false';"));
        // Only the kernel/operator namespaces are exported.
        assert!(!command.contains("export HOME="));
        assert!(command.contains(
            "nohup /usr/local/bin/launch_kernel --kernel-id 4a2f1c9e >> \
             /tmp/kernel-4a2f1c9e.log 2>&1 & echo $!"
        ));
    }

    #[test]
    fn impersonation_prefixes_sudo() {
        let ctx = sample_context(true);
        let command = build_startup_command(&ctx, &PathBuf::from("/tmp/k.log"));
        assert!(command.contains("nohup sudo -u alice /usr/local/bin/launch_kernel"));
    }

    #[test]
    fn shell_quoting_survives_embedded_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn unknown_pin_fails_before_any_launch() {
        let pool = Arc::new(
            HostPool::new(
                vec!["h1".to_string(), "h2".to_string()],
                LoadBalancingAlgorithm::RoundRobin,
            )
            .unwrap(),
        );
        let mut provisioner = DistributedProvisioner::new(pool);

        let mut ctx = sample_context(false);
        ctx.env.insert(kernel_env::REMOTE_HOST.to_string(), "intruder".to_string());

        let err = provisioner.spawn(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            Error::HostSelection { source: crate::balancer::Error::UnknownRemoteHost { .. } }
        ));
        assert!(provisioner.assigned_host.is_none());
    }

    #[tokio::test]
    async fn discovery_is_synchronous_once_spawned() {
        let pool = Arc::new(
            HostPool::new(vec!["h1".to_string()], LoadBalancingAlgorithm::RoundRobin).unwrap(),
        );
        let mut provisioner = DistributedProvisioner::new(pool);
        assert!(matches!(
            provisioner.discover(&sample_context(false)).await.unwrap(),
            Discovery::Pending
        ));

        provisioner.assigned_host = Some("h1".to_string());
        provisioner.assigned_ip = Some("10.0.0.1".to_string());
        match provisioner.discover(&sample_context(false)).await.unwrap() {
            Discovery::Located { host, ip } => {
                assert_eq!(host, "h1");
                assert_eq!(ip.as_deref(), Some("10.0.0.1"));
            }
            other => panic!("expected Located, got {other:?}"),
        }
    }
}
