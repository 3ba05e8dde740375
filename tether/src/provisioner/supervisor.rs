//! The lifecycle supervisor: one per kernel binding.
//!
//! The supervisor owns the binding and the backend adapter, serializes
//! every state-changing operation behind one async mutex, and exposes the
//! host-facing operations (start, poll, signal, wait, shutdown, kill). A
//! cancellation token lets a host-initiated terminate interrupt an
//! in-flight launch without waiting for the launch timeout.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{
    ConnectionInfo, Error, KernelBinding, KernelState, binding::resolve_username,
};
use crate::{
    backend::{Backend, Discovery, LaunchContext},
    comm::CommClient,
    config::ProvisionerConfig,
    response::{self, ResponseManager, ResponseWaiter},
    spec::{self, KernelSpec},
    tunnel::TunnelSet,
};

const SIGINT: i32 = 2;
const SIGKILL: i32 = 9;

pub struct KernelSupervisor {
    kernel_id: String,
    cancel: CancellationToken,
    inner: tokio::sync::Mutex<Inner>,
}

struct Inner {
    spec: KernelSpec,
    config: ProvisionerConfig,
    backend: Box<dyn Backend>,
    binding: KernelBinding,
    response_manager: Arc<ResponseManager>,
    /// Retained after launch so steady-state operations can keep calling
    /// into the backend.
    context: Option<LaunchContext>,
    tunnels: Option<TunnelSet>,
}

impl KernelSupervisor {
    #[must_use]
    pub fn new(
        kernel_id: String,
        spec: KernelSpec,
        config: ProvisionerConfig,
        backend: Box<dyn Backend>,
        response_manager: Arc<ResponseManager>,
    ) -> Self {
        let binding = KernelBinding::new(kernel_id.clone(), String::new());
        Self {
            kernel_id,
            cancel: CancellationToken::new(),
            inner: tokio::sync::Mutex::new(Inner {
                spec,
                config,
                backend,
                binding,
                response_manager,
                context: None,
                tunnels: None,
            }),
        }
    }

    #[must_use]
    pub fn kernel_id(&self) -> &str { &self.kernel_id }

    pub async fn state(&self) -> KernelState { self.inner.lock().await.binding.state }

    /// Launches the kernel: authorize, prepare, spawn, await the encrypted
    /// connection payload while discovering where the kernel landed, and
    /// transition to RUNNING.
    pub async fn start(&self, env: HashMap<String, String>) -> Result<ConnectionInfo, Error> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        // Spec env is the baseline; per-request env overrides it.
        let mut env: HashMap<String, String> = inner
            .spec
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .chain(env)
            .collect();

        let username = resolve_username(&env);
        env.insert(
            tether_base::consts::kernel_env::USERNAME.to_string(),
            username.clone(),
        );
        inner.binding.username = username.clone();

        // Fail fast on authorization before anything is created.
        if let Err(source) = inner.config.authorize(&username, &inner.spec.display_name) {
            inner.binding.state = KernelState::Failed;
            return Err(Error::Policy { source });
        }
        inner.binding.state = inner.binding.state.advance(KernelState::Authorized)?;

        let launch_timeout = env
            .get(tether_base::consts::kernel_env::LAUNCH_TIMEOUT)
            .and_then(|raw| raw.parse::<f64>().ok())
            .map_or(inner.config.launch_timeout, Duration::from_secs_f64);

        spec::finalize_env(&mut env, &self.kernel_id, &inner.spec.language);

        let mut ctx = LaunchContext {
            kernel_id: self.kernel_id.clone(),
            username,
            kernel_name: inner.spec.display_name.clone(),
            argv: Vec::new(),
            env,
            config: inner.config.clone(),
        };

        if let Err(source) = inner.backend.prepare(&mut ctx).await {
            Self::abort_launch(inner, &ctx, None).await;
            return Err(Error::Backend { source });
        }

        let substitutions = HashMap::from([
            ("kernel_id", self.kernel_id.clone()),
            ("response_address", inner.response_manager.response_address()),
            ("public_key", inner.response_manager.public_key().to_string()),
            ("port_range", inner.config.port_range.to_string()),
        ]);
        ctx.argv = inner.spec.render_argv(&substitutions);

        let waiter = inner.response_manager.register(&self.kernel_id);

        inner.binding.state = inner.binding.state.advance(KernelState::Launching)?;
        inner.binding.launched_at = Some(SystemTime::now());

        if let Err(source) = inner.backend.spawn(&ctx).await {
            Self::abort_launch(inner, &ctx, Some(waiter)).await;
            return Err(Error::Backend { source });
        }
        inner.binding.state = inner.binding.state.advance(KernelState::AwaitingConnection)?;

        let connection_info =
            match self.await_connection(inner, &ctx, waiter, launch_timeout).await {
                Ok(info) => info,
                Err(err) => {
                    // Waiter was consumed or unregistered in await_connection.
                    Self::abort_launch(inner, &ctx, None).await;
                    return Err(err);
                }
            };

        let connection_info = match self.finish_launch(inner, &ctx, connection_info).await {
            Ok(info) => info,
            Err(err) => {
                Self::abort_launch(inner, &ctx, None).await;
                return Err(err);
            }
        };

        inner.context = Some(ctx);
        inner.binding.state = inner.binding.state.advance(KernelState::Running)?;
        tracing::info!(
            kernel_id = %self.kernel_id,
            "Kernel is running on host '{}'",
            inner.binding.assigned_host.as_deref().unwrap_or("<local>"),
        );
        Ok(connection_info)
    }

    /// Interleaves discovery probes with short waits on the response
    /// waiter until the payload arrives or the launch deadline passes.
    async fn await_connection(
        &self,
        inner: &mut Inner,
        ctx: &LaunchContext,
        mut waiter: ResponseWaiter,
        launch_timeout: Duration,
    ) -> Result<ConnectionInfo, Error> {
        let deadline = Instant::now() + launch_timeout;
        let mut iteration = 0u32;

        loop {
            iteration += 1;
            if self.cancel.is_cancelled() {
                inner.response_manager.unregister(&self.kernel_id);
                return Err(Error::Response {
                    source: response::Error::LaunchCancelled { kernel_id: self.kernel_id.clone() },
                });
            }
            if Instant::now() >= deadline {
                inner.response_manager.unregister(&self.kernel_id);
                tracing::error!(
                    kernel_id = %self.kernel_id,
                    "Waited too long ({launch_timeout:?}) to get connection info"
                );
                return Err(Error::Response {
                    source: response::Error::LaunchTimeout { kernel_id: self.kernel_id.clone() },
                });
            }

            match inner.backend.discover(ctx).await {
                Ok(Discovery::Located { host, ip }) => {
                    if inner.binding.assigned_host.is_none() {
                        tracing::debug!(
                            kernel_id = %self.kernel_id,
                            "Host assigned to the kernel is: '{host}' ({ip:?})"
                        );
                    }
                    inner.binding.assigned_host = Some(host);
                    if ip.is_some() {
                        inner.binding.assigned_ip = ip;
                    }
                    if inner.binding.state == KernelState::AwaitingConnection {
                        inner.binding.state =
                            inner.binding.state.advance(KernelState::Discovering)?;
                    }
                }
                Ok(Discovery::Pending) => {
                    tracing::debug!(
                        kernel_id = %self.kernel_id,
                        "{iteration}: Waiting to locate kernel resource"
                    );
                }
                Ok(Discovery::Failed { detail }) => {
                    inner.response_manager.unregister(&self.kernel_id);
                    return Err(Error::DiscoveryFailed { detail });
                }
                Err(source) => {
                    inner.response_manager.unregister(&self.kernel_id);
                    return Err(Error::Backend { source });
                }
            }

            if inner.binding.assigned_host.is_some() {
                match waiter.recv(inner.config.poll_interval).await {
                    Ok(info) => return Ok(info),
                    // Short-poll expiry; the outer deadline governs.
                    Err(response::Error::LaunchTimeout { .. }) => {}
                    Err(source) => {
                        inner.response_manager.unregister(&self.kernel_id);
                        return Err(Error::Response { source });
                    }
                }
            } else {
                tokio::time::sleep(inner.config.poll_interval).await;
            }
        }
    }

    /// Post-payload wiring: merge the discovered address, set up tunnels if
    /// enabled, and record communication/pid details on the binding.
    async fn finish_launch(
        &self,
        inner: &mut Inner,
        _ctx: &LaunchContext,
        mut connection_info: ConnectionInfo,
    ) -> Result<ConnectionInfo, Error> {
        // The launcher reports the address it sees from inside; the
        // discovered address is the one routable from the host.
        if let Some(assigned_ip) = &inner.binding.assigned_ip {
            connection_info.ip = assigned_ip.clone();
        }

        inner.binding.pid = connection_info.pid;
        inner.binding.pgid = connection_info.pgid;

        if inner.config.tunneling_enabled {
            let remote_host = inner
                .binding
                .assigned_ip
                .clone()
                .or_else(|| inner.binding.assigned_host.clone())
                .unwrap_or_else(|| connection_info.ip.clone());
            let (tunnels, localized) =
                TunnelSet::establish(&inner.config, &connection_info, &remote_host).await?;
            inner.binding.tunneled_connection_info = Some(connection_info);
            inner.tunnels = Some(tunnels);
            connection_info = localized;
        }

        match connection_info.communication_port {
            Some(port) => {
                let comm_ip: std::net::IpAddr = connection_info
                    .ip
                    .parse()
                    .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
                inner.binding.comm_address = Some(SocketAddr::new(comm_ip, port));
                tracing::debug!(
                    kernel_id = %self.kernel_id,
                    "Established communication to {}:{port}", connection_info.ip
                );
            }
            None => {
                tracing::debug!(
                    kernel_id = %self.kernel_id,
                    "Communication port has NOT been established (optional)"
                );
            }
        }

        inner.binding.connection_info = Some(connection_info.clone());
        inner.binding.backend_handle = inner.backend.backend_handle();
        Ok(connection_info)
    }

    /// Best-effort cleanup after a failed launch; the original failure is
    /// never masked by cleanup errors.
    async fn abort_launch(inner: &mut Inner, ctx: &LaunchContext, waiter: Option<ResponseWaiter>) {
        drop(waiter);
        inner.response_manager.unregister(&ctx.kernel_id);
        if let Err(err) = inner.backend.terminate_resources(ctx, false).await {
            tracing::warn!(
                kernel_id = %ctx.kernel_id,
                "Error occurred cleaning up after failed launch (ignored): {err}"
            );
        }
        inner.binding.state = KernelState::Failed;
    }

    /// Cheap liveness check; `Some(code)` once the kernel is provably gone.
    pub async fn poll(&self) -> Result<Option<i32>, Error> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        match inner.binding.state {
            KernelState::Running | KernelState::Terminating => {}
            KernelState::Terminated | KernelState::Failed => return Ok(Some(0)),
            // Still launching; nothing to report yet.
            _ => return Ok(None),
        }

        if let Some(ctx) = &inner.context
            && let Some(code) = inner.backend.status(ctx).await?
        {
            return Ok(Some(code));
        }

        if let Some(address) = inner.binding.comm_address {
            let client = CommClient::new(address, &self.kernel_id);
            if !client.send_signal(0).await? {
                return Ok(Some(0)); // nothing listening: process is gone
            }
        }
        Ok(None)
    }

    /// Delivers `signum` to the kernel, preferring the message-based
    /// communication channel and falling back to the backend's native path.
    pub async fn send_signal(&self, signum: i32) -> Result<(), Error> {
        if signum == 0 {
            let _probe = self.poll().await?;
            return Ok(());
        }
        if signum == SIGKILL {
            return self.kill().await;
        }

        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if let Some(address) = inner.binding.comm_address {
            let client = CommClient::new(address, &self.kernel_id);
            if client.send_signal(signum).await? {
                return Ok(());
            }
            tracing::debug!(
                kernel_id = %self.kernel_id,
                "No process listening on communication port, cannot deliver signal ({signum})"
            );
        }

        if let Some(ctx) = &inner.context {
            let handled = inner.backend.send_native_signal(ctx, signum).await?;
            if !handled {
                tracing::warn!(
                    kernel_id = %self.kernel_id,
                    "Signal ({signum}) could not be delivered by any available path"
                );
            }
        }
        Ok(())
    }

    /// Message-based interrupt.
    pub async fn interrupt(&self) -> Result<(), Error> { self.send_signal(SIGINT).await }

    /// Blocks until the kernel reports gone, bounded by the configured
    /// poll budget. Returns the exit indication if one was observed.
    pub async fn wait(&self) -> Result<Option<i32>, Error> {
        let (poll_interval, max_attempts) = {
            let inner = self.inner.lock().await;
            (inner.config.poll_interval, inner.config.max_poll_attempts)
        };
        for _attempt in 0..max_attempts {
            if let Some(code) = self.poll().await? {
                return Ok(Some(code));
            }
            tokio::time::sleep(poll_interval).await;
        }
        tracing::warn!(
            kernel_id = %self.kernel_id,
            "Wait timeout of {:?} exhausted. Continuing...",
            poll_interval * max_attempts
        );
        Ok(None)
    }

    /// Graceful shutdown: ask the launcher to exit, give the backend its
    /// grace window, then force-kill whatever is left.
    pub async fn shutdown(&self, restart: bool) -> Result<(), Error> {
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if inner.binding.state.is_terminal() {
            return Ok(());
        }
        inner.binding.state = inner.binding.state.advance(KernelState::Terminating)?;

        if let Some(address) = inner.binding.comm_address {
            let client = CommClient::new(address, &self.kernel_id);
            if let Err(err) = client.request_shutdown().await {
                tracing::warn!(
                    kernel_id = %self.kernel_id,
                    "An unexpected exception occurred sending listener shutdown: {err}"
                );
            }
        }

        // Grace window: poll for the process to exit on its own.
        let grace = inner
            .backend
            .shutdown_wait_time(tether_base::consts::defaults::SHUTDOWN_WAIT_TIME);
        let deadline = Instant::now() + grace;
        let mut gone = false;
        while Instant::now() < deadline {
            let alive = match (&inner.context, inner.binding.comm_address) {
                (Some(ctx), _) => inner.backend.status(ctx).await?.is_none(),
                (None, Some(address)) => {
                    CommClient::new(address, &self.kernel_id).send_signal(0).await?
                }
                (None, None) => false,
            };
            if !alive {
                gone = true;
                break;
            }
            tokio::time::sleep(inner.config.poll_interval).await;
        }
        if !gone {
            tracing::warn!(
                kernel_id = %self.kernel_id,
                "Kernel did not exit within the {grace:?} grace period; killing"
            );
        }

        Self::teardown(inner, restart).await;
        inner.binding.state = inner.binding.state.advance(KernelState::Terminated)?;
        Ok(())
    }

    /// Graceful termination (no restart).
    pub async fn terminate(&self) -> Result<(), Error> { self.shutdown(false).await }

    /// Forceful termination: removes the backend resource unconditionally.
    pub async fn kill(&self) -> Result<(), Error> {
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if inner.binding.state.is_terminal() {
            return Ok(());
        }
        inner.binding.state = inner.binding.state.advance(KernelState::Terminating)?;

        if let Some(ctx) = &inner.context {
            let _handled = inner.backend.send_native_signal(ctx, SIGKILL).await;
        }
        Self::teardown(inner, false).await;
        inner.binding.state = inner.binding.state.advance(KernelState::Terminated)?;
        Ok(())
    }

    async fn teardown(inner: &mut Inner, restart: bool) {
        if let Some(tunnels) = inner.tunnels.take() {
            tracing::debug!("Closing SSH tunnels");
            tunnels.close().await;
        }
        if let Some(ctx) = inner.context.clone() {
            if let Err(err) = inner.backend.terminate_resources(&ctx, restart).await {
                tracing::warn!("Error occurred during backend cleanup (ignored): {err}");
            }
        }
        inner.binding.assigned_host = None;
        inner.binding.assigned_ip = None;
        inner.binding.comm_address = None;
    }

    /// Captures the binding for session persistence.
    pub async fn get_provisioner_info(&self) -> Map<String, Value> {
        self.inner.lock().await.binding.provisioner_info()
    }

    /// Rehydrates the binding from persisted information.
    pub async fn load_provisioner_info(&self, info: &Map<String, Value>) {
        self.inner.lock().await.binding.load_provisioner_info(info);
    }

    /// The grace period the host should allow for shutdown.
    pub async fn get_shutdown_wait_time(&self, recommended: Duration) -> Duration {
        self.inner.lock().await.backend.shutdown_wait_time(recommended)
    }

    /// Whether this supervisor currently governs a live (or launching)
    /// kernel process.
    pub async fn has_process(&self) -> bool {
        !matches!(
            self.inner.lock().await.binding.state,
            KernelState::Pending | KernelState::Terminated | KernelState::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        LazyLock,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::{io::AsyncWriteExt, net::TcpStream};

    use super::*;
    use crate::{
        backend,
        crypto::{Keypair, encrypt_payload},
        response::ResponseSettings,
    };

    static KEYPAIR: LazyLock<Arc<Keypair>> =
        LazyLock::new(|| Arc::new(Keypair::generate().expect("keypair generation")));

    /// A backend that "launches" a kernel by spawning a task which posts an
    /// encrypted payload back at the response address, exactly like a real
    /// kernel launcher would.
    struct MockBackend {
        spawned: Arc<AtomicUsize>,
        cleaned: Arc<AtomicUsize>,
        post_payload: bool,
    }

    impl MockBackend {
        fn new(post_payload: bool) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let spawned = Arc::new(AtomicUsize::new(0));
            let cleaned = Arc::new(AtomicUsize::new(0));
            (
                Self { spawned: Arc::clone(&spawned), cleaned: Arc::clone(&cleaned), post_payload },
                spawned,
                cleaned,
            )
        }

        fn argv_value(argv: &[String], flag: &str) -> String {
            argv.iter()
                .position(|arg| arg == flag)
                .and_then(|index| argv.get(index + 1))
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn name(&self) -> &'static str { "mock" }

        async fn spawn(&mut self, ctx: &LaunchContext) -> Result<(), backend::Error> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            if !self.post_payload {
                return Ok(());
            }

            let response_address = Self::argv_value(&ctx.argv, "--response-address");
            let public_key = Self::argv_value(&ctx.argv, "--public-key");
            let kernel_id = ctx.kernel_id.clone();

            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let plaintext = serde_json::to_vec(&json!({
                    "kernel_id": kernel_id,
                    "ip": "10.9.8.7",
                    "shell_port": 50001,
                    "iopub_port": 50002,
                    "stdin_port": 50003,
                    "control_port": 50004,
                    "hb_port": 50005,
                    "signature_key": "s3cret",
                    "signature_scheme": "hmac-sha256",
                    "pid": 4242
                }))
                .unwrap();
                let blob = encrypt_payload(&plaintext, &public_key).unwrap();
                let mut stream = TcpStream::connect(&response_address).await.unwrap();
                stream.write_all(blob.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            });
            Ok(())
        }

        async fn discover(&mut self, _ctx: &LaunchContext) -> Result<Discovery, backend::Error> {
            Ok(Discovery::Located {
                host: "mock-host".to_string(),
                ip: Some("172.16.0.9".to_string()),
            })
        }

        async fn status(&mut self, _ctx: &LaunchContext) -> Result<Option<i32>, backend::Error> {
            Ok(None)
        }

        async fn send_native_signal(
            &mut self,
            _ctx: &LaunchContext,
            _signum: i32,
        ) -> Result<bool, backend::Error> {
            Ok(true)
        }

        async fn terminate_resources(
            &mut self,
            _ctx: &LaunchContext,
            _restart: bool,
        ) -> Result<(), backend::Error> {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn backend_handle(&self) -> Option<String> { Some("mock-handle".to_string()) }

        fn shutdown_wait_time(&self, _recommended: Duration) -> Duration {
            Duration::from_millis(100)
        }
    }

    fn test_spec() -> KernelSpec {
        serde_json::from_value(json!({
            "display_name": "Mock Kernel",
            "language": "python",
            "argv": [
                "launcher",
                "--kernel-id", "{kernel_id}",
                "--response-address", "{response_address}",
                "--public-key", "{public_key}",
                "--port-range", "{port_range}"
            ],
            "env": {"SPEC_PROVIDED": "yes"}
        }))
        .unwrap()
    }

    async fn test_response_manager() -> Arc<ResponseManager> {
        let settings = ResponseSettings {
            ip: Some(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
            preferred_port: 0,
            ..ResponseSettings::default()
        };
        Arc::new(ResponseManager::with_settings(settings, Arc::clone(&KEYPAIR)).await.unwrap())
    }

    fn supervisor_with(
        backend: MockBackend,
        config: ProvisionerConfig,
        manager: Arc<ResponseManager>,
    ) -> KernelSupervisor {
        KernelSupervisor::new(
            "11111111-2222-3333-4444-555555555555".to_string(),
            test_spec(),
            config,
            Box::new(backend),
            manager,
        )
    }

    #[tokio::test]
    async fn happy_path_reaches_running_with_merged_address() {
        let manager = test_response_manager().await;
        let (backend, spawned, cleaned) = MockBackend::new(true);
        let supervisor = supervisor_with(backend, ProvisionerConfig::default(), manager);

        let env = HashMap::from([("KERNEL_USERNAME".to_string(), "alice".to_string())]);
        let info = supervisor.start(env).await.unwrap();

        // The discovered address replaces the launcher-reported one.
        assert_eq!(info.ip, "172.16.0.9");
        assert_eq!(info.shell_port, 50001);
        assert_eq!(supervisor.state().await, KernelState::Running);
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);

        // No communication port was reported: poll falls back to adapter
        // status, which says alive.
        assert_eq!(supervisor.poll().await.unwrap(), None);

        let persisted = supervisor.get_provisioner_info().await;
        assert_eq!(persisted.get("pid"), Some(&json!(4242)));
        assert_eq!(persisted.get("assigned_host"), Some(&json!("mock-host")));

        supervisor.shutdown(false).await.unwrap();
        assert_eq!(supervisor.state().await, KernelState::Terminated);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.poll().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn unauthorized_user_is_denied_before_spawn() {
        let manager = test_response_manager().await;
        let (backend, spawned, _cleaned) = MockBackend::new(true);
        let supervisor = supervisor_with(backend, ProvisionerConfig::default(), manager);

        let env = HashMap::from([("KERNEL_USERNAME".to_string(), "root".to_string())]);
        let err = supervisor.start(env).await.unwrap_err();

        match err {
            Error::Policy { source } => {
                let message = source.to_string();
                assert!(message.contains("User 'root' is not authorized"));
                assert!(message.contains("Mock Kernel"));
            }
            other => panic!("expected policy denial, got {other:?}"),
        }
        assert_eq!(spawned.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.state().await, KernelState::Failed);
    }

    #[tokio::test]
    async fn silent_launcher_times_out_and_cleans_up_once() {
        let manager = test_response_manager().await;
        let (backend, spawned, cleaned) = MockBackend::new(false);
        let config = ProvisionerConfig {
            launch_timeout: Duration::from_millis(600),
            poll_interval: Duration::from_millis(50),
            ..ProvisionerConfig::default()
        };
        let supervisor = supervisor_with(backend, config, manager);

        let started = Instant::now();
        let err = supervisor.start(HashMap::new()).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err,
            Error::Response { source: response::Error::LaunchTimeout { .. } }
        ));
        assert!(elapsed >= Duration::from_millis(500), "timed out too early: {elapsed:?}");
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1, "cleanup must run exactly once");
        assert_eq!(supervisor.state().await, KernelState::Failed);
    }

    #[tokio::test]
    async fn spec_env_flows_into_launch_but_request_env_wins() {
        let manager = test_response_manager().await;
        let (backend, _spawned, _cleaned) = MockBackend::new(true);
        let supervisor = supervisor_with(backend, ProvisionerConfig::default(), manager);

        let env = HashMap::from([
            ("KERNEL_USERNAME".to_string(), "alice".to_string()),
            ("SPEC_PROVIDED".to_string(), "overridden".to_string()),
        ]);
        supervisor.start(env).await.unwrap();
        assert_eq!(supervisor.state().await, KernelState::Running);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_after_failure() {
        let manager = test_response_manager().await;
        let (backend, _spawned, cleaned) = MockBackend::new(false);
        let config = ProvisionerConfig {
            launch_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            ..ProvisionerConfig::default()
        };
        let supervisor = supervisor_with(backend, config, manager);

        let _err = supervisor.start(HashMap::new()).await.unwrap_err();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);

        // A terminal binding shrugs off further shutdown requests.
        supervisor.shutdown(false).await.unwrap();
        supervisor.kill().await.unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }
}
