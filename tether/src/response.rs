//! The response manager: a single process-wide TCP listener that receives
//! encrypted connection payloads from concurrently launching kernels and
//! routes each to the provisioner awaiting it.
//!
//! Each kernel launcher opens one short-lived connection, writes one base64
//! blob, and closes its end. Handlers decrypt with the process private key
//! and route by the `kernel_id` embedded in the (authenticated) plaintext;
//! nothing in the outer framing identifies the sender. A payload whose
//! kernel id has no registered waiter is dropped with a warning.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    sync::{Arc, Mutex},
    time::Duration,
};

use regex::Regex;
use snafu::{ResultExt, Snafu};
use tether_base::consts::{defaults, gp_env};
use tokio::{io::AsyncReadExt, net::TcpListener, sync::oneshot, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{crypto::Keypair, provisioner::ConnectionInfo};

/// Knobs governing where the response listener binds and what address is
/// advertised to launchers.
#[derive(Clone, Debug)]
pub struct ResponseSettings {
    /// Explicit address to advertise; `None` auto-detects.
    pub ip: Option<IpAddr>,
    /// Preferred listener port; `0` lets the OS choose.
    pub preferred_port: u16,
    /// How many increments past the preferred port to try.
    pub port_retries: u32,
    /// Bind all interfaces instead of the advertised address.
    pub bind_any: bool,
    /// Regular expressions matching local IPs that must not be advertised.
    pub prohibited_local_ips: Vec<String>,
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            ip: None,
            preferred_port: defaults::RESPONSE_PORT,
            port_retries: defaults::RESPONSE_PORT_RETRIES,
            bind_any: false,
            prohibited_local_ips: Vec::new(),
        }
    }
}

impl ResponseSettings {
    pub fn from_env() -> Result<Self, Error> {
        let mut settings = Self::default();
        if let Ok(raw) = std::env::var(gp_env::RESPONSE_IP)
            && !raw.is_empty()
        {
            settings.ip =
                Some(raw.parse().map_err(|_| Error::InvalidResponseIp { value: raw })?);
        }
        if let Ok(raw) = std::env::var(gp_env::RESPONSE_PORT)
            && let Ok(port) = raw.parse()
        {
            settings.preferred_port = port;
        }
        if let Ok(raw) = std::env::var(gp_env::RESPONSE_PORT_RETRIES)
            && let Ok(retries) = raw.parse()
        {
            settings.port_retries = retries;
        }
        settings.bind_any = std::env::var(gp_env::RESPONSE_ADDR_ANY)
            .map(|raw| raw.to_lowercase() == "true")
            .unwrap_or(false);
        if let Ok(raw) = std::env::var(gp_env::PROHIBITED_LOCAL_IPS)
            && !raw.is_empty()
        {
            settings.prohibited_local_ips = raw.split(',').map(str::to_string).collect();
        }
        Ok(settings)
    }
}

/// A single-shot rendezvous for one kernel's connection information.
pub struct ResponseWaiter {
    kernel_id: String,
    receiver: oneshot::Receiver<ConnectionInfo>,
}

impl ResponseWaiter {
    /// Waits until the payload arrives, the deadline elapses, or the waiter
    /// is cancelled (unregistered or manager shut down).
    pub async fn wait(mut self, timeout: Duration) -> Result<ConnectionInfo, Error> {
        self.recv(timeout).await
    }

    /// Like [`Self::wait`] but resumable: a timeout leaves the waiter armed
    /// so callers can interleave waiting with discovery polls.
    pub async fn recv(&mut self, timeout: Duration) -> Result<ConnectionInfo, Error> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => LaunchCancelledSnafu { kernel_id: self.kernel_id.clone() }.fail(),
            Err(_) => LaunchTimeoutSnafu { kernel_id: self.kernel_id.clone() }.fail(),
        }
    }

    #[must_use]
    pub fn kernel_id(&self) -> &str { &self.kernel_id }
}

type WaiterRegistry = Arc<Mutex<HashMap<String, oneshot::Sender<ConnectionInfo>>>>;

/// The process-wide response listener.
pub struct ResponseManager {
    keypair: Arc<Keypair>,
    advertised: SocketAddr,
    registry: WaiterRegistry,
    cancel: CancellationToken,
}

impl ResponseManager {
    /// Binds the listener per the environment and starts serving.
    pub async fn start(keypair: Arc<Keypair>) -> Result<Self, Error> {
        Self::with_settings(ResponseSettings::from_env()?, keypair).await
    }

    /// Binds the listener per explicit settings and starts serving. Tests
    /// run isolated instances this way.
    pub async fn with_settings(
        settings: ResponseSettings,
        keypair: Arc<Keypair>,
    ) -> Result<Self, Error> {
        let prohibited = compile_patterns(&settings.prohibited_local_ips)?;
        let advertised_ip = settings.ip.unwrap_or_else(|| detect_local_ip(&prohibited));
        let bind_ip =
            if settings.bind_any { IpAddr::V4(Ipv4Addr::UNSPECIFIED) } else { advertised_ip };

        let listener = bind_with_retries(bind_ip, settings.preferred_port, settings.port_retries)
            .await?;
        let port = listener.local_addr().context(ListenerAddressSnafu)?.port();
        tracing::info!("Response manager is bound to port {port} for kernel connection information");

        let manager = Self {
            keypair,
            advertised: SocketAddr::new(advertised_ip, port),
            registry: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        };
        manager.serve(listener);
        Ok(manager)
    }

    /// The `ip:port` launchers are told to respond to.
    #[must_use]
    pub fn response_address(&self) -> String { self.advertised.to_string() }

    /// The public key launchers encrypt their AES key under.
    #[must_use]
    pub fn public_key(&self) -> &str { self.keypair.public_key() }

    /// Registers a waiter for `kernel_id`.
    ///
    /// # Panics
    ///
    /// Panics if a waiter is already registered for this kernel id: one
    /// binding exists per kernel, so a duplicate registration is a logic
    /// error in the caller.
    #[must_use]
    pub fn register(&self, kernel_id: &str) -> ResponseWaiter {
        let (sender, receiver) = oneshot::channel();
        let mut registry = self.registry.lock().expect("waiter registry poisoned");
        assert!(
            !registry.contains_key(kernel_id),
            "waiter already registered for kernel '{kernel_id}'"
        );
        registry.insert(kernel_id.to_string(), sender);
        ResponseWaiter { kernel_id: kernel_id.to_string(), receiver }
    }

    /// Removes the waiter for `kernel_id`, cancelling it. Idempotent.
    pub fn unregister(&self, kernel_id: &str) {
        let _dropped = self.registry.lock().expect("waiter registry poisoned").remove(kernel_id);
    }

    /// Stops the accept loop. In-flight handler tasks finish on their own.
    pub fn shutdown(&self) { self.cancel.cancel(); }

    fn serve(&self, listener: TcpListener) {
        let registry = Arc::clone(&self.registry);
        let keypair = Arc::clone(&self.keypair);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut handlers = JoinSet::new();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,

                    connection = listener.accept() => {
                        let (stream, peer) = match connection {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                tracing::error!("Failed to accept response connection: {err}");
                                continue;
                            }
                        };
                        let registry = Arc::clone(&registry);
                        let keypair = Arc::clone(&keypair);
                        handlers.spawn(async move {
                            handle_connection(stream, peer, &registry, &keypair).await;
                        });
                    }

                    // Reap finished handlers so the set doesn't grow unbounded.
                    Some(result) = handlers.join_next(), if !handlers.is_empty() => {
                        if let Err(err) = result {
                            tracing::error!("Response handler task failed: {err}");
                        }
                    }
                }
            }
            handlers.shutdown().await;
        });
    }
}

impl Drop for ResponseManager {
    fn drop(&mut self) { self.cancel.cancel(); }
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
    registry: &WaiterRegistry,
    keypair: &Keypair,
) {
    let mut data = String::new();
    if let Err(err) = stream.read_to_string(&mut data).await {
        tracing::error!("Failure occurred reading response payload from {peer}: {err}");
        return;
    }

    let plaintext = match keypair.decrypt_payload(&data) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            tracing::error!("Failure occurred processing connection from {peer}: {err}");
            return;
        }
    };

    let info: ConnectionInfo = match serde_json::from_slice(&plaintext) {
        Ok(info) => info,
        Err(err) => {
            tracing::error!("Decrypted payload from {peer} is not valid connection info: {err}");
            return;
        }
    };

    let waiter = registry.lock().expect("waiter registry poisoned").remove(&info.kernel_id);
    match waiter {
        Some(sender) => {
            tracing::debug!(kernel_id = %info.kernel_id, "Connection info received");
            if sender.send(info).is_err() {
                tracing::warn!("Waiter hung up before connection info could be delivered");
            }
        }
        None => {
            tracing::warn!(
                kernel_id = %info.kernel_id,
                "Kernel id has not been registered and will not be processed"
            );
        }
    }
}

async fn bind_with_retries(
    ip: IpAddr,
    preferred_port: u16,
    retries: u32,
) -> Result<TcpListener, Error> {
    let attempts = if preferred_port == 0 { 1 } else { retries.saturating_add(1) };
    for offset in 0..attempts {
        let port = preferred_port.saturating_add(offset as u16);
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::info!("Response port {port} is already in use, trying another port...");
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::warn!("Permission to bind to response port {port} denied - continuing...");
            }
            Err(source) => return Err(Error::BindListener { address: SocketAddr::new(ip, port), source }),
        }
    }
    ResponsePortUnavailableSnafu { port: preferred_port, attempts }.fail()
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .context(InvalidProhibitedIpPatternSnafu { pattern: pattern.as_str() })
        })
        .collect()
}

/// Best local IPv4 to advertise to launchers, honoring the prohibited
/// patterns. Interface selection rides on a routed-but-unsent UDP connect;
/// when every candidate is prohibited the first one is used regardless, as
/// refusing to listen at all would be worse.
fn detect_local_ip(prohibited: &[Regex]) -> IpAddr {
    let candidates = probe_local_ips();
    for ip in &candidates {
        let rendered = ip.to_string();
        if !prohibited.iter().any(|pattern| pattern.is_match(&rendered)) {
            return *ip;
        }
    }
    candidates.first().copied().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn probe_local_ips() -> Vec<IpAddr> {
    let mut candidates = Vec::new();
    for anchor in ["8.8.8.8:53", "10.255.255.255:1"] {
        if let Ok(socket) = UdpSocket::bind("0.0.0.0:0")
            && socket.connect(anchor).is_ok()
            && let Ok(address) = socket.local_addr()
            && !candidates.contains(&address.ip())
        {
            candidates.push(address.ip());
        }
    }
    candidates
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "No available response port could be found after {attempts} attempts starting at {port}"
    ))]
    ResponsePortUnavailable { port: u16, attempts: u32 },

    #[snafu(display("Failed to bind response listener to {address}, error: {source}"))]
    BindListener { address: SocketAddr, source: std::io::Error },

    #[snafu(display("Failed to read response listener address, error: {source}"))]
    ListenerAddress { source: std::io::Error },

    #[snafu(display("GP_RESPONSE_IP holds an unparsable address '{value}'"))]
    InvalidResponseIp { value: String },

    #[snafu(display("Invalid prohibited-IP pattern '{pattern}', error: {source}"))]
    InvalidProhibitedIpPattern { pattern: String, source: regex::Error },

    #[snafu(display("Waited too long to get connection info for kernel '{kernel_id}'"))]
    LaunchTimeout { kernel_id: String },

    #[snafu(display("Launch of kernel '{kernel_id}' was cancelled while awaiting connection info"))]
    LaunchCancelled { kernel_id: String },
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use tokio::{io::AsyncWriteExt, net::TcpStream};

    use super::*;
    use crate::crypto::encrypt_payload;

    static KEYPAIR: LazyLock<Arc<Keypair>> =
        LazyLock::new(|| Arc::new(Keypair::generate().expect("keypair generation")));

    fn loopback_settings() -> ResponseSettings {
        ResponseSettings {
            ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            preferred_port: 0,
            ..ResponseSettings::default()
        }
    }

    fn conn_info_json(kernel_id: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "kernel_id": kernel_id,
            "ip": "127.0.0.1",
            "shell_port": 50001,
            "iopub_port": 50002,
            "stdin_port": 50003,
            "control_port": 50004,
            "hb_port": 50005,
            "signature_key": "s3cret",
            "signature_scheme": "hmac-sha256",
            "communication_port": 50006
        }))
        .unwrap()
    }

    async fn post_payload(manager: &ResponseManager, plaintext: &[u8]) {
        let blob = encrypt_payload(plaintext, manager.public_key()).unwrap();
        let mut stream = TcpStream::connect(manager.advertised).await.unwrap();
        stream.write_all(blob.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn routes_payload_to_registered_waiter() {
        let manager =
            ResponseManager::with_settings(loopback_settings(), Arc::clone(&KEYPAIR)).await.unwrap();

        let waiter = manager.register("k-routing");
        post_payload(&manager, &conn_info_json("k-routing")).await;

        let info = waiter.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.kernel_id, "k-routing");
        assert_eq!(info.shell_port, 50001);
        assert_eq!(info.communication_port, Some(50006));
    }

    #[tokio::test]
    async fn delivers_to_the_matching_waiter_only() {
        let manager =
            ResponseManager::with_settings(loopback_settings(), Arc::clone(&KEYPAIR)).await.unwrap();

        let mut waiter_a = manager.register("k-a");
        let waiter_b = manager.register("k-b");

        post_payload(&manager, &conn_info_json("k-b")).await;

        // B resolves even though A registered first and is still blocked.
        let info = waiter_b.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.kernel_id, "k-b");

        let err = waiter_a.recv(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, Error::LaunchTimeout { .. }));
        manager.unregister("k-a");
    }

    #[tokio::test]
    async fn orphan_payload_is_dropped_without_disturbing_others() {
        let manager =
            ResponseManager::with_settings(loopback_settings(), Arc::clone(&KEYPAIR)).await.unwrap();

        post_payload(&manager, &conn_info_json("never-registered")).await;

        let waiter = manager.register("k-after-orphan");
        post_payload(&manager, &conn_info_json("k-after-orphan")).await;
        let info = waiter.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.kernel_id, "k-after-orphan");
    }

    #[tokio::test]
    async fn undecryptable_payload_is_logged_and_dropped() {
        let manager =
            ResponseManager::with_settings(loopback_settings(), Arc::clone(&KEYPAIR)).await.unwrap();

        let mut waiter = manager.register("k-x");
        let mut stream = TcpStream::connect(manager.advertised).await.unwrap();
        stream.write_all(b"this is not base64 at all").await.unwrap();
        stream.shutdown().await.unwrap();

        let err = waiter.recv(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, Error::LaunchTimeout { .. }));
    }

    #[tokio::test]
    async fn unregister_cancels_the_waiter() {
        let manager =
            ResponseManager::with_settings(loopback_settings(), Arc::clone(&KEYPAIR)).await.unwrap();

        let waiter = manager.register("k-cancelled");
        manager.unregister("k-cancelled");

        let err = waiter.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::LaunchCancelled { .. }));

        // Idempotent.
        manager.unregister("k-cancelled");
    }

    #[tokio::test]
    #[should_panic(expected = "waiter already registered")]
    async fn duplicate_registration_panics() {
        let manager =
            ResponseManager::with_settings(loopback_settings(), Arc::clone(&KEYPAIR)).await.unwrap();
        let _first = manager.register("k-dup");
        let _second = manager.register("k-dup");
    }

    #[tokio::test]
    async fn occupied_port_with_no_retries_fails() {
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let taken = holder.local_addr().unwrap().port();

        let settings = ResponseSettings {
            ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            preferred_port: taken,
            port_retries: 0,
            ..ResponseSettings::default()
        };
        let err = ResponseManager::with_settings(settings, Arc::clone(&KEYPAIR)).await.unwrap_err();
        assert!(matches!(err, Error::ResponsePortUnavailable { .. }));
    }
}
