//! SSH tunneling of kernel traffic.
//!
//! When tunneling is enabled, each of the five ZMQ ports plus the
//! communication port is carried over a local listener bridged to the
//! remote port through a `direct-tcpip` channel. The host then talks to
//! `127.0.0.1` exclusively; the original connection info is preserved on
//! the binding for diagnostics and persistence.

use std::{fmt, net::Ipv4Addr, pin::pin, sync::Arc};

use futures::future::{self, Either};
use snafu::{ResultExt, Snafu};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ProvisionerConfig,
    ports,
    provisioner::ConnectionInfo,
    ssh::{self, Session, SshSettings},
};

/// The six channels a kernel exposes. Five are ZMQ; the communication
/// channel is the launcher's plain-TCP side channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelChannel {
    Shell,
    IoPub,
    Stdin,
    Heartbeat,
    Control,
    Communication,
}

impl fmt::Display for KernelChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Shell => "SHELL",
            Self::IoPub => "IOPUB",
            Self::Stdin => "STDIN",
            Self::Heartbeat => "HB",
            Self::Control => "CONTROL",
            Self::Communication => "COMM",
        };
        f.write_str(name)
    }
}

struct Tunnel {
    channel: KernelChannel,
    local_port: u16,
    task: JoinHandle<()>,
}

/// All tunnels established for one kernel binding.
pub struct TunnelSet {
    session: Arc<Session>,
    tunnels: Vec<Tunnel>,
    cancel: CancellationToken,
}

impl TunnelSet {
    /// Establishes tunnels for every port in `connection_info` toward
    /// `remote_host`, returning the set plus the localized connection info
    /// the host should use instead.
    pub async fn establish(
        config: &ProvisionerConfig,
        connection_info: &ConnectionInfo,
        remote_host: &str,
    ) -> Result<(Self, ConnectionInfo), Error> {
        let settings = SshSettings {
            host: remote_host.to_string(),
            port: config.ssh_port,
            user: config
                .remote_user
                .clone()
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "root".to_string()),
            password: config.remote_pwd.clone(),
            private_key_path: config.ssh_private_key_file_path.clone(),
            strict_host_key_checking: true,
        };
        let session = Arc::new(Session::connect(&settings).await.map_err(|err| match err {
            ssh::Error::UnknownHostKey { host, port } => Error::TunnelHostUnknown { host, port },
            source => Error::Ssh { source },
        })?);

        let remote_ip = connection_info.ip.clone();
        let mut plan: Vec<(KernelChannel, u16)> = [
            KernelChannel::Shell,
            KernelChannel::IoPub,
            KernelChannel::Stdin,
            KernelChannel::Heartbeat,
            KernelChannel::Control,
        ]
        .into_iter()
        .zip(connection_info.zmq_ports())
        .collect();
        if let Some(comm_port) = connection_info.communication_port {
            plan.push((KernelChannel::Communication, comm_port));
        }

        let local_ports =
            ports::allocate_with_retries(plan.len(), config.port_range, config.max_port_range_retries)
                .context(AllocateLocalPortsSnafu)?;

        let cancel = CancellationToken::new();
        let mut tunnels = Vec::with_capacity(plan.len());
        for ((channel, remote_port), local_port) in plan.into_iter().zip(local_ports) {
            let task = Self::bridge(
                Arc::clone(&session),
                cancel.clone(),
                channel,
                local_port,
                remote_ip.clone(),
                remote_port,
            )
            .await?;
            tracing::debug!(
                "Creating SSH tunnel for '{channel}': 127.0.0.1:{local_port} to \
                 '{remote_ip}':{remote_port}"
            );
            tunnels.push(Tunnel { channel, local_port, task });
        }

        let set = Self { session, tunnels, cancel };
        let localized = set.localize(connection_info);
        Ok((set, localized))
    }

    /// Rewrites `connection_info` so every port points at its local tunnel
    /// endpoint.
    fn localize(&self, connection_info: &ConnectionInfo) -> ConnectionInfo {
        let mut localized = connection_info.clone();
        localized.ip = Ipv4Addr::LOCALHOST.to_string();
        for tunnel in &self.tunnels {
            match tunnel.channel {
                KernelChannel::Shell => localized.shell_port = tunnel.local_port,
                KernelChannel::IoPub => localized.iopub_port = tunnel.local_port,
                KernelChannel::Stdin => localized.stdin_port = tunnel.local_port,
                KernelChannel::Heartbeat => localized.hb_port = tunnel.local_port,
                KernelChannel::Control => localized.control_port = tunnel.local_port,
                KernelChannel::Communication => {
                    localized.communication_port = Some(tunnel.local_port);
                }
            }
        }
        localized
    }

    async fn bridge(
        session: Arc<Session>,
        cancel: CancellationToken,
        channel: KernelChannel,
        local_port: u16,
        remote_ip: String,
        remote_port: u16,
    ) -> Result<JoinHandle<()>, Error> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port))
            .await
            .context(BindListenerSnafu { channel, local_port })?;

        Ok(tokio::spawn(async move {
            loop {
                let (mut local_stream, peer) = tokio::select! {
                    () = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!("Tunnel '{channel}' accept failed: {err}");
                            break;
                        }
                    },
                };

                let direct = session
                    .open_direct_tcpip(&remote_ip, remote_port, ("127.0.0.1", peer.port()))
                    .await;
                let channel_stream = match direct {
                    Ok(ssh_channel) => ssh_channel.into_stream(),
                    Err(err) => {
                        tracing::warn!("Tunnel '{channel}' could not reach remote port: {err}");
                        continue;
                    }
                };

                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut channel_stream = channel_stream;
                    let copy_fut =
                        tokio::io::copy_bidirectional(&mut local_stream, &mut channel_stream);
                    // If the binding terminates, we stop copying.
                    match future::select(pin!(cancel.cancelled()), pin!(copy_fut)).await {
                        Either::Left(_) => {
                            tracing::debug!("Closing tunnel stream due to shutdown");
                        }
                        Either::Right((Err(err), _)) => tracing::debug!("Tunnel stream error: {err}"),
                        Either::Right((Ok(_), _)) => {}
                    }
                });
            }
        }))
    }

    /// The local port carrying `channel`, when tunneled.
    #[must_use]
    pub fn local_port(&self, channel: KernelChannel) -> Option<u16> {
        self.tunnels.iter().find(|tunnel| tunnel.channel == channel).map(|tunnel| tunnel.local_port)
    }

    /// Tears every tunnel down and closes the SSH session.
    pub async fn close(self) {
        self.cancel.cancel();
        for tunnel in &self.tunnels {
            tunnel.task.abort();
        }
        if let Ok(session) = Arc::try_unwrap(self.session) {
            let _closed = session.close().await;
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Strict host-key validation rejected the tunnel target.
    #[snafu(display("Host key verification failed for tunnel target {host}:{port}"))]
    TunnelHostUnknown { host: String, port: u16 },

    #[snafu(display("{source}"))]
    Ssh { source: crate::ssh::Error },

    #[snafu(display("Failed to allocate local tunnel ports, error: {source}"))]
    AllocateLocalPorts { source: crate::ports::Error },

    #[snafu(display("Failed to bind tunnel listener for '{channel}' on port {local_port}, error: {source}"))]
    BindListener { channel: KernelChannel, local_port: u16, source: std::io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_match_wire_conventions() {
        assert_eq!(KernelChannel::Shell.to_string(), "SHELL");
        assert_eq!(KernelChannel::Heartbeat.to_string(), "HB");
        assert_eq!(KernelChannel::Communication.to_string(), "COMM");
    }
}
