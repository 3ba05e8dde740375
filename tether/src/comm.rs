//! Client side of the kernel-launcher communication port.
//!
//! Once a launcher reports a `communication_port`, the engine can reach it
//! with small line-delimited JSON requests: `{"signum": N}` raises signal N
//! inside the kernel's process group (0 being a pure liveness probe), and
//! `{"shutdown": 1}` instructs the launcher to close its listener and exit.

use std::net::SocketAddr;

use snafu::{ResultExt, Snafu};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};
use tether_base::consts::defaults;

/// A handle on one kernel's communication port.
#[derive(Clone, Debug)]
pub struct CommClient {
    address: SocketAddr,
    kernel_id: String,
}

impl CommClient {
    #[must_use]
    pub fn new(address: SocketAddr, kernel_id: impl Into<String>) -> Self {
        Self { address, kernel_id: kernel_id.into() }
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr { self.address }

    /// Sends `{"signum": N}`. Returns `Ok(true)` when the request was
    /// delivered, `Ok(false)` when nothing is listening anymore (the kernel
    /// process is gone).
    pub async fn send_signal(&self, signum: i32) -> Result<bool, Error> {
        let request = serde_json::json!({ "signum": signum });
        match self.send(&request, false).await {
            Ok(()) => {
                if signum > 0 {
                    // Liveness probes (signum == 0) are too frequent to log.
                    tracing::debug!(
                        kernel_id = %self.kernel_id,
                        "Signal ({signum}) sent via communication port"
                    );
                }
                Ok(true)
            }
            Err(err) if err.is_connection_refused() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Sends `{"shutdown": 1}` and half-closes the socket so the launcher
    /// observes EOF. Connection-refused is tolerated: the listener may have
    /// exited already.
    pub async fn request_shutdown(&self) -> Result<(), Error> {
        let request = serde_json::json!({ "shutdown": 1 });
        match self.send(&request, true).await {
            Ok(()) => {
                tracing::debug!(
                    kernel_id = %self.kernel_id,
                    "Shutdown request sent to listener via communication port"
                );
                Ok(())
            }
            Err(err) if err.is_connection_refused() => {
                tracing::debug!(
                    kernel_id = %self.kernel_id,
                    "Communication port refused shutdown request, listener likely terminated"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn send(&self, request: &serde_json::Value, shutdown_socket: bool) -> Result<(), Error> {
        let mut stream = timeout(defaults::SOCKET_TIMEOUT, TcpStream::connect(self.address))
            .await
            .map_err(|_| Error::ConnectTimeout { address: self.address })?
            .context(ConnectSnafu { address: self.address })?;

        let mut line = request.to_string();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.context(SendRequestSnafu { address: self.address })?;

        if shutdown_socket {
            // ENOTCONN here usually follows the listener's own exit; callers
            // treat it as benign.
            let _unused = stream.shutdown().await;
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to connect to communication port {address}, error: {source}"))]
    Connect { address: SocketAddr, source: std::io::Error },

    #[snafu(display("Timed out connecting to communication port {address}"))]
    ConnectTimeout { address: SocketAddr },

    #[snafu(display("Failed to send request to communication port {address}, error: {source}"))]
    SendRequest { address: SocketAddr, source: std::io::Error },
}

impl Error {
    #[must_use]
    pub fn is_connection_refused(&self) -> bool {
        match self {
            Self::Connect { source, .. } => source.kind() == std::io::ErrorKind::ConnectionRefused,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::{io::AsyncReadExt, net::TcpListener};

    use super::*;

    #[tokio::test]
    async fn delivers_signal_request_as_json_line() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = String::new();
            stream.read_to_string(&mut buffer).await.unwrap();
            buffer
        });

        let client = CommClient::new(address, "k1");
        assert!(client.send_signal(2).await.unwrap());

        let received = server.await.unwrap();
        let value: serde_json::Value = serde_json::from_str(received.trim()).unwrap();
        assert_eq!(value, serde_json::json!({ "signum": 2 }));
    }

    #[tokio::test]
    async fn refused_connection_reads_as_process_gone() {
        // Bind-then-drop yields a port with nothing listening.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client = CommClient::new(address, "k1");
        assert!(!client.send_signal(0).await.unwrap());
        client.request_shutdown().await.unwrap();
    }
}
