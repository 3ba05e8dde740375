//! Error types for SSH operations.

use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// No usable SSH credential could be resolved.
    #[snafu(display(
        "No SSH private key was provided and no password is configured for user {user}"
    ))]
    NoSshCredential { user: String },

    #[snafu(display("Failed to read the SSH private key file {}, error: {source}", path.display()))]
    ReadSshPrivateKey { path: PathBuf, source: russh::keys::Error },

    #[snafu(display("Failed to connect to the SSH server {host}:{port}, error: {source}"))]
    ConnectServer { host: String, port: u16, source: russh::Error },

    /// The server's host key failed strict validation.
    #[snafu(display("Host key verification failed for {host}:{port}"))]
    UnknownHostKey { host: String, port: u16 },

    #[snafu(display("Failed to authenticate user {user}, error: {source}"))]
    AuthenticateUser { user: String, source: russh::Error },

    #[snafu(display("Access denied for user {user}"))]
    DenyAccess { user: String },

    #[snafu(display("Failed to open a new SSH session channel, error: {source}"))]
    OpenChannel { source: russh::Error },

    #[snafu(display("Failed to execute command, error: {source}"))]
    ExecuteCommand { source: russh::Error },

    #[snafu(display(
        "Failed to open direct-tcpip channel to {remote_host}:{remote_port}, error: {source}"
    ))]
    OpenDirectTcpip { remote_host: String, remote_port: u16, source: russh::Error },

    #[snafu(display("Failed to disconnect session, error: {source}"))]
    DisconnectSession { source: russh::Error },
}
