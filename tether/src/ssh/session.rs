//! A non-interactive SSH client session used to launch remote kernels,
//! probe their processes, and carry port tunnels.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use russh::{
    Channel, ChannelMsg, Disconnect, client,
    keys::{PublicKey, known_hosts, key::PrivateKeyWithHashAlg, load_secret_key},
};
use snafu::ResultExt;

use super::{error, error::Error};

/// How to reach and authenticate against one SSH host.
#[derive(Clone, Debug)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Password authentication; `None` selects key-based authentication.
    pub password: Option<String>,
    /// Explicit private key; falls back to the user's default identities.
    pub private_key_path: Option<PathBuf>,
    /// When `true`, the server's key must appear in the known-hosts file.
    pub strict_host_key_checking: bool,
}

struct ClientHandler {
    host: String,
    port: u16,
    strict: bool,
    rejected: Arc<AtomicBool>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_key: &PublicKey) -> Result<bool, Self::Error> {
        if !self.strict {
            return Ok(true);
        }
        match known_hosts::check_known_hosts(&self.host, self.port, server_key) {
            Ok(true) => Ok(true),
            _ => {
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// An established SSH session.
pub struct Session {
    session: client::Handle<ClientHandler>,
}

impl Session {
    /// Connects and authenticates per `settings`.
    ///
    /// Password authentication is used when a password is configured,
    /// otherwise the configured (or default) private key. A host key
    /// rejected by strict checking surfaces as [`Error::UnknownHostKey`]
    /// rather than a bare connection failure.
    pub async fn connect(settings: &SshSettings) -> Result<Self, Error> {
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = ClientHandler {
            host: settings.host.clone(),
            port: settings.port,
            strict: settings.strict_host_key_checking,
            rejected: Arc::clone(&rejected),
        };

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..<_>::default()
        });

        let mut session =
            client::connect(config, (settings.host.as_str(), settings.port), handler)
                .await
                .map_err(|source| {
                    if rejected.load(Ordering::SeqCst) {
                        Error::UnknownHostKey { host: settings.host.clone(), port: settings.port }
                    } else {
                        Error::ConnectServer {
                            host: settings.host.clone(),
                            port: settings.port,
                            source,
                        }
                    }
                })?;

        let auth_res = match &settings.password {
            Some(password) => session
                .authenticate_password(&settings.user, password)
                .await
                .with_context(|_| error::AuthenticateUserSnafu { user: settings.user.clone() })?,
            None => {
                let key_path = resolve_private_key_path(settings)?;
                let private_key = load_secret_key(&key_path, None)
                    .context(error::ReadSshPrivateKeySnafu { path: key_path })?;
                let best_hash = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|source| Error::ConnectServer {
                        host: settings.host.clone(),
                        port: settings.port,
                        source,
                    })?
                    .flatten();
                session
                    .authenticate_publickey(
                        &settings.user,
                        PrivateKeyWithHashAlg::new(Arc::new(private_key), best_hash),
                    )
                    .await
                    .with_context(|_| error::AuthenticateUserSnafu { user: settings.user.clone() })?
            }
        };

        snafu::ensure!(auth_res.success(), error::DenyAccessSnafu { user: settings.user.clone() });

        Ok(Self { session })
    }

    /// Executes `command` without a PTY and captures its output.
    ///
    /// Returns the exit status and the captured stdout; when stdout is
    /// empty, stderr is returned instead so failures carry their own
    /// diagnostics.
    pub async fn exec_capture(&self, command: &str) -> Result<(u32, String), Error> {
        let mut channel =
            self.session.channel_open_session().await.context(error::OpenChannelSnafu)?;
        channel.exec(true, command).await.context(error::ExecuteCommandSnafu)?;

        let mut code = 0;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => code = exit_status,
                _ => {}
            }
        }

        let output = if stdout.is_empty() { stderr } else { stdout };
        Ok((code, String::from_utf8_lossy(&output).into_owned()))
    }

    /// Opens a `direct-tcpip` channel toward `remote_host:remote_port`,
    /// suitable for bridging a local TCP connection.
    pub async fn open_direct_tcpip(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: (&str, u16),
    ) -> Result<Channel<client::Msg>, Error> {
        self.session
            .channel_open_direct_tcpip(
                remote_host,
                u32::from(remote_port),
                originator.0,
                u32::from(originator.1),
            )
            .await
            .with_context(|_| error::OpenDirectTcpipSnafu {
                remote_host: remote_host.to_string(),
                remote_port,
            })
    }

    pub async fn close(self) -> Result<(), Error> {
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .context(error::DisconnectSessionSnafu)?;
        Ok(())
    }
}

fn resolve_private_key_path(settings: &SshSettings) -> Result<PathBuf, Error> {
    if let Some(path) = &settings.private_key_path {
        return Ok(path.clone());
    }
    if let Ok(home) = std::env::var("HOME") {
        for candidate in ["id_ed25519", "id_rsa"] {
            let path = PathBuf::from(&home).join(".ssh").join(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
    }
    error::NoSshCredentialSnafu { user: settings.user.clone() }.fail()
}
