//! The runtime entity tracking one provisioned kernel.

use std::{collections::HashMap, net::SocketAddr, time::SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::KernelState;

/// The connection information a kernel launcher reports back.
///
/// This is the decrypted payload of §"response payload" on the wire: the
/// five ZeroMQ ports plus the signature parameters the host needs to talk
/// to the kernel, and the optional side-channel communication port.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConnectionInfo {
    /// The kernel this payload belongs to; routing happens on this field
    /// after decryption, making the authenticated identity authoritative.
    pub kernel_id: String,

    /// Routable IP of the system the kernel actually runs on.
    pub ip: String,

    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,

    pub signature_key: String,
    pub signature_scheme: String,

    /// Side-channel port the launcher listens on for signal/shutdown
    /// requests. Optional: older launchers may not provide one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communication_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i64>,
}

impl ConnectionInfo {
    /// The five ZMQ ports in tunnel order (shell, iopub, stdin, hb, control).
    #[must_use]
    pub fn zmq_ports(&self) -> [u16; 5] {
        [self.shell_port, self.iopub_port, self.stdin_port, self.hb_port, self.control_port]
    }
}

/// One active kernel: exactly one binding exists per kernel id for the
/// lifetime of the host process.
#[derive(Debug)]
pub struct KernelBinding {
    pub kernel_id: String,
    pub username: String,
    pub state: KernelState,

    /// Host (pod name, container name, hostname) discovered post-launch.
    pub assigned_host: Option<String>,
    /// IP corresponding to `assigned_host`.
    pub assigned_ip: Option<String>,

    pub connection_info: Option<ConnectionInfo>,
    /// The pre-tunnel connection info, retained when tunneling rewrites the
    /// ports the host sees.
    pub tunneled_connection_info: Option<ConnectionInfo>,

    pub launched_at: Option<SystemTime>,
    pub pid: Option<i64>,
    pub pgid: Option<i64>,

    /// Where the launcher's communication listener lives, once known.
    pub comm_address: Option<SocketAddr>,

    /// Opaque backend identity: pod name, container id, YARN application
    /// id, or remote process id.
    pub backend_handle: Option<String>,
}

impl KernelBinding {
    #[must_use]
    pub fn new(kernel_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            username: username.into(),
            state: KernelState::Pending,
            assigned_host: None,
            assigned_ip: None,
            connection_info: None,
            tunneled_connection_info: None,
            launched_at: None,
            pid: None,
            pgid: None,
            comm_address: None,
            backend_handle: None,
        }
    }

    /// Captures the information necessary to rehydrate this binding in a
    /// later host session.
    #[must_use]
    pub fn provisioner_info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert("kernel_id".to_string(), Value::from(self.kernel_id.clone()));
        info.insert("username".to_string(), Value::from(self.username.clone()));
        info.insert("pid".to_string(), Value::from(self.pid));
        info.insert("pgid".to_string(), Value::from(self.pgid));
        info.insert("assigned_host".to_string(), Value::from(self.assigned_host.clone()));
        info.insert("assigned_ip".to_string(), Value::from(self.assigned_ip.clone()));
        info.insert(
            "comm_address".to_string(),
            Value::from(self.comm_address.map(|address| address.to_string())),
        );
        info.insert("backend_handle".to_string(), Value::from(self.backend_handle.clone()));
        if let Some(connection_info) = &self.connection_info {
            info.insert(
                "connection_info".to_string(),
                serde_json::to_value(connection_info).unwrap_or(Value::Null),
            );
        }
        if let Some(tunneled) = &self.tunneled_connection_info {
            info.insert(
                "tunneled_connection_info".to_string(),
                serde_json::to_value(tunneled).unwrap_or(Value::Null),
            );
        }
        info
    }

    /// Restores a binding from [`Self::provisioner_info`] output.
    pub fn load_provisioner_info(&mut self, info: &Map<String, Value>) {
        if let Some(username) = info.get("username").and_then(Value::as_str) {
            self.username = username.to_string();
        }
        self.pid = info.get("pid").and_then(Value::as_i64);
        self.pgid = info.get("pgid").and_then(Value::as_i64);
        self.assigned_host =
            info.get("assigned_host").and_then(Value::as_str).map(str::to_string);
        self.assigned_ip = info.get("assigned_ip").and_then(Value::as_str).map(str::to_string);
        self.comm_address =
            info.get("comm_address").and_then(Value::as_str).and_then(|raw| raw.parse().ok());
        self.backend_handle =
            info.get("backend_handle").and_then(Value::as_str).map(str::to_string);
        self.connection_info = info
            .get("connection_info")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok());
        self.tunneled_connection_info = info
            .get("tunneled_connection_info")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok());
        if self.connection_info.is_some() {
            self.state = KernelState::Running;
        }
    }
}

/// Convenience used in a few places where the binding's env-derived
/// username must be established: `KERNEL_USERNAME` wins, then the process
/// owner.
#[must_use]
pub fn resolve_username(env: &HashMap<String, String>) -> String {
    env.get(tether_base::consts::kernel_env::USERNAME).cloned().unwrap_or_else(|| {
        std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_connection_info() -> ConnectionInfo {
        ConnectionInfo {
            kernel_id: "abc-123".to_string(),
            ip: "10.1.2.3".to_string(),
            shell_port: 50001,
            iopub_port: 50002,
            stdin_port: 50003,
            control_port: 50004,
            hb_port: 50005,
            signature_key: "deadbeef".to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            communication_port: Some(50006),
            pid: Some(17),
            pgid: None,
        }
    }

    #[test]
    fn provisioner_info_round_trips() {
        let mut binding = KernelBinding::new("abc-123", "alice");
        binding.assigned_host = Some("node-7".to_string());
        binding.assigned_ip = Some("10.1.2.3".to_string());
        binding.pid = Some(17);
        binding.comm_address = Some("10.1.2.3:50006".parse().unwrap());
        binding.connection_info = Some(sample_connection_info());
        binding.backend_handle = Some("application_1700000000000_0042".to_string());

        let info = binding.provisioner_info();

        let mut restored = KernelBinding::new("abc-123", "unknown");
        restored.load_provisioner_info(&info);

        assert_eq!(restored.username, "alice");
        assert_eq!(restored.assigned_host.as_deref(), Some("node-7"));
        assert_eq!(restored.pid, Some(17));
        assert_eq!(restored.comm_address, binding.comm_address);
        assert_eq!(restored.connection_info, binding.connection_info);
        assert_eq!(restored.backend_handle, binding.backend_handle);
        assert_eq!(restored.state, KernelState::Running);
    }

    #[test]
    fn connection_info_json_uses_wire_field_names() {
        let value = serde_json::to_value(sample_connection_info()).unwrap();
        for field in [
            "kernel_id",
            "ip",
            "shell_port",
            "iopub_port",
            "stdin_port",
            "control_port",
            "hb_port",
            "signature_key",
            "signature_scheme",
            "communication_port",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        // Absent optionals stay off the wire.
        let without_pid = ConnectionInfo { pid: None, ..sample_connection_info() };
        let value = serde_json::to_value(without_pid).unwrap();
        assert!(value.get("pid").is_none());
    }
}
