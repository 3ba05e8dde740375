//! Host selection for the distributed (SSH) backend.
//!
//! A single [`HostPool`] is shared by every distributed kernel in the host
//! process. Selection state (the round-robin cursor, per-host active counts)
//! is mutated only under the pool's mutex.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

/// Which algorithm picks the next host for a kernel.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum LoadBalancingAlgorithm {
    #[default]
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[serde(rename = "least-connection")]
    LeastConnection,
}

impl fmt::Display for LoadBalancingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round-robin"),
            Self::LeastConnection => write!(f, "least-connection"),
        }
    }
}

impl FromStr for LoadBalancingAlgorithm {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "round-robin" => Ok(Self::RoundRobin),
            "least-connection" => Ok(Self::LeastConnection),
            _ => InvalidAlgorithmSnafu { value: input }.fail(),
        }
    }
}

/// The set of hosts distributed kernels may land on, plus the bookkeeping
/// needed to spread them.
pub struct HostPool {
    algorithm: LoadBalancingAlgorithm,
    state: Mutex<PoolState>,
}

struct PoolState {
    hosts: Vec<String>,
    next_index: usize,
    active: HashMap<String, usize>,
    assignments: HashMap<String, String>,
}

impl HostPool {
    pub fn new(
        hosts: impl IntoIterator<Item = String>,
        algorithm: LoadBalancingAlgorithm,
    ) -> Result<Self, Error> {
        let hosts: Vec<String> = hosts.into_iter().collect();
        ensure!(!hosts.is_empty(), NoRemoteHostsSnafu);
        let active = hosts.iter().map(|host| (host.clone(), 0)).collect();
        Ok(Self {
            algorithm,
            state: Mutex::new(PoolState { hosts, next_index: 0, active, assignments: HashMap::new() }),
        })
    }

    /// Picks the host for `kernel_id`.
    ///
    /// A pinned host (`KERNEL_REMOTE_HOST`) bypasses the algorithm but must
    /// be one of the configured hosts.
    pub fn select(&self, kernel_id: &str, pinned: Option<&str>) -> Result<String, Error> {
        let mut state = self.state.lock().expect("host pool lock poisoned");

        let host = match pinned {
            Some(pinned) => {
                ensure!(
                    state.hosts.iter().any(|host| host == pinned),
                    UnknownRemoteHostSnafu { host: pinned }
                );
                pinned.to_string()
            }
            None => match self.algorithm {
                LoadBalancingAlgorithm::RoundRobin => {
                    let host = state.hosts[state.next_index % state.hosts.len()].clone();
                    state.next_index += 1;
                    host
                }
                LoadBalancingAlgorithm::LeastConnection => state
                    .hosts
                    .iter()
                    .min_by_key(|host| state.active.get(*host).copied().unwrap_or(0))
                    .cloned()
                    .expect("pool is never empty"),
            },
        };

        if self.algorithm == LoadBalancingAlgorithm::LeastConnection {
            *state.active.entry(host.clone()).or_insert(0) += 1;
            state.assignments.insert(kernel_id.to_string(), host.clone());
        }
        Ok(host)
    }

    /// Releases the host assignment for a kernel that reached TERMINATED or
    /// FAILED. Idempotent.
    pub fn release(&self, kernel_id: &str) {
        let mut state = self.state.lock().expect("host pool lock poisoned");
        if let Some(host) = state.assignments.remove(kernel_id)
            && let Some(count) = state.active.get_mut(&host)
        {
            *count = count.saturating_sub(1);
        }
    }

    /// Current active-kernel count for a host. Zero for unknown hosts.
    #[must_use]
    pub fn active_count(&self, host: &str) -> usize {
        self.state.lock().expect("host pool lock poisoned").active.get(host).copied().unwrap_or(0)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "Invalid load balancing algorithm value {value}, not in [round-robin,least-connection]"
    ))]
    InvalidAlgorithm { value: String },

    #[snafu(display("No remote hosts are configured; set GP_REMOTE_HOSTS"))]
    NoRemoteHosts,

    #[snafu(display(
        "Pinned remote host '{host}' (KERNEL_REMOTE_HOST) is not in the configured host list"
    ))]
    UnknownRemoteHost { host: String },
}
