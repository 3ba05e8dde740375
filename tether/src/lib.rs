//! Tether provisions and manages the lifecycle of compute kernel processes
//! on remote infrastructure (Kubernetes pods, Docker containers and swarm
//! services, Hadoop YARN applications, and plain SSH-reachable hosts) on
//! behalf of a host application that otherwise assumes local execution.
//!
//! The flow: the host presents a kernel spec plus environment; the
//! [`backend::ProvisionerRegistry`] selects a backend adapter and merges
//! per-kernel configuration over global policy; the adapter launches a
//! kernel launcher parameterized with the kernel id, the response address,
//! the process public key, and the port-range policy; the
//! [`response::ResponseManager`] receives the launcher's encrypted
//! connection payload and routes it to the awaiting
//! [`provisioner::KernelSupervisor`], which merges in the discovered host
//! and hands the connection info to the host. Signalling, interruption,
//! polling, and termination then run through the supervisor until cleanup.
//!
//! ```no_run
//! use std::{collections::HashMap, sync::Arc};
//!
//! use tether::{
//!     backend::ProvisionerRegistry, config::ProvisionerConfig, crypto::Keypair,
//!     response::ResponseManager, spec::KernelSpec,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keypair = Arc::new(Keypair::generate()?);
//! let response_manager = Arc::new(ResponseManager::start(keypair).await?);
//! let registry = ProvisionerRegistry::new(ProvisionerConfig::from_env()?, response_manager)?;
//!
//! let spec = KernelSpec::load("/usr/local/share/kernels/python-k8s/kernel.json")?;
//! let supervisor = registry.provision(&spec, None)?;
//! let connection_info = supervisor.start(HashMap::new()).await?;
//! println!("kernel shell port: {}", connection_info.shell_port);
//! supervisor.shutdown(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod balancer;
pub mod comm;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ports;
pub mod provisioner;
pub mod response;
pub mod spec;
pub mod ssh;
pub mod tunnel;

pub use self::{
    backend::ProvisionerRegistry,
    config::ProvisionerConfig,
    error::Error,
    provisioner::{ConnectionInfo, KernelState, KernelSupervisor},
    response::ResponseManager,
    spec::KernelSpec,
};
