//! The provisioner core: per-kernel lifecycle state, the runtime binding,
//! and the supervisor that drives a backend adapter through
//! launch/poll/signal/terminate.

mod binding;
mod state;
mod supervisor;

use snafu::Snafu;

pub use self::{
    binding::{ConnectionInfo, KernelBinding, resolve_username},
    state::KernelState,
    supervisor::KernelSupervisor,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{source}"))]
    Policy { source: crate::config::Error },

    #[snafu(display("{source}"))]
    State { source: state::Error },

    #[snafu(display("{source}"))]
    Response { source: crate::response::Error },

    #[snafu(display("{source}"))]
    Backend { source: crate::backend::Error },

    #[snafu(display(
        "Kernel resource was started but could not be located: {detail}"
    ))]
    DiscoveryFailed { detail: String },

    #[snafu(display("{source}"))]
    Tunnel { source: crate::tunnel::Error },

    #[snafu(display("{source}"))]
    Comm { source: crate::comm::Error },
}

impl From<crate::config::Error> for Error {
    fn from(source: crate::config::Error) -> Self { Self::Policy { source } }
}

impl From<state::Error> for Error {
    fn from(source: state::Error) -> Self { Self::State { source } }
}

impl From<crate::response::Error> for Error {
    fn from(source: crate::response::Error) -> Self { Self::Response { source } }
}

impl From<crate::backend::Error> for Error {
    fn from(source: crate::backend::Error) -> Self { Self::Backend { source } }
}

impl From<crate::tunnel::Error> for Error {
    fn from(source: crate::tunnel::Error) -> Self { Self::Tunnel { source } }
}

impl From<crate::comm::Error> for Error {
    fn from(source: crate::comm::Error) -> Self { Self::Comm { source } }
}
