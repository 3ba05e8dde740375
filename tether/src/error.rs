//! Top-level error type aggregating the engine's module errors.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{source}"))]
    Crypto { source: crate::crypto::Error },

    #[snafu(display("{source}"))]
    Response { source: crate::response::Error },

    #[snafu(display("{source}"))]
    Ports { source: crate::ports::Error },

    #[snafu(display("{source}"))]
    Config { source: crate::config::Error },

    #[snafu(display("{source}"))]
    Spec { source: crate::spec::Error },

    #[snafu(display("{source}"))]
    Balancer { source: crate::balancer::Error },

    #[snafu(display("{source}"))]
    Backend { source: crate::backend::Error },

    #[snafu(display("{source}"))]
    Provisioner { source: crate::provisioner::Error },

    #[snafu(display("{source}"))]
    Tunnel { source: crate::tunnel::Error },

    #[snafu(display("{source}"))]
    Ssh { source: crate::ssh::Error },

    #[snafu(display("{source}"))]
    Comm { source: crate::comm::Error },
}

impl From<crate::crypto::Error> for Error {
    fn from(source: crate::crypto::Error) -> Self { Self::Crypto { source } }
}

impl From<crate::response::Error> for Error {
    fn from(source: crate::response::Error) -> Self { Self::Response { source } }
}

impl From<crate::ports::Error> for Error {
    fn from(source: crate::ports::Error) -> Self { Self::Ports { source } }
}

impl From<crate::config::Error> for Error {
    fn from(source: crate::config::Error) -> Self { Self::Config { source } }
}

impl From<crate::spec::Error> for Error {
    fn from(source: crate::spec::Error) -> Self { Self::Spec { source } }
}

impl From<crate::balancer::Error> for Error {
    fn from(source: crate::balancer::Error) -> Self { Self::Balancer { source } }
}

impl From<crate::backend::Error> for Error {
    fn from(source: crate::backend::Error) -> Self { Self::Backend { source } }
}

impl From<crate::provisioner::Error> for Error {
    fn from(source: crate::provisioner::Error) -> Self { Self::Provisioner { source } }
}

impl From<crate::tunnel::Error> for Error {
    fn from(source: crate::tunnel::Error) -> Self { Self::Tunnel { source } }
}

impl From<crate::ssh::Error> for Error {
    fn from(source: crate::ssh::Error) -> Self { Self::Ssh { source } }
}

impl From<crate::comm::Error> for Error {
    fn from(source: crate::comm::Error) -> Self { Self::Comm { source } }
}
