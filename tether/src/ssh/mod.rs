//! SSH plumbing shared by the distributed backend and the port tunneler.

pub mod error;
mod session;

pub use self::{
    error::Error,
    session::{Session, SshSettings},
};
