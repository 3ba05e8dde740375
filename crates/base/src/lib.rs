pub mod config;
pub mod consts;

pub const PROJECT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const PROJECT_NAME: &str = "tether";
pub const PROJECT_NAME_WITH_INITIAL_CAPITAL: &str = "Tether";

/// Value of the `app` label applied to every backend resource (pod,
/// container, swarm service, auto-created namespace) created on behalf of a
/// kernel.
pub const APP_LABEL_VALUE: &str = "tether";
