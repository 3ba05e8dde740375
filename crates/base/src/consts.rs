//! Environment variable names and default values recognized by the engine.
//!
//! Two prefixes are in play: `GP_` carries operator-level knobs that apply to
//! the whole host process, while `KERNEL_` conveys per-request values from
//! the host application (and is propagated into the kernel's environment).

/// Operator knobs, applied process-wide.
pub mod gp_env {
    /// Explicit IP address advertised for launcher responses.
    pub const RESPONSE_IP: &str = "GP_RESPONSE_IP";
    /// Preferred response listener port.
    pub const RESPONSE_PORT: &str = "GP_RESPONSE_PORT";
    /// Number of additional ports to try when the preferred port is taken.
    pub const RESPONSE_PORT_RETRIES: &str = "GP_RESPONSE_PORT_RETRIES";
    /// When `true`, the response listener binds all interfaces.
    pub const RESPONSE_ADDR_ANY: &str = "GP_RESPONSE_ADDR_ANY";
    /// Comma-separated regular expressions matching local IPs that must not
    /// be advertised as the response address.
    pub const PROHIBITED_LOCAL_IPS: &str = "GP_PROHIBITED_LOCAL_IPS";

    pub const AUTHORIZED_USERS: &str = "GP_AUTHORIZED_USERS";
    pub const UNAUTHORIZED_USERS: &str = "GP_UNAUTHORIZED_USERS";
    pub const PORT_RANGE: &str = "GP_PORT_RANGE";
    pub const LAUNCH_TIMEOUT: &str = "GP_LAUNCH_TIMEOUT";
    pub const MIN_PORT_RANGE_SIZE: &str = "GP_MIN_PORT_RANGE_SIZE";
    pub const MAX_PORT_RANGE_RETRIES: &str = "GP_MAX_PORT_RANGE_RETRIES";

    pub const ENABLE_TUNNELING: &str = "GP_ENABLE_TUNNELING";
    pub const IMPERSONATION_ENABLED: &str = "GP_IMPERSONATION_ENABLED";

    pub const LOAD_BALANCING_ALGORITHM: &str = "GP_LOAD_BALANCING_ALGORITHM";
    pub const REMOTE_HOSTS: &str = "GP_REMOTE_HOSTS";
    pub const SSH_PORT: &str = "GP_SSH_PORT";
    pub const SSH_PRIVATE_KEY_FILE: &str = "GP_SSH_PRIVATE_KEY_FILE";
    pub const REMOTE_USER: &str = "GP_REMOTE_USER";
    pub const REMOTE_PWD: &str = "GP_REMOTE_PWD";
    pub const REMOTE_GSS_SSH: &str = "GP_REMOTE_GSS_SSH";
    pub const KERNEL_LOG_DIR: &str = "GP_KERNEL_LOG_DIR";

    pub const NAMESPACE: &str = "GP_NAMESPACE";
    pub const SHARED_NAMESPACE: &str = "GP_SHARED_NAMESPACE";
    pub const KERNEL_CLUSTER_ROLE: &str = "GP_KERNEL_CLUSTER_ROLE";
    pub const DEFAULT_KERNEL_SERVICE_ACCOUNT_NAME: &str = "GP_DEFAULT_KERNEL_SERVICE_ACCOUNT_NAME";
    pub const IMAGE_NAME: &str = "GP_IMAGE_NAME";
    pub const EXECUTOR_IMAGE_NAME: &str = "GP_EXECUTOR_IMAGE_NAME";
    pub const APP_NAME: &str = "GP_APP_NAME";

    pub const PROHIBITED_UIDS: &str = "GP_PROHIBITED_UIDS";
    pub const PROHIBITED_GIDS: &str = "GP_PROHIBITED_GIDS";
    pub const MIRROR_WORKING_DIRS: &str = "GP_MIRROR_WORKING_DIRS";

    pub const YARN_ENDPOINT: &str = "GP_YARN_ENDPOINT";
    pub const ALT_YARN_ENDPOINT: &str = "GP_ALT_YARN_ENDPOINT";
    pub const YARN_ENDPOINT_SECURITY_ENABLED: &str = "GP_YARN_ENDPOINT_SECURITY_ENABLED";
    pub const YARN_SHUTDOWN_WAIT_TIME: &str = "GP_YARN_SHUTDOWN_WAIT_TIME";

    pub const DOCKER_NETWORK: &str = "GP_DOCKER_NETWORK";
    /// Conveys whether the launcher should talk to the swarm or the plain
    /// container API. Set by the provisioner, never by the operator.
    pub const DOCKER_MODE: &str = "GP_DOCKER_MODE";

    pub const POLL_INTERVAL: &str = "GP_POLL_INTERVAL";
    pub const MAX_POLL_ATTEMPTS: &str = "GP_MAX_POLL_ATTEMPTS";
    pub const SOCKET_TIMEOUT: &str = "GP_SOCKET_TIMEOUT";

    pub const LOG_LEVEL: &str = "GP_LOG_LEVEL";
    pub const LOG_FILE: &str = "GP_LOG_FILE";
}

/// Per-request values conveyed by the host application.
pub mod kernel_env {
    pub const ID: &str = "KERNEL_ID";
    pub const USERNAME: &str = "KERNEL_USERNAME";
    pub const LANGUAGE: &str = "KERNEL_LANGUAGE";
    pub const LAUNCH_TIMEOUT: &str = "KERNEL_LAUNCH_TIMEOUT";

    pub const NAMESPACE: &str = "KERNEL_NAMESPACE";
    pub const POD_NAME: &str = "KERNEL_POD_NAME";
    pub const SERVICE_ACCOUNT_NAME: &str = "KERNEL_SERVICE_ACCOUNT_NAME";
    pub const IMAGE: &str = "KERNEL_IMAGE";
    pub const EXECUTOR_IMAGE: &str = "KERNEL_EXECUTOR_IMAGE";
    pub const WORKING_DIR: &str = "KERNEL_WORKING_DIR";
    pub const UID: &str = "KERNEL_UID";
    pub const GID: &str = "KERNEL_GID";

    pub const REMOTE_HOST: &str = "KERNEL_REMOTE_HOST";

    pub const CPUS: &str = "KERNEL_CPUS";
    pub const MEMORY: &str = "KERNEL_MEMORY";
    pub const GPUS: &str = "KERNEL_GPUS";
    pub const CPUS_LIMIT: &str = "KERNEL_CPUS_LIMIT";
    pub const MEMORY_LIMIT: &str = "KERNEL_MEMORY_LIMIT";
    pub const GPUS_LIMIT: &str = "KERNEL_GPUS_LIMIT";

    pub const RESOURCE_NAME: &str = "KERNEL_RESOURCE_NAME";
    pub const CRD_GROUP: &str = "KERNEL_CRD_GROUP";
    pub const CRD_VERSION: &str = "KERNEL_CRD_VERSION";
    pub const CRD_PLURAL: &str = "KERNEL_CRD_PLURAL";
    pub const EXTRA_SPARK_OPTS: &str = "KERNEL_EXTRA_SPARK_OPTS";
}

pub mod defaults {
    use std::time::Duration;

    pub const RESPONSE_PORT: u16 = 8877;
    pub const RESPONSE_PORT_RETRIES: u32 = 10;

    pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
    pub const SHUTDOWN_WAIT_TIME: Duration = Duration::from_secs(5);
    pub const YARN_SHUTDOWN_WAIT_TIME: Duration = Duration::from_secs(15);

    pub const MIN_PORT_RANGE_SIZE: u32 = 1000;
    pub const MAX_PORT_RANGE_RETRIES: u32 = 5;

    pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const MAX_POLL_ATTEMPTS: u32 = 10;
    pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

    pub const SSH_PORT: u16 = 22;

    pub const UNAUTHORIZED_USERS: &str = "root";
    pub const KERNEL_UID: &str = "1000";
    pub const KERNEL_GID: &str = "100";
    pub const PROHIBITED_UIDS: &str = "0";
    pub const PROHIBITED_GIDS: &str = "0";

    pub const NAMESPACE: &str = "default";
    pub const KERNEL_CLUSTER_ROLE: &str = "cluster-admin";
    pub const KERNEL_SERVICE_ACCOUNT_NAME: &str = "default";
    pub const DOCKER_NETWORK: &str = "bridge";
    pub const KERNEL_LOG_DIR: &str = "/tmp";
}
