//! Provisioner policy configuration.
//!
//! A single [`ProvisionerConfig`] captures every operator knob. Globals come
//! from the `GP_`-prefixed environment; each kernel spec may carry a
//! `config` stanza that is merged over the globals before a launch. The
//! merge rules and the authorization precedence live here so there is
//! exactly one place that decides them.

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{DisplayFromStr, DurationSecondsWithFrac, serde_as};
use snafu::{ResultExt, Snafu, ensure};
use tether_base::consts::{defaults, gp_env, kernel_env};

use crate::{balancer::LoadBalancingAlgorithm, ports::PortRange};

/// The resolved configuration a kernel is launched under.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Users allowed to start kernels. Empty means everyone (minus the
    /// unauthorized set).
    pub authorized_users: BTreeSet<String>,

    /// Users that may never start kernels. Takes precedence over
    /// `authorized_users` at every scope.
    pub unauthorized_users: BTreeSet<String>,

    #[serde_as(as = "DisplayFromStr")]
    pub port_range: PortRange,

    /// How long a launch may spend awaiting connection info and discovery.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub launch_timeout: Duration,

    pub impersonation_enabled: bool,
    pub tunneling_enabled: bool,

    pub remote_hosts: Vec<String>,
    pub load_balancing_algorithm: LoadBalancingAlgorithm,
    pub ssh_port: u16,
    pub ssh_private_key_file_path: Option<PathBuf>,
    pub remote_user: Option<String>,
    pub remote_pwd: Option<String>,
    pub remote_gss_ssh: bool,
    pub kernel_log_dir: PathBuf,

    pub namespace: String,
    pub shared_namespace: bool,
    pub kernel_cluster_role: String,
    pub default_kernel_service_account_name: String,

    pub image_name: Option<String>,
    pub executor_image_name: Option<String>,
    pub app_name: String,

    pub prohibited_uids: BTreeSet<String>,
    pub prohibited_gids: BTreeSet<String>,
    pub mirror_working_dirs: bool,

    pub yarn_endpoint: Option<String>,
    pub alt_yarn_endpoint: Option<String>,
    pub yarn_endpoint_security_enabled: bool,

    pub docker_network: String,

    pub min_port_range_size: u32,
    pub max_port_range_retries: u32,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            authorized_users: BTreeSet::new(),
            unauthorized_users: csv_set(defaults::UNAUTHORIZED_USERS),
            port_range: PortRange::UNCONSTRAINED,
            launch_timeout: defaults::LAUNCH_TIMEOUT,
            impersonation_enabled: false,
            tunneling_enabled: false,
            remote_hosts: vec!["localhost".to_string()],
            load_balancing_algorithm: LoadBalancingAlgorithm::default(),
            ssh_port: defaults::SSH_PORT,
            ssh_private_key_file_path: None,
            remote_user: None,
            remote_pwd: None,
            remote_gss_ssh: false,
            kernel_log_dir: PathBuf::from(defaults::KERNEL_LOG_DIR),
            namespace: defaults::NAMESPACE.to_string(),
            shared_namespace: true,
            kernel_cluster_role: defaults::KERNEL_CLUSTER_ROLE.to_string(),
            default_kernel_service_account_name: defaults::KERNEL_SERVICE_ACCOUNT_NAME.to_string(),
            image_name: None,
            executor_image_name: None,
            app_name: tether_base::APP_LABEL_VALUE.to_string(),
            prohibited_uids: csv_set(defaults::PROHIBITED_UIDS),
            prohibited_gids: csv_set(defaults::PROHIBITED_GIDS),
            mirror_working_dirs: false,
            yarn_endpoint: None,
            alt_yarn_endpoint: None,
            yarn_endpoint_security_enabled: false,
            docker_network: defaults::DOCKER_NETWORK.to_string(),
            min_port_range_size: defaults::MIN_PORT_RANGE_SIZE,
            max_port_range_retries: defaults::MAX_PORT_RANGE_RETRIES,
            poll_interval: defaults::POLL_INTERVAL,
            max_poll_attempts: defaults::MAX_POLL_ATTEMPTS,
        }
    }
}

impl ProvisionerConfig {
    /// Builds the global configuration from the `GP_` environment.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(users) = env_var(gp_env::AUTHORIZED_USERS) {
            config.authorized_users = csv_set(&users);
        }
        if let Some(users) = env_var(gp_env::UNAUTHORIZED_USERS) {
            config.unauthorized_users = csv_set(&users);
        }
        if let Some(range) = env_var(gp_env::PORT_RANGE) {
            config.port_range =
                range.parse().context(PortRangeSnafu { variable: gp_env::PORT_RANGE })?;
        }
        // GP_LAUNCH_TIMEOUT wins over the host-conveyed KERNEL_LAUNCH_TIMEOUT.
        if let Some(secs) = env_parse::<f64>(gp_env::LAUNCH_TIMEOUT)?
            .or(env_parse::<f64>(kernel_env::LAUNCH_TIMEOUT)?)
        {
            config.launch_timeout = Duration::from_secs_f64(secs);
        }
        config.impersonation_enabled =
            env_bool(gp_env::IMPERSONATION_ENABLED).unwrap_or(config.impersonation_enabled);
        config.tunneling_enabled =
            env_bool(gp_env::ENABLE_TUNNELING).unwrap_or(config.tunneling_enabled);

        if let Some(hosts) = env_var(gp_env::REMOTE_HOSTS) {
            config.remote_hosts = hosts.split(',').map(str::to_string).collect();
        }
        if let Some(algorithm) = env_var(gp_env::LOAD_BALANCING_ALGORITHM) {
            config.load_balancing_algorithm = algorithm
                .parse()
                .map_err(|_| Error::InvalidLoadBalancingAlgorithm { value: algorithm })?;
        }
        if let Some(port) = env_parse(gp_env::SSH_PORT)? {
            config.ssh_port = port;
        }
        config.ssh_private_key_file_path =
            env_var(gp_env::SSH_PRIVATE_KEY_FILE).map(PathBuf::from);
        config.remote_user = env_var(gp_env::REMOTE_USER);
        config.remote_pwd = env_var(gp_env::REMOTE_PWD);
        config.remote_gss_ssh = env_bool(gp_env::REMOTE_GSS_SSH).unwrap_or(false);
        if config.remote_gss_ssh && (config.remote_user.is_some() || config.remote_pwd.is_some()) {
            tracing::warn!(
                "Both GP_REMOTE_GSS_SSH and one of GP_REMOTE_PWD or GP_REMOTE_USER is set. Those \
                 options are mutually exclusive, your configuration may be incorrect. \
                 GP_REMOTE_GSS_SSH will take priority"
            );
            config.remote_user = None;
            config.remote_pwd = None;
        }
        if let Some(dir) = env_var(gp_env::KERNEL_LOG_DIR) {
            config.kernel_log_dir = PathBuf::from(dir);
        }

        if let Some(namespace) = env_var(gp_env::NAMESPACE) {
            config.namespace = namespace;
        }
        config.shared_namespace =
            env_bool(gp_env::SHARED_NAMESPACE).unwrap_or(config.shared_namespace);
        if let Some(role) = env_var(gp_env::KERNEL_CLUSTER_ROLE) {
            config.kernel_cluster_role = role;
        }
        if let Some(account) = env_var(gp_env::DEFAULT_KERNEL_SERVICE_ACCOUNT_NAME) {
            config.default_kernel_service_account_name = account;
        }
        config.image_name = env_var(gp_env::IMAGE_NAME);
        config.executor_image_name = env_var(gp_env::EXECUTOR_IMAGE_NAME);
        if let Some(app_name) = env_var(gp_env::APP_NAME) {
            config.app_name = app_name;
        }

        if let Some(uids) = env_var(gp_env::PROHIBITED_UIDS) {
            config.prohibited_uids = csv_set(&uids);
        }
        if let Some(gids) = env_var(gp_env::PROHIBITED_GIDS) {
            config.prohibited_gids = csv_set(&gids);
        }
        config.mirror_working_dirs =
            env_bool(gp_env::MIRROR_WORKING_DIRS).unwrap_or(config.mirror_working_dirs);

        config.yarn_endpoint = env_var(gp_env::YARN_ENDPOINT);
        config.alt_yarn_endpoint = env_var(gp_env::ALT_YARN_ENDPOINT);
        config.yarn_endpoint_security_enabled =
            env_bool(gp_env::YARN_ENDPOINT_SECURITY_ENABLED).unwrap_or(false);

        if let Some(network) = env_var(gp_env::DOCKER_NETWORK) {
            config.docker_network = network;
        }

        if let Some(size) = env_parse(gp_env::MIN_PORT_RANGE_SIZE)? {
            config.min_port_range_size = size;
        }
        if let Some(retries) = env_parse(gp_env::MAX_PORT_RANGE_RETRIES)? {
            config.max_port_range_retries = retries;
        }
        if let Some(secs) = env_parse::<f64>(gp_env::POLL_INTERVAL)? {
            config.poll_interval = Duration::from_secs_f64(secs);
        }
        if let Some(attempts) = env_parse(gp_env::MAX_POLL_ATTEMPTS)? {
            config.max_poll_attempts = attempts;
        }

        Ok(config)
    }

    /// Merges a kernel spec's `config` stanza over this configuration.
    ///
    /// Scalars and lists in the stanza override the global value;
    /// `unauthorized_users` is amended (set union) so a per-kernel stanza can
    /// never un-ban a user the operator banned globally.
    pub fn merge(&self, stanza: &Map<String, Value>) -> Result<Self, Error> {
        let mut merged = match serde_json::to_value(self).context(SerializeConfigSnafu)? {
            Value::Object(map) => map,
            _ => unreachable!("ProvisionerConfig serializes to an object"),
        };

        for (key, value) in stanza {
            if key == "unauthorized_users" {
                let amended: BTreeSet<String> = self
                    .unauthorized_users
                    .iter()
                    .cloned()
                    .chain(
                        value
                            .as_array()
                            .into_iter()
                            .flatten()
                            .filter_map(Value::as_str)
                            .map(str::to_string),
                    )
                    .collect();
                merged.insert(
                    key.clone(),
                    serde_json::to_value(amended).context(SerializeConfigSnafu)?,
                );
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }

        serde_json::from_value(Value::Object(merged)).context(InvalidConfigStanzaSnafu)
    }

    /// Validates knobs that must be caught at configuration-load time,
    /// before any backend resource is created.
    pub fn validate(&self) -> Result<(), crate::ports::Error> {
        self.port_range.validate(self.min_port_range_size)
    }

    /// Applies the authorization checks, in precedence order, for `username`
    /// attempting to start the kernel named `kernel_name`.
    pub fn authorize(&self, username: &str, kernel_name: &str) -> Result<(), Error> {
        ensure!(
            !self.unauthorized_users.contains(username),
            ForbiddenByUnauthorizedListSnafu { username, kernel_name }
        );
        ensure!(
            self.authorized_users.is_empty() || self.authorized_users.contains(username),
            ForbiddenByAuthorizedListSnafu { username, kernel_name }
        );
        Ok(())
    }

    /// Determines the UID/GID a container-based kernel will run under and
    /// rejects prohibited values. The resolved values are written back into
    /// `env` so the launcher inherits them.
    pub fn enforce_prohibited_ids(&self, env: &mut HashMap<String, String>) -> Result<(), Error> {
        let uid =
            env.get(kernel_env::UID).cloned().unwrap_or_else(|| defaults::KERNEL_UID.to_string());
        let gid =
            env.get(kernel_env::GID).cloned().unwrap_or_else(|| defaults::KERNEL_GID.to_string());

        ensure!(!self.prohibited_uids.contains(&uid), ProhibitedUidSnafu { uid });
        ensure!(!self.prohibited_gids.contains(&gid), ProhibitedGidSnafu { gid });

        env.insert(kernel_env::UID.to_string(), uid);
        env.insert(kernel_env::GID.to_string(), gid);
        Ok(())
    }
}

fn csv_set(value: &str) -> BTreeSet<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_var(name).map(|value| value.to_lowercase() == "true")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Error> {
    match env_var(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidEnvValue { variable: name.to_string(), value }),
        None => Ok(None),
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "User '{username}' is not authorized to start kernel '{kernel_name}'. Ensure \
         KERNEL_USERNAME is set to an appropriate value and retry the request."
    ))]
    ForbiddenByUnauthorizedList { username: String, kernel_name: String },

    #[snafu(display(
        "User '{username}' is not in the set of users authorized to start kernel \
         '{kernel_name}'. Ensure KERNEL_USERNAME is set to an appropriate value and retry the \
         request."
    ))]
    ForbiddenByAuthorizedList { username: String, kernel_name: String },

    #[snafu(display("Kernel's UID value of '{uid}' has been denied via GP_PROHIBITED_UIDS"))]
    ProhibitedUid { uid: String },

    #[snafu(display("Kernel's GID value of '{gid}' has been denied via GP_PROHIBITED_GIDS"))]
    ProhibitedGid { gid: String },

    #[snafu(display("Could not parse port range from {variable}, error: {source}"))]
    PortRange { variable: String, source: crate::ports::Error },

    #[snafu(display(
        "Invalid load balancing algorithm value {value}, not in [round-robin,least-connection]"
    ))]
    InvalidLoadBalancingAlgorithm { value: String },

    #[snafu(display("Environment variable {variable} holds unparsable value '{value}'"))]
    InvalidEnvValue { variable: String, value: String },

    #[snafu(display("Could not serialize configuration, error: {source}"))]
    SerializeConfig { source: serde_json::Error },

    #[snafu(display("Kernel spec carries an invalid provisioner config stanza, error: {source}"))]
    InvalidConfigStanza { source: serde_json::Error },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn denial_takes_precedence_over_authorization() {
        let config = ProvisionerConfig {
            authorized_users: csv_set("alice,root"),
            unauthorized_users: csv_set("root"),
            ..ProvisionerConfig::default()
        };

        let err = config.authorize("root", "Python on Kubernetes").unwrap_err();
        assert!(matches!(err, Error::ForbiddenByUnauthorizedList { .. }));
        assert!(err.to_string().contains("User 'root' is not authorized"));

        config.authorize("alice", "Python on Kubernetes").unwrap();
    }

    #[test]
    fn authorized_list_rejects_outsiders_with_distinct_message() {
        let config = ProvisionerConfig {
            authorized_users: csv_set("alice"),
            ..ProvisionerConfig::default()
        };

        let err = config.authorize("bob", "Scala on YARN").unwrap_err();
        assert!(matches!(err, Error::ForbiddenByAuthorizedList { .. }));
        assert!(err.to_string().contains("is not in the set of users authorized"));
    }

    #[test]
    fn empty_authorized_list_allows_everyone_not_banned() {
        let config = ProvisionerConfig::default();
        config.authorize("anyone", "kernel").unwrap();
        // "root" is banned by default.
        assert!(config.authorize("root", "kernel").is_err());
    }

    #[test]
    fn merge_overrides_scalars() {
        let global = ProvisionerConfig::default();
        let stanza = json!({
            "launch_timeout": 5,
            "image_name": "example.com/kernels/python:3",
            "remote_hosts": ["h1", "h2"]
        });
        let merged = global.merge(stanza.as_object().unwrap()).unwrap();
        assert_eq!(merged.launch_timeout, Duration::from_secs(5));
        assert_eq!(merged.image_name.as_deref(), Some("example.com/kernels/python:3"));
        assert_eq!(merged.remote_hosts, vec!["h1".to_string(), "h2".to_string()]);
        // Untouched values survive.
        assert_eq!(merged.ssh_port, defaults::SSH_PORT);
    }

    #[test]
    fn merge_amends_unauthorized_users() {
        let global = ProvisionerConfig {
            unauthorized_users: csv_set("root,daemon"),
            ..ProvisionerConfig::default()
        };
        let stanza = json!({ "unauthorized_users": ["mallory"] });
        let merged = global.merge(stanza.as_object().unwrap()).unwrap();
        assert_eq!(merged.unauthorized_users, csv_set("root,daemon,mallory"));
    }

    #[test]
    fn merge_overrides_authorized_users_wholesale() {
        let global = ProvisionerConfig {
            authorized_users: csv_set("alice"),
            ..ProvisionerConfig::default()
        };
        let stanza = json!({ "authorized_users": ["bob"] });
        let merged = global.merge(stanza.as_object().unwrap()).unwrap();
        assert_eq!(merged.authorized_users, csv_set("bob"));
    }

    #[test]
    fn prohibited_ids_reject_and_default() {
        let config = ProvisionerConfig::default();

        let mut env = HashMap::new();
        env.insert(kernel_env::UID.to_string(), "0".to_string());
        let err = config.enforce_prohibited_ids(&mut env).unwrap_err();
        assert!(matches!(err, Error::ProhibitedUid { .. }));

        let mut env = HashMap::new();
        config.enforce_prohibited_ids(&mut env).unwrap();
        assert_eq!(env.get(kernel_env::UID).map(String::as_str), Some(defaults::KERNEL_UID));
        assert_eq!(env.get(kernel_env::GID).map(String::as_str), Some(defaults::KERNEL_GID));
    }

    #[test]
    fn port_range_validation_happens_at_config_level() {
        let config = ProvisionerConfig {
            port_range: "40000..40000".parse().unwrap(),
            ..ProvisionerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
