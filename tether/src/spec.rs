//! Kernel specification files and launch-command preparation.
//!
//! A kernel spec is a JSON document describing how to launch one kind of
//! kernel: its argv template, baseline environment, and which provisioner
//! should manage it. The argv entries may carry `{placeholder}` templates
//! that are substituted just before launch.

use std::{collections::HashMap, path::PathBuf, sync::LazyLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use tether_base::consts::kernel_env;

/// Environment variables scrubbed before propagation: secrets and values
/// that only add noise to remote logs.
const ENV_SCRUB_LIST: &[&str] = &["GP_REMOTE_PWD", "LS_COLORS"];

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid"));

/// A kernel specification, immutable per request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KernelSpec {
    pub display_name: String,

    #[serde(default)]
    pub language: String,

    #[serde(default)]
    pub argv: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(default)]
    pub kernel_provisioner: Option<ProvisionerStanza>,
}

/// The `metadata.kernel_provisioner` stanza selecting and parameterizing a
/// backend adapter.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProvisionerStanza {
    pub provisioner_name: String,

    /// Per-kernel overrides merged over the global policy.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl KernelSpec {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let data = std::fs::read(&path).context(OpenSpecSnafu { path: path.clone() })?;
        serde_json::from_slice(&data).context(ParseSpecSnafu { path })
    }

    /// The provisioner name from the spec's metadata, if any.
    #[must_use]
    pub fn provisioner_name(&self) -> Option<&str> {
        self.metadata
            .kernel_provisioner
            .as_ref()
            .map(|stanza| stanza.provisioner_name.as_str())
    }

    /// Substitutes `{placeholder}` templates in the argv.
    ///
    /// Unknown placeholders are left untouched so kernel-specific switches
    /// (e.g. spark-mode passthrough) survive.
    #[must_use]
    pub fn render_argv(&self, substitutions: &HashMap<&str, String>) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                PLACEHOLDER
                    .replace_all(arg, |captures: &Captures<'_>| {
                        let key = &captures[1];
                        substitutions
                            .get(key)
                            .cloned()
                            .unwrap_or_else(|| captures[0].to_string())
                    })
                    .into_owned()
            })
            .collect()
    }
}

/// Finalizes the environment a kernel launcher will inherit.
///
/// Injects the kernel id and language, then scrubs sensitive or noisy
/// variables. The spec's own `env` stanza has already been folded in by the
/// host; values present there win over derived ones.
pub fn finalize_env(env: &mut HashMap<String, String>, kernel_id: &str, language: &str) {
    env.insert(kernel_env::ID.to_string(), kernel_id.to_string());

    let language = if language.is_empty() {
        "unknown-kernel-language".to_string()
    } else {
        language.to_lowercase()
    };
    env.entry(kernel_env::LANGUAGE.to_string()).or_insert(language);

    for key in ENV_SCRUB_LIST {
        env.remove(*key);
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Could not open kernel spec {}, error: {source}", path.display()))]
    OpenSpec { path: PathBuf, source: std::io::Error },

    #[snafu(display("Could not parse kernel spec {}, error: {source}", path.display()))]
    ParseSpec { path: PathBuf, source: serde_json::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_argv(argv: &[&str]) -> KernelSpec {
        KernelSpec {
            display_name: "Python (remote)".to_string(),
            language: "Python".to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            metadata: Metadata::default(),
        }
    }

    #[test]
    fn substitutes_known_placeholders() {
        let spec = spec_with_argv(&[
            "/usr/local/bin/launch_kernel",
            "--kernel-id",
            "{kernel_id}",
            "--response-address",
            "{response_address}",
            "--public-key",
            "{public_key}",
            "--port-range",
            "{port_range}",
        ]);

        let substitutions = HashMap::from([
            ("kernel_id", "abc-123".to_string()),
            ("response_address", "10.0.0.5:8877".to_string()),
            ("public_key", "AAAA".to_string()),
            ("port_range", "0..0".to_string()),
        ]);

        let argv = spec.render_argv(&substitutions);
        assert_eq!(
            argv,
            vec![
                "/usr/local/bin/launch_kernel",
                "--kernel-id",
                "abc-123",
                "--response-address",
                "10.0.0.5:8877",
                "--public-key",
                "AAAA",
                "--port-range",
                "0..0",
            ]
        );
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let spec = spec_with_argv(&["run", "--mode", "{spark_context_initialization_mode}"]);
        let argv = spec.render_argv(&HashMap::new());
        assert_eq!(argv[2], "{spark_context_initialization_mode}");
    }

    #[test]
    fn parses_provisioner_stanza() {
        let raw = serde_json::json!({
            "display_name": "Scala on YARN",
            "language": "scala",
            "argv": ["bin/run.sh", "--kernel-id", "{kernel_id}"],
            "env": {"SPARK_HOME": "/opt/spark"},
            "metadata": {
                "kernel_provisioner": {
                    "provisioner_name": "yarn",
                    "config": {"launch_timeout": 60}
                }
            }
        });
        let spec: KernelSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(spec.provisioner_name(), Some("yarn"));
        let stanza = spec.metadata.kernel_provisioner.as_ref().unwrap();
        assert_eq!(stanza.config.get("launch_timeout"), Some(&serde_json::json!(60)));
    }

    #[test]
    fn finalize_env_injects_and_scrubs() {
        let mut env = HashMap::from([
            ("GP_REMOTE_PWD".to_string(), "hunter2".to_string()),
            ("LS_COLORS".to_string(), "di=34".to_string()),
        ]);
        finalize_env(&mut env, "abc-123", "Python");

        assert_eq!(env.get(kernel_env::ID).map(String::as_str), Some("abc-123"));
        assert_eq!(env.get(kernel_env::LANGUAGE).map(String::as_str), Some("python"));
        assert!(!env.contains_key("GP_REMOTE_PWD"));
        assert!(!env.contains_key("LS_COLORS"));
    }

    #[test]
    fn finalize_env_respects_preset_language() {
        let mut env =
            HashMap::from([(kernel_env::LANGUAGE.to_string(), "python310".to_string())]);
        finalize_env(&mut env, "abc", "Python");
        assert_eq!(env.get(kernel_env::LANGUAGE).map(String::as_str), Some("python310"));
    }
}
