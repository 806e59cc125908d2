//! Orchestrator configuration: file loading, defaults and validation.

use crate::error::ConfigError;
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parameter value that asks the orchestrator to substitute a run-specific path.
pub const FILL_SENTINEL: &str = "to be filled by the orchestrator";

/// Parameters the orchestrator knows how to fill.
pub const FILLABLE_PARAMETERS: [&str; 2] = ["fastq_input", "outdir"];

pub const GRIDION_RUN_ID_PATTERN: &str = r"^\d{8}_\d{4}_X\d_[A-Z0-9]{8}_[a-z0-9]{8}$";
pub const PROMETHION_RUN_ID_PATTERN: &str = r"^\d{8}_\d{4}_P2S_\d+-\w_[A-Z0-9]{8}_[a-z0-9]{8}$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Let in-flight pipelines finish before exiting.
    #[default]
    Drain,
    /// Kill in-flight pipelines and record them as failed.
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue {
    Literal(String),
    Fill,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineSpec {
    pub pipeline_name: String,
    pub pipeline_version: String,
    #[serde(default, deserialize_with = "deserialize_parameters")]
    pub pipeline_parameters: IndexMap<String, ParameterValue>,
}

impl PipelineSpec {
    /// `BCCDC-PHL/routine_nanopore_qc` becomes `routine-nanopore-qc`.
    pub fn short_name(&self) -> String {
        let name = self
            .pipeline_name
            .split_once('/')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.pipeline_name);
        name.replace('_', "-")
    }

    /// `v0.1.2` becomes `v0.1`.
    pub fn minor_version(&self) -> String {
        self.pipeline_version
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.pipeline_name, self.pipeline_version)
    }
}

fn deserialize_parameters<'de, D>(
    deserializer: D,
) -> Result<IndexMap<String, ParameterValue>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let raw = IndexMap::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut out = IndexMap::with_capacity(raw.len());
    for (name, value) in raw {
        let parsed = match value {
            serde_json::Value::Null => ParameterValue::Fill,
            serde_json::Value::String(s) if s == FILL_SENTINEL => ParameterValue::Fill,
            serde_json::Value::String(s) => ParameterValue::Literal(s),
            serde_json::Value::Number(n) => ParameterValue::Literal(n.to_string()),
            serde_json::Value::Bool(b) => ParameterValue::Literal(b.to_string()),
            other => {
                return Err(D::Error::custom(format!(
                    "pipeline parameter `{name}` must be a scalar or null, got {other}"
                )))
            }
        };
        out.insert(name, parsed);
    }
    Ok(out)
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub fastq_by_run_dir: PathBuf,
    pub analysis_output_dir: PathBuf,
    pub analysis_work_dir: PathBuf,
    #[serde(default)]
    pub notification_email_addresses: Vec<String>,
    #[serde(default)]
    pub send_notification_emails: bool,
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
    pub pipelines: Vec<PipelineSpec>,

    #[serde(default = "default_max_concurrent_analyses")]
    pub max_concurrent_analyses: usize,
    #[serde(default)]
    pub excluded_runs: Vec<String>,
    #[serde(default = "default_run_id_patterns")]
    pub run_id_patterns: Vec<String>,
    #[serde(default = "default_completion_sentinel")]
    pub completion_sentinel: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub min_run_age: Option<Duration>,
    #[serde(default)]
    pub retry_interrupted: bool,
    #[serde(default)]
    pub allow_manual_retry: bool,
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,

    #[serde(default = "default_nextflow_binary")]
    pub nextflow_binary: String,
    #[serde(default = "default_pipeline_profile")]
    pub pipeline_profile: Option<String>,
    #[serde(default = "default_conda_cache_dir")]
    pub conda_cache_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub cleanup_work_dir: bool,
    #[serde(default = "default_diagnostic_tail_lines")]
    pub diagnostic_tail_lines: usize,

    #[serde(default = "default_notification_command")]
    pub notification_command: Vec<String>,
    #[serde(default)]
    pub notification_sender: Option<String>,
    /// Upper bound on one delivery attempt.
    #[serde(default = "default_notification_timeout", with = "humantime_serde")]
    pub notification_timeout: Duration,
}

fn default_scan_interval_seconds() -> u64 {
    60
}

fn default_max_concurrent_analyses() -> usize {
    1
}

fn default_run_id_patterns() -> Vec<String> {
    vec![
        GRIDION_RUN_ID_PATTERN.to_string(),
        PROMETHION_RUN_ID_PATTERN.to_string(),
    ]
}

fn default_completion_sentinel() -> Option<String> {
    Some("symlinks_complete.json".to_string())
}

fn default_nextflow_binary() -> String {
    "nextflow".to_string()
}

fn default_pipeline_profile() -> Option<String> {
    Some("conda".to_string())
}

fn default_conda_cache_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".conda").join("envs"))
}

fn default_true() -> bool {
    true
}

fn default_diagnostic_tail_lines() -> usize {
    50
}

fn default_notification_timeout() -> Duration {
    crate::notify::DEFAULT_SEND_TIMEOUT
}

fn default_notification_command() -> Vec<String> {
    vec!["sendmail".to_string(), "-t".to_string()]
}

impl OrchestratorConfig {
    /// Load from a `.json` file, or YAML for any other extension, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let cfg: OrchestratorConfig = if is_json {
            serde_json::from_str(&text).map_err(|source| ConfigError::JsonParse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            serde_yaml::from_str(&text).map_err(|source| ConfigError::YamlParse {
                path: path.to_path_buf(),
                source,
            })?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("fastq_by_run_dir", &self.fastq_by_run_dir),
            ("analysis_output_dir", &self.analysis_output_dir),
            ("analysis_work_dir", &self.analysis_work_dir),
        ] {
            if value.as_os_str().is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }
        if self.scan_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "scan_interval_seconds",
                "must be a positive number of seconds",
            ));
        }
        if self.max_concurrent_analyses == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_analyses",
                "must be at least 1",
            ));
        }
        if self.pipelines.is_empty() {
            return Err(ConfigError::invalid(
                "pipelines",
                "at least one pipeline is required",
            ));
        }
        for (idx, pipeline) in self.pipelines.iter().enumerate() {
            if pipeline.pipeline_name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("pipelines[{idx}].pipeline_name"),
                    "must not be empty",
                ));
            }
            if pipeline.pipeline_version.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("pipelines[{idx}].pipeline_version"),
                    "must not be empty",
                ));
            }
            for (name, value) in &pipeline.pipeline_parameters {
                if *value == ParameterValue::Fill && !FILLABLE_PARAMETERS.contains(&name.as_str())
                {
                    return Err(ConfigError::invalid(
                        format!("pipelines[{idx}].pipeline_parameters.{name}"),
                        format!(
                            "only {} can be filled by the orchestrator",
                            FILLABLE_PARAMETERS.join(", ")
                        ),
                    ));
                }
            }
        }
        for pattern in &self.run_id_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("run_id_patterns", e.to_string()))?;
        }
        if self.send_notification_emails {
            if self.notification_email_addresses.is_empty() {
                return Err(ConfigError::invalid(
                    "notification_email_addresses",
                    "required when send_notification_emails is true",
                ));
            }
            if self.notification_timeout.is_zero() {
                return Err(ConfigError::invalid(
                    "notification_timeout",
                    "must be greater than zero",
                ));
            }
            if self.notification_command.is_empty() {
                return Err(ConfigError::invalid(
                    "notification_command",
                    "must name a program when send_notification_emails is true",
                ));
            }
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
fastq_by_run_dir: /data/fastq_symlinks_by_run
analysis_output_dir: /data/analysis
analysis_work_dir: /scratch/work
notification_email_addresses: ["qc@example.org"]
send_notification_emails: true
scan_interval_seconds: 300
pipelines:
  - pipeline_name: BCCDC-PHL/routine_nanopore_qc
    pipeline_version: v0.1.2
    pipeline_parameters:
      fastq_input: null
      outdir: "to be filled by the orchestrator"
      min_read_length: 500
      skip_kraken: false
      db: /ref/kraken2
"#;

    fn write_config(ext: &str, body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("config.{ext}"));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(body.as_bytes())
            .unwrap();
        (dir, path)
    }

    #[test]
    fn loads_yaml_with_defaults() {
        let (_dir, path) = write_config("yaml", YAML);
        let cfg = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(cfg.scan_interval(), Duration::from_secs(300));
        assert_eq!(cfg.max_concurrent_analyses, 1);
        assert_eq!(cfg.shutdown_policy, ShutdownPolicy::Drain);
        assert_eq!(cfg.nextflow_binary, "nextflow");
        assert_eq!(cfg.notification_timeout, Duration::from_secs(60));
        assert_eq!(
            cfg.completion_sentinel.as_deref(),
            Some("symlinks_complete.json")
        );
        let params = &cfg.pipelines[0].pipeline_parameters;
        let names: Vec<&str> = params.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            ["fastq_input", "outdir", "min_read_length", "skip_kraken", "db"]
        );
        assert_eq!(params["fastq_input"], ParameterValue::Fill);
        assert_eq!(params["outdir"], ParameterValue::Fill);
        assert_eq!(
            params["min_read_length"],
            ParameterValue::Literal("500".into())
        );
        assert_eq!(params["skip_kraken"], ParameterValue::Literal("false".into()));
    }

    #[test]
    fn loads_json() {
        let body = r#"{
            "fastq_by_run_dir": "/in",
            "analysis_output_dir": "/out",
            "analysis_work_dir": "/work",
            "scan_interval_seconds": 10,
            "shutdown_policy": "terminate",
            "min_run_age": "5m",
            "pipelines": [{"pipeline_name": "org/p", "pipeline_version": "1.2.3",
                           "pipeline_parameters": {"outdir": null}}]
        }"#;
        let (_dir, path) = write_config("json", body);
        let cfg = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(cfg.shutdown_policy, ShutdownPolicy::Terminate);
        assert_eq!(cfg.min_run_age, Some(Duration::from_secs(300)));
        assert!(!cfg.send_notification_emails);
    }

    #[test]
    fn rejects_zero_interval() {
        let body = YAML.replace("scan_interval_seconds: 300", "scan_interval_seconds: 0");
        let (_dir, path) = write_config("yaml", &body);
        let err = OrchestratorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "scan_interval_seconds"));
    }

    #[test]
    fn rejects_missing_required_field() {
        let body = YAML.replace("analysis_work_dir: /scratch/work\n", "");
        let (_dir, path) = write_config("yaml", &body);
        let err = OrchestratorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::YamlParse { .. }));
        assert!(err.to_string().contains("analysis_work_dir"));
    }

    #[test]
    fn rejects_placeholder_for_unknown_parameter() {
        let body = YAML.replace("db: /ref/kraken2", "db: null");
        let (_dir, path) = write_config("yaml", &body);
        let err = OrchestratorConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("pipeline_parameters.db"));
    }

    #[test]
    fn rejects_notifications_without_recipients() {
        let body = YAML.replace(
            "notification_email_addresses: [\"qc@example.org\"]\n",
            "",
        );
        let (_dir, path) = write_config("yaml", &body);
        assert!(OrchestratorConfig::load(&path).is_err());
    }

    #[test]
    fn notification_timeout_is_a_human_duration() {
        let body = format!("{YAML}notification_timeout: 45s\n");
        let (_dir, path) = write_config("yaml", &body);
        let cfg = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(cfg.notification_timeout, Duration::from_secs(45));

        let body = format!("{YAML}notification_timeout: 0s\n");
        let (_dir, path) = write_config("yaml", &body);
        assert!(matches!(
            OrchestratorConfig::load(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = OrchestratorConfig::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn pipeline_naming_helpers() {
        let spec = PipelineSpec {
            pipeline_name: "BCCDC-PHL/routine_nanopore_qc".into(),
            pipeline_version: "v0.1.2".into(),
            pipeline_parameters: IndexMap::new(),
        };
        assert_eq!(spec.short_name(), "routine-nanopore-qc");
        assert_eq!(spec.minor_version(), "v0.1");
        let local = PipelineSpec {
            pipeline_name: "local_qc".into(),
            ..spec
        };
        assert_eq!(local.short_name(), "local-qc");
    }
}
