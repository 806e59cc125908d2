use crate::config::{OrchestratorConfig, ParameterValue, PipelineSpec};
use crate::error::LaunchError;
use crate::model::Run;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

/// Launcher settings taken from the orchestrator config.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub nextflow_binary: String,
    pub profile: Option<String>,
    pub conda_cache_dir: Option<PathBuf>,
    pub output_root: PathBuf,
    pub work_root: PathBuf,
    pub diagnostic_tail_lines: usize,
}

impl LaunchSettings {
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            nextflow_binary: cfg.nextflow_binary.clone(),
            profile: cfg.pipeline_profile.clone(),
            conda_cache_dir: cfg.conda_cache_dir.clone(),
            output_root: cfg.analysis_output_dir.clone(),
            work_root: cfg.analysis_work_dir.clone(),
            diagnostic_tail_lines: cfg.diagnostic_tail_lines,
        }
    }
}

/// Fully resolved command line for one pipeline on one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub parameters: IndexMap<String, String>,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Invocation {
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

pub fn output_dir(output_root: &Path, run_id: &str, spec: &PipelineSpec) -> PathBuf {
    output_root.join(run_id).join(format!(
        "{}-{}-output",
        spec.short_name(),
        spec.minor_version()
    ))
}

pub fn work_dir(work_root: &Path, run_id: &str, spec: &PipelineSpec, at: OffsetDateTime) -> PathBuf {
    let stamp = at
        .format(format_description!(
            "[year][month][day][hour][minute][second]"
        ))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    work_root.join(format!("work-{run_id}-{}-{stamp}", spec.short_name()))
}

/// Substitute placeholders with the run's input directory and the computed output directory.
pub fn resolve_parameters(
    spec: &PipelineSpec,
    run: &Run,
    output_dir: &Path,
) -> Result<IndexMap<String, String>, LaunchError> {
    spec.pipeline_parameters
        .iter()
        .map(|(name, value)| {
            let resolved = match value {
                ParameterValue::Literal(v) => v.clone(),
                ParameterValue::Fill => match name.as_str() {
                    "fastq_input" => run.run_dir.display().to_string(),
                    "outdir" => output_dir.display().to_string(),
                    _ => {
                        return Err(LaunchError::UnresolvedParameter {
                            parameter: name.clone(),
                        })
                    }
                },
            };
            Ok((name.clone(), resolved))
        })
        .collect()
}

pub fn build_invocation(
    settings: &LaunchSettings,
    run: &Run,
    spec: &PipelineSpec,
    at: OffsetDateTime,
) -> Result<Invocation, LaunchError> {
    let output_dir = output_dir(&settings.output_root, &run.run_id, spec);
    let work_dir = work_dir(&settings.work_root, &run.run_id, spec, at);
    let parameters = resolve_parameters(spec, run, &output_dir)?;
    let trace_path = output_dir.join(format!("{}_trace.tsv", run.run_id));

    let mut args = vec![
        "run".to_string(),
        spec.pipeline_name.clone(),
        "-r".to_string(),
        spec.pipeline_version.clone(),
    ];
    if let Some(profile) = settings.profile.as_ref() {
        args.push("-profile".to_string());
        args.push(profile.clone());
    }
    if let Some(cache) = settings.conda_cache_dir.as_ref() {
        args.push("--cache".to_string());
        args.push(cache.display().to_string());
    }
    args.push("-work-dir".to_string());
    args.push(work_dir.display().to_string());
    args.push("-with-trace".to_string());
    args.push(trace_path.display().to_string());
    for (name, value) in &parameters {
        args.push(format!("--{name}"));
        args.push(value.clone());
    }

    Ok(Invocation {
        program: settings.nextflow_binary.clone(),
        args,
        parameters,
        work_dir,
        output_dir,
    })
}
