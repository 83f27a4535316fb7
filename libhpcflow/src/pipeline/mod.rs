//! Running a pipeline engine in the foreground, with the output cache
//! wrapped around it.
//!
//! [`Orchestrator::run_pipeline`] is what `hpcflow run` does on the cluster:
//! fetch the workflow's container images, restore cached step outputs, run
//! the engine, parse what it printed, then store outputs and write the run
//! log. Every run ends in exactly one [`PipelineReport`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::cache::runlog::RunStatus;
use crate::cache::{content_digest, CacheMap, OutputCache};
use crate::config::EngineSettings;
use crate::executor::Executor;
use crate::jobs::parse::{self, CACHE_HIT_PREFIX, CONTAINER_MARKER};
use crate::jobs::ContainerRef;
use crate::log::*;

pub mod images;

use images::ImageProvider;

/// Config keys naming the cache database, in lookup order.
pub const CACHE_DB_KEYS: [&str; 2] = ["cache_db", "margie_db"];
/// Config keys naming the pipeline input file, in lookup order.
pub const INPUT_FILE_KEYS: [&str; 2] = ["input_fasta", "input_file"];

/// Characters of engine stdout kept in a [`RunResult`].
pub const STDOUT_TAIL_CHARS: usize = 2000;

const STEM_PLACEHOLDER: &str = "{stem}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub version: String,
    /// Expected SHA-256 of the image file, checked after every fetch.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ImageSpec {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            sha256: None,
        }
    }
}

/// A named workflow: the engine file to run, the images it needs and the
/// outputs each of its steps leaves behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub snakefile: String,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
    /// Step name to output path templates, relative to the work dir.
    /// `{stem}` is replaced with the input file's stem.
    #[serde(default)]
    pub cache_outputs: BTreeMap<String, Vec<String>>,
}

impl WorkflowDefinition {
    /// Concrete output paths per step for one input file.
    pub fn cache_map(&self, input: &Path, workdir: &Path) -> CacheMap {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.cache_outputs
            .iter()
            .map(|(tool, templates)| {
                let paths = templates
                    .iter()
                    .map(|template| workdir.join(template.replace(STEM_PLACEHOLDER, &stem)))
                    .collect();
                (tool.clone(), paths)
            })
            .collect()
    }
}

fn outputs(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(tool, paths)| {
            (
                tool.to_string(),
                paths.iter().map(|path| path.to_string()).collect(),
            )
        })
        .collect()
}

/// Workflows by name. Names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.insert(WorkflowDefinition {
            name: "selftest".into(),
            snakefile: "selftest.smk".into(),
            images: vec![],
            cache_outputs: outputs(&[
                ("step_a", &["step_a/{stem}-step_a.out", "step_a/{stem}-step_a.extra"]),
                ("step_a_db", &["step_a/{stem}-step_a_db.tkn"]),
                ("step_b", &["step_b/{stem}-step_b.out"]),
                ("step_b_db", &["step_b/{stem}-step_b_db.tkn"]),
                ("step_c", &["step_c/{stem}-step_c.tsv", "step_c/{stem}-step_c_count.tsv"]),
                ("step_c_db", &["step_c/{stem}-step_c_db.tkn"]),
            ]),
        });
        registry.insert(WorkflowDefinition {
            name: "example".into(),
            snakefile: "example.smk".into(),
            images: vec![ImageSpec::new("prodigal", "2.6.3-v1.0")],
            cache_outputs: outputs(&[("prodigal", &["prodigal/{stem}-prodigal.gff"])]),
        });
        registry.insert(WorkflowDefinition {
            name: "margie".into(),
            snakefile: "margie.smk".into(),
            images: vec![
                ImageSpec::new("prodigal", "2.6.3-v1.0"),
                ImageSpec::new("pfam", "3.4-v1.0"),
                ImageSpec::new("cog", "2024-v1.0"),
            ],
            cache_outputs: outputs(&[
                ("prodigal", &["prodigal/{stem}-prodigal.gff", "prodigal/{stem}-prodigal.faa"]),
                ("prodigal_db", &["prodigal/{stem}-prodigal_db.tkn"]),
                ("pfam", &["pfam/{stem}-pfam.tsv"]),
                ("pfam_db", &["pfam/{stem}-pfam_db.tkn"]),
                ("cog", &["cog/{stem}-cog.tsv"]),
                ("cog_db", &["cog/{stem}-cog_db.tkn"]),
            ]),
        });
        registry
    }

    /// Replace or add definitions, typically from the settings file.
    pub fn with_overrides(mut self, definitions: &[WorkflowDefinition]) -> Self {
        for definition in definitions {
            debug!("registering workflow '{}'", definition.name);
            self.insert(definition.clone());
        }
        self
    }

    fn insert(&mut self, definition: WorkflowDefinition) {
        self.workflows
            .insert(definition.name.to_lowercase(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        self.workflows.values().map(|w| w.name.as_str()).collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows.values()
    }
}

/// Local development runs everything on the current machine; cluster mode
/// hands every step to Slurm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Dev,
    Cluster,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Dev => f.write_str("dev"),
            RunMode::Cluster => f.write_str("cluster"),
        }
    }
}

/// The engine's argv for one run. Config entries become `--config k=v`
/// pairs in key order.
pub fn build_invocation(
    definition: &WorkflowDefinition,
    engine: &EngineSettings,
    config: &BTreeMap<String, String>,
    mode: RunMode,
) -> Vec<String> {
    let snakefile = match engine.workflow_dir() {
        Some(dir) if Path::new(&definition.snakefile).is_relative() => {
            dir.join(&definition.snakefile).display().to_string()
        }
        _ => definition.snakefile.clone(),
    };

    let mut argv = vec![
        engine.executable().clone(),
        "-s".to_string(),
        snakefile,
        "--cores".to_string(),
        engine.cores().to_string(),
        "--keep-going".to_string(),
    ];
    if !definition.images.is_empty() {
        argv.push("--use-apptainer".to_string());
    }

    if mode == RunMode::Cluster {
        argv.push("--executor=slurm".to_string());
        argv.push("--jobs".to_string());
        argv.push(engine.jobs().to_string());
        argv.push("--default-resources".to_string());
        if let Some(account) = engine.slurm_account() {
            argv.push(format!("slurm_account={}", account));
        }
        if let Some(partition) = engine.slurm_partition() {
            argv.push(format!("slurm_partition={}", partition));
        }
        argv.push(format!("mem_mb={}", engine.mem_mb()));
        argv.push(format!("runtime={}", engine.runtime_minutes()));
    }

    if !config.is_empty() {
        argv.push("--config".to_string());
        argv.extend(config.iter().map(|(k, v)| format!("{}={}", k, v)));
    }
    argv
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesSummary {
    pub completed: u32,
    pub total: u32,
    pub failed: u32,
    pub failed_rules: Vec<String>,
}

/// Summarize the engine's stderr. The last progress line wins; without one
/// the total is whatever completed plus whatever failed.
pub fn parse_engine_output(stderr: &str) -> RulesSummary {
    let failed_rules = parse::failed_rules(stderr);
    let failed = failed_rules.len() as u32;
    let (completed, total) = match parse::last_progress(stderr) {
        Some(progress) => (progress.done, progress.total),
        None => (0, failed),
    };
    RulesSummary {
        completed,
        total,
        failed,
        failed_rules,
    }
}

fn tail(text: &str, chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(chars)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub workflow: String,
    pub returncode: i32,
    pub rules_summary: RulesSummary,
    pub stdout_tail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PipelineReport {
    Success {
        message: String,
        result: RunResult,
    },
    Failure {
        message: String,
        result: Option<RunResult>,
    },
}

impl PipelineReport {
    fn failure<S: Into<String>>(message: S) -> Self {
        PipelineReport::Failure {
            message: message.into(),
            result: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PipelineReport::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            PipelineReport::Success { message, .. } | PipelineReport::Failure { message, .. } => {
                message
            }
        }
    }

    pub fn result(&self) -> Option<&RunResult> {
        match self {
            PipelineReport::Success { result, .. } => Some(result),
            PipelineReport::Failure { result, .. } => result.as_ref(),
        }
    }
}

/// Where progress lines for whoever is watching this process go. When the
/// process runs under the job runner, these lines are what it scrapes.
pub trait Announce: std::fmt::Debug + Send + Sync {
    fn announce(&self, line: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutAnnounce;

impl Announce for StdoutAnnounce {
    fn announce(&self, line: &str) {
        println!("{}", line);
    }
}

fn first_of<'a>(config: &'a BTreeMap<String, String>, keys: &[&str]) -> Option<&'a String> {
    keys.iter().find_map(|key| config.get(*key))
}

#[derive(Getters, Debug, Clone)]
pub struct Orchestrator {
    registry: WorkflowRegistry,
    engine: EngineSettings,
    executor: Arc<dyn Executor>,
    images: Arc<dyn ImageProvider>,
    announce: Arc<dyn Announce>,
}

impl Orchestrator {
    pub fn new(
        registry: WorkflowRegistry,
        engine: EngineSettings,
        executor: Arc<dyn Executor>,
        images: Arc<dyn ImageProvider>,
        announce: Arc<dyn Announce>,
    ) -> Self {
        Self {
            registry,
            engine,
            executor,
            images,
            announce,
        }
    }

    #[tracing::instrument(skip(self, config, cache_map))]
    pub async fn run_pipeline(
        &self,
        name: &str,
        config: &BTreeMap<String, String>,
        cache_map: Option<&CacheMap>,
        mode: RunMode,
    ) -> PipelineReport {
        let Some(definition) = self.registry.get(name) else {
            error!("unknown workflow '{}'", name);
            return PipelineReport::failure(format!(
                "unknown workflow '{}' (known: {})",
                name,
                self.registry.names().join(", ")
            ));
        };

        for image in &definition.images {
            match self.images.ensure(image).await {
                Ok(path) => {
                    let container = ContainerRef {
                        name: Some(image.name.clone()),
                        version: Some(image.version.clone()),
                        sif: Some(path.display().to_string()),
                        extra: BTreeMap::new(),
                    };
                    match serde_json::to_string(&container) {
                        Ok(json) => self.announce.announce(&format!("{}{}", CONTAINER_MARKER, json)),
                        Err(e) => warn!("could not encode container metadata: {}", e),
                    }
                }
                Err(e) => {
                    error!("image {}:{} unavailable: {}", image.name, image.version, e);
                    return PipelineReport::failure(format!(
                        "could not prepare image {}:{}: {}",
                        image.name, image.version, e
                    ));
                }
            }
        }

        let cache = first_of(config, &CACHE_DB_KEYS).map(OutputCache::new);
        let input = first_of(config, &INPUT_FILE_KEYS).map(PathBuf::from);

        if let (Some(map), Some(cache), Some(input)) = (cache_map, &cache, &input) {
            self.restore_outputs(cache, input, map).await;
        }

        let argv = build_invocation(definition, &self.engine, config, mode);
        let output = match self.executor.execute(&argv).await {
            Ok(output) => output,
            Err(e) => {
                error!("could not launch the engine: {}", e);
                return PipelineReport::failure(format!("could not launch workflow '{}': {}", name, e));
            }
        };

        let rules_summary = parse_engine_output(&output.stderr);
        let result = RunResult {
            workflow: definition.name.clone(),
            returncode: output.returncode,
            rules_summary,
            stdout_tail: tail(&output.stdout, STDOUT_TAIL_CHARS),
        };

        if result.returncode != 0 {
            warn!(
                "workflow '{}' exited with {}; failed rules: {:?}",
                name, result.returncode, result.rules_summary.failed_rules
            );
            if let (Some(cache), Some(input)) = (&cache, &input) {
                self.log_run(cache, input, &definition.name, &result, RunStatus::Failed)
                    .await;
            }
            let message = if result.rules_summary.failed_rules.is_empty() {
                format!("workflow '{}' failed with exit code {}", name, result.returncode)
            } else {
                format!(
                    "workflow '{}' failed with exit code {} (failed rules: {})",
                    name,
                    result.returncode,
                    result.rules_summary.failed_rules.join(", ")
                )
            };
            return PipelineReport::Failure {
                message,
                result: Some(result),
            };
        }

        if let (Some(cache), Some(input)) = (&cache, &input) {
            if let Some(map) = cache_map {
                self.store_outputs(cache, input, map).await;
            }
            self.log_run(cache, input, &definition.name, &result, RunStatus::Success)
                .await;
        }

        PipelineReport::Success {
            message: format!(
                "workflow '{}' finished: {} of {} steps done",
                name, result.rules_summary.completed, result.rules_summary.total
            ),
            result,
        }
    }

    async fn restore_outputs(&self, cache: &OutputCache, input: &Path, map: &CacheMap) {
        let (cache, input, map) = (cache.clone(), input.to_path_buf(), map.clone());
        let hits = match tokio::task::spawn_blocking(move || cache.restore_all(&input, &map)).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("cache restore did not complete: {}", e);
                return;
            }
        };
        for (tool, hit) in hits {
            if hit {
                self.announce
                    .announce(&format!("* {}{}", CACHE_HIT_PREFIX, tool));
            } else {
                debug!("cache miss for {}", tool);
            }
        }
    }

    async fn store_outputs(&self, cache: &OutputCache, input: &Path, map: &CacheMap) {
        let (cache, input, map) = (cache.clone(), input.to_path_buf(), map.clone());
        match tokio::task::spawn_blocking(move || cache.store_all(&input, &map)).await {
            Ok(stored) => info!("cached {} output files", stored),
            Err(e) => warn!("cache store did not complete: {}", e),
        }
    }

    async fn log_run(
        &self,
        cache: &OutputCache,
        input: &Path,
        workflow: &str,
        result: &RunResult,
        status: RunStatus,
    ) {
        let (cache, input, workflow) = (cache.clone(), input.to_path_buf(), workflow.to_string());
        let completed = result.rules_summary.completed;
        let recorded = tokio::task::spawn_blocking(move || {
            let digest = content_digest(&input)?;
            cache.record_run(&digest, &workflow, &input, completed, status)
        })
        .await;
        match recorded {
            Ok(Ok(run_id)) => info!("recorded {} run {}", status, run_id),
            Ok(Err(e)) => warn!("could not record run: {}", e),
            Err(e) => warn!("run log write did not complete: {}", e),
        }
    }
}
