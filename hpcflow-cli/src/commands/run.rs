use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use hpcflow::executor::simple::SimpleExecutor;
use hpcflow::executor::Executor;
use hpcflow::log::*;
use hpcflow::pipeline::images::ApptainerImages;
use hpcflow::pipeline::{Orchestrator, PipelineReport, RunMode, StdoutAnnounce, INPUT_FILE_KEYS};

use super::{Arguments, CliContext, Command, CommandErrors};

pub struct RunCommand;

impl Arguments for RunCommand {}

/// Parse `key=value` entries. Later entries win.
pub fn parse_config_pairs<'a, I>(pairs: I) -> Result<BTreeMap<String, String>, CommandErrors>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut config = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                config.insert(key.trim().to_string(), value.to_string());
            }
            _ => return Err(CommandErrors::InvalidConfigPair(pair.clone())),
        }
    }
    Ok(config)
}

fn print_report(report: &PipelineReport) -> Result<()> {
    if report.is_success() {
        println!("* {}", report.message());
    } else {
        println!("* FAILED: {}", report.message());
    }
    if let Some(result) = report.result() {
        let summary = &result.rules_summary;
        println!(
            "** steps: {} of {} done, {} failed",
            summary.completed, summary.total, summary.failed
        );
        for rule in &summary.failed_rules {
            println!("*** failed rule: {}", rule);
        }
    }
    println!(
        "{}",
        serde_json::to_string(report).wrap_err("encoding pipeline report")?
    );
    Ok(())
}

#[async_trait]
impl Command for RunCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &CliContext<'_>) -> Result<()> {
        let matches = context.matches;
        let workflow = self.read_argument(matches, "workflow")?;
        let config = match matches.get_many::<String>("config") {
            Some(pairs) => parse_config_pairs(pairs)?,
            None => BTreeMap::new(),
        };
        let mode = if matches.get_flag("dev") {
            RunMode::Dev
        } else {
            RunMode::Cluster
        };
        let workdir = match matches.get_one::<PathBuf>("workdir") {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().wrap_err("reading current directory")?,
        };

        let registry = context.registry();
        let cache_map = match (
            registry.get(&workflow),
            INPUT_FILE_KEYS.iter().find_map(|key| config.get(*key)),
        ) {
            (Some(definition), Some(input)) => {
                Some(definition.cache_map(&PathBuf::from(input), &workdir))
            }
            _ => None,
        };
        debug!("running {} in {} mode with {:?}", workflow, mode, config);

        let engine = context.settings.engine().clone();
        let executor: Arc<dyn Executor> = Arc::new(SimpleExecutor::new().echoing().in_dir(&workdir));
        let images = Arc::new(ApptainerImages::from_settings(&engine, executor.clone())?);
        let orchestrator = Orchestrator::new(
            registry,
            engine,
            executor,
            images,
            Arc::new(StdoutAnnounce),
        );

        let report = orchestrator
            .run_pipeline(&workflow, &config, cache_map.as_ref(), mode)
            .await;
        print_report(&report)?;

        if report.is_success() {
            Ok(())
        } else {
            Err(CommandErrors::PipelineFailed(report.message().to_string()).into())
        }
    }
}
