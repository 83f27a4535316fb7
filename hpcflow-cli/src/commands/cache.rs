use std::path::PathBuf;

use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::Result;
use hpcflow::cache::runlog::RunRecord;
use hpcflow::cache::{CacheEntry, OutputCache};
use hpcflow::log::*;

use super::{CliContext, Command, CommandErrors};

fn database(matches: &ArgMatches) -> Result<OutputCache, CommandErrors> {
    matches
        .get_one::<PathBuf>("db")
        .map(OutputCache::new)
        .ok_or_else(|| CommandErrors::RequiredUserInputMissing("db".into()))
}

pub fn render_entries(entries: &[CacheEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            format!(
                "** {} {} {} ({} bytes, {})",
                entry.input_hash, entry.tool, entry.filename, entry.size_bytes, entry.cached_at
            )
        })
        .collect()
}

pub fn render_runs(runs: &[RunRecord]) -> Vec<String> {
    runs.iter()
        .map(|run| {
            format!(
                "** {} {} {} {} ({} rules, input {} {})",
                run.loaded_at,
                run.run_id,
                run.workflow_name,
                run.status,
                run.rules_completed,
                run.input_hash,
                run.input_path
            )
        })
        .collect()
}

pub struct CacheCommand;

impl CacheCommand {
    async fn subcommand_list(&self, matches: &ArgMatches) -> Result<()> {
        let cache = database(matches)?;
        let entries = tokio::task::spawn_blocking(move || cache.entries()).await??;
        info!("{} cached files", entries.len());
        println!("* {} cached files", entries.len());
        for line in render_entries(&entries) {
            println!("{}", line);
        }
        Ok(())
    }
}

#[async_trait]
impl Command for CacheCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &CliContext<'_>) -> Result<()> {
        match context.matches.subcommand() {
            Some(("list", matches)) => self.subcommand_list(matches).await,
            Some((name, _)) => Err(CommandErrors::InvalidSubcommand(name.into()).into()),
            None => Err(CommandErrors::NoSubcommandProvided.into()),
        }
    }
}

pub struct RunsCommand;

#[async_trait]
impl Command for RunsCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &CliContext<'_>) -> Result<()> {
        let cache = database(context.matches)?;
        let limit = context.matches.get_one::<usize>("limit").copied().unwrap_or(20);
        let runs = tokio::task::spawn_blocking(move || cache.runs(limit)).await??;
        println!("* {} runs", runs.len());
        for line in render_runs(&runs) {
            println!("{}", line);
        }
        Ok(())
    }
}
