#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{command, value_parser, Arg, ArgAction};
use color_eyre::eyre::Result;

use crate::commands::Command;

mod commands;

use hpcflow::config::Settings;
use hpcflow::log::*;

fn cli() -> clap::Command {
    command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvvv.")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output. Overridden by -v.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("settings")
                .help("Path to the settings file. Defaults to $HPCFLOW_CONFIG, then the user config dir.")
                .short('c')
                .long("settings")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .subcommand(
            command!("run")
                .about("Run a workflow in the foreground.")
                .arg(
                    Arg::new("workflow")
                        .help("Name of the workflow to run.")
                        .required(true),
                )
                .arg(
                    Arg::new("config")
                        .help("Engine config entry as key=value. Repeatable.")
                        .long("config")
                        .num_args(1..)
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("dev")
                        .help("Run every step locally instead of through Slurm.")
                        .long("dev")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("workdir")
                        .help("Directory the engine writes its outputs to. Defaults to the current directory.")
                        .long("workdir")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(command!("workflows").about("List known workflows."))
        .subcommand(
            command!("cache")
                .about("Inspect the output cache.")
                .subcommand(
                    command!("list").about("List cached files.").arg(
                        Arg::new("db")
                            .help("Path to the cache database.")
                            .long("db")
                            .required(true)
                            .value_parser(value_parser!(PathBuf)),
                    ),
                )
                .subcommand_required(true),
        )
        .subcommand(
            command!("runs")
                .about("Show the most recent pipeline runs.")
                .arg(
                    Arg::new("db")
                        .help("Path to the cache database.")
                        .long("db")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("limit")
                        .help("How many runs to show.")
                        .short('n')
                        .long("limit")
                        .default_value("20")
                        .value_parser(value_parser!(usize)),
                ),
        )
        .subcommand(
            command!("status")
                .about("Look up a scheduler job on the cluster.")
                .arg(
                    Arg::new("job_id")
                        .help("Scheduler job id.")
                        .required(true),
                ),
        )
        .subcommand_required(true)
}

fn registry() -> HashMap<&'static str, Box<dyn Command>> {
    let mut handlers: HashMap<&'static str, Box<dyn Command>> = HashMap::new();
    handlers.insert("run", Box::new(commands::run::RunCommand::new()));
    handlers.insert("workflows", Box::new(commands::workflows::WorkflowsCommand::new()));
    handlers.insert("cache", Box::new(commands::cache::CacheCommand::new()));
    handlers.insert("runs", Box::new(commands::cache::RunsCommand::new()));
    handlers.insert("status", Box::new(commands::status::StatusCommand::new()));
    handlers
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre()?;
    let matches = cli().get_matches();

    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose") as usize;
    install_logger(level_for(quiet, verbose), LogFormat::Compact)?;

    let settings = Settings::load(matches.get_one::<PathBuf>("settings").map(PathBuf::as_path))?;

    if let Some((subcommand, matches)) = matches.subcommand() {
        let ctx = commands::CliContext::new(&settings, matches);
        debug!(
            "matched subcommand {} with matches: {:?}",
            &subcommand,
            &matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
        );
        let handlers = registry();
        match handlers.get(subcommand) {
            Some(command) => command.run(&ctx).await?,
            None => return Err(commands::CommandErrors::InvalidSubcommand(subcommand.into()).into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn test_every_subcommand_is_registered() {
        let handlers = registry();
        for sub in cli().get_subcommands() {
            assert!(handlers.contains_key(sub.get_name()), "{} has no handler", sub.get_name());
        }
    }

    #[test]
    fn test_run_collects_config_pairs() -> Result<()> {
        let matches = cli().try_get_matches_from([
            "hpcflow",
            "-vv",
            "run",
            "selftest",
            "--config",
            "input_file=/data/a.txt",
            "cache_db=/data/project.db",
            "--dev",
        ])?;
        assert_eq!(2, matches.get_count("verbose"));
        let (name, run) = matches.subcommand().unwrap();
        assert_eq!("run", name);
        assert!(run.get_flag("dev"));
        let pairs: Vec<&String> = run.get_many::<String>("config").unwrap().collect();
        assert_eq!(2, pairs.len());
        Ok(())
    }
}
