#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{command, value_parser, Arg, ArgAction};
use color_eyre::eyre::Result;
use hpcflow::config::Settings;
use hpcflow::jobs::events::EventTiming;
use hpcflow::jobs::runner::JobRunner;
use hpcflow::jobs::store::JobStore;
use hpcflow::log::*;
use hpcflow::remote::cluster::SshCluster;
use hpcflow::remote::Connection;

mod executor;
mod http_server;

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre()?;
    let matches = command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvvv.")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output. Overridden by -v.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json-logs")
                .help("Write logs as JSON lines.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("settings")
                .help("Path to the settings file. Defaults to $HPCFLOW_CONFIG, then the user config dir.")
                .short('c')
                .long("settings")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("port")
                .help("Port to listen on. Overrides the settings file.")
                .short('p')
                .long("port")
                .value_parser(value_parser!(u16)),
        )
        .get_matches();

    let format = if matches.get_flag("json") {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    let level = level_for(matches.get_flag("quiet"), matches.get_count("verbose") as usize);
    install_logger(level, format)?;

    let settings = Settings::load(matches.get_one::<PathBuf>("settings").map(PathBuf::as_path))?;
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .unwrap_or(*settings.controller().port());

    let connection = Connection::from_settings(settings.cluster()).await?;
    let cluster = Arc::new(SshCluster::new(connection, settings.remote().clone()));
    let runner = JobRunner::from_settings(Arc::new(JobStore::new()), cluster, settings.jobs());
    let state = http_server::ServerState {
        runner,
        submitter: executor::Submitter::from_settings(&settings),
        timing: EventTiming::from(settings.events()),
        remote: settings.remote().clone(),
    };

    println!(
        "* submitting to {}@{}, listening on port {}",
        settings.cluster().username(),
        settings.cluster().host(),
        port
    );
    http_server::run_server(port, state).await
}
