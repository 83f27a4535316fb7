use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::Result;
use hpcflow::config::Settings;
use hpcflow::pipeline::WorkflowRegistry;
use thiserror::Error;

pub mod cache;
pub mod run;
pub mod status;
pub mod workflows;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Required argument `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Config entry `{0}` is not of the form key=value.")]
    InvalidConfigPair(String),
    #[error("`{0}` is not a scheduler job id.")]
    InvalidJobId(String),
    #[error("Workflow failed: {0}")]
    PipelineFailed(String),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("No subcommand provided.")]
    NoSubcommandProvided,
}

pub struct CliContext<'a> {
    pub settings: &'a Settings,
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(settings: &'a Settings, matches: &'a ArgMatches) -> Self {
        Self { settings, matches }
    }

    /// Built-in workflows with the settings file's definitions on top.
    pub fn registry(&self) -> WorkflowRegistry {
        WorkflowRegistry::builtin().with_overrides(self.settings.workflows())
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &CliContext<'_>) -> Result<()>;
}

pub trait Arguments {
    /// Read a required string argument.
    fn read_argument(&self, arg_matches: &ArgMatches, id: &str) -> Result<String, CommandErrors> {
        arg_matches
            .get_one::<String>(id)
            .cloned()
            .ok_or_else(|| CommandErrors::RequiredUserInputMissing(id.into()))
    }
}
