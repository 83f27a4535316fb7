use async_trait::async_trait;
use color_eyre::eyre::Result;
use hpcflow::log::*;
use hpcflow::remote::slurm::{self, StatusRecord};
use hpcflow::remote::Connection;

use super::{Arguments, CliContext, Command, CommandErrors};

pub fn render(job_id: &str, record: &StatusRecord) -> String {
    match (&record.job_name, record.exists) {
        (_, false) => format!("* {}: {}", job_id, record.state),
        (Some(name), true) => format!("* {} ({}): {} after {}", job_id, name, record.state, record.elapsed),
        (None, true) => format!("* {}: {} after {}", job_id, record.state, record.elapsed),
    }
}

pub struct StatusCommand;

impl Arguments for StatusCommand {}

#[async_trait]
impl Command for StatusCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &CliContext<'_>) -> Result<()> {
        let job_id = self.read_argument(context.matches, "job_id")?;
        if !slurm::is_job_id(&job_id) {
            return Err(CommandErrors::InvalidJobId(job_id).into());
        }

        let connection = Connection::from_settings(context.settings.cluster()).await?;
        let mut session = connection.connect().await?;
        let record = slurm::query_job_status(&mut session, &job_id).await;
        session.close().await;
        let record = record?;

        debug!("status of {}: {:?}", job_id, record);
        println!("{}", render(&job_id, &record));
        Ok(())
    }
}
