use hpcflow::config::Settings;
use hpcflow::ipc::{SubmitRequest, SubmitResponse};
use hpcflow::jobs::runner::JobRunner;
use hpcflow::log::*;

const WORKFLOW_PLACEHOLDER: &str = "{workflow}";
const TARGET_PLACEHOLDER: &str = "{target}";

/// Turns submissions into the shell command run on the login node.
#[derive(Debug, Clone)]
pub struct Submitter {
    template: String,
    default_workflow: String,
}

impl Submitter {
    pub fn new<T: Into<String>, W: Into<String>>(template: T, default_workflow: W) -> Self {
        Self {
            template: template.into(),
            default_workflow: default_workflow.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.remote().launch_template().clone(),
            settings.controller().default_workflow().clone(),
        )
    }

    /// Fill the launch template. Both values are shell-quoted.
    pub fn command_for(&self, workflow: Option<&str>, target: &str) -> String {
        let workflow = workflow.unwrap_or(&self.default_workflow);
        self.template
            .replace(WORKFLOW_PLACEHOLDER, &shell_words::quote(workflow))
            .replace(TARGET_PLACEHOLDER, &shell_words::quote(target))
    }

    /// Record the job and hand it to the runner. Returns at once.
    #[tracing::instrument(skip(self, runner))]
    pub fn submit(&self, runner: &JobRunner, request: SubmitRequest) -> SubmitResponse {
        let job_id = nanoid::nanoid!();
        let command = self.command_for(request.workflow.as_deref(), &request.target);
        runner
            .store()
            .create(&job_id, request.target.clone(), request.owner.clone());
        info!("submitting job {}: {}", job_id, command);
        // The runner owns the task from here; the handle is not needed.
        let _handle = runner.submit(&job_id, &command);
        SubmitResponse {
            job_id,
            accepted: true,
        }
    }
}
