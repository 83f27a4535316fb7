use async_trait::async_trait;
use color_eyre::eyre::Result;
use hpcflow::pipeline::{WorkflowDefinition, WorkflowRegistry};

use super::{CliContext, Command};

pub fn describe(registry: &WorkflowRegistry) -> Vec<String> {
    let mut lines = vec![];
    for definition in registry.definitions() {
        lines.push(format!("** {}: {}", definition.name, definition.snakefile));
        lines.extend(describe_images(definition));
        for (tool, outputs) in &definition.cache_outputs {
            lines.push(format!("*** cached step {}: {}", tool, outputs.join(", ")));
        }
    }
    lines
}

fn describe_images(definition: &WorkflowDefinition) -> Vec<String> {
    definition
        .images
        .iter()
        .map(|image| format!("*** image {}:{}", image.name, image.version))
        .collect()
}

pub struct WorkflowsCommand;

#[async_trait]
impl Command for WorkflowsCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &CliContext<'_>) -> Result<()> {
        let registry = context.registry();
        println!("* workflows:");
        for line in describe(&registry) {
            println!("{}", line);
        }
        Ok(())
    }
}
