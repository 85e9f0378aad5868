/// Literal shell commands executed in the sandbox
use super::runner::StepContext;
use crate::config::types::Result;
use crate::results::{html, PipeResult};
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandEntry {
    Line(String),
    Detailed {
        cmd: String,
        /// Include the command's output in the report
        #[serde(default = "show_output")]
        output: bool,
    },
}

fn show_output() -> bool {
    true
}

impl CommandEntry {
    pub fn command(&self) -> &str {
        match self {
            CommandEntry::Line(cmd) | CommandEntry::Detailed { cmd, .. } => cmd,
        }
    }

    pub fn shows_output(&self) -> bool {
        match self {
            CommandEntry::Line(_) => true,
            CommandEntry::Detailed { output, .. } => *output,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandsParams {
    pub commands: Vec<CommandEntry>,
}

pub fn run(ctx: &mut StepContext<'_>, params: &CommandsParams) -> Result<PipeResult> {
    let mut pipe = ctx.new_pipe();
    let limits = ctx.build_limits();

    for entry in &params.commands {
        let command = entry.command();
        info!("running command: {}", command);
        let out = ctx.sandbox.run_shell(command, limits.clone())?;
        let combined = out.combined();
        let shown = entry.shows_output().then_some(combined.as_str());
        pipe.html
            .push_str(&html::command_block(command, shown, out.exit_code()));

        if !out.success() {
            warn!("command '{}' failed with {}", command, out.exit_code());
            for error in out.usage.errors() {
                pipe.html.push_str(&html::error(&error));
            }
            pipe.html.push_str(&html::error(&format!(
                "Command '{}' failed with exit code {}",
                command,
                out.exit_code()
            )));
            pipe.failed = true;
            break;
        }
    }
    Ok(pipe)
}
