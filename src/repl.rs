use std::sync::Arc;

use rustyline::{DefaultEditor, error::ReadlineError};
use tracing::debug;

use crate::{
    diagnostics::Result,
    output::OutputSink,
    runtime::{Context, Runtime},
    threads::ThreadManager,
    value::Value,
};

const SOURCE_NAME: &str = "<stdin>";

/// What one input line asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Skip,
    Quit,
    Value(Value),
}

/// Line loop over one persistent context: every line is a program run on
/// the manager and awaited before the next prompt.
pub struct Repl {
    manager: ThreadManager,
    context: Context,
}

impl Repl {
    pub fn new(runtime: &Runtime, output: Arc<dyn OutputSink>) -> Self {
        Self {
            manager: runtime.thread_manager(),
            context: runtime.context(output),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn manager(&self) -> &ThreadManager {
        &self.manager
    }

    pub fn handle_line(&mut self, line: &str) -> Result<LineOutcome> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(LineOutcome::Skip);
        }
        if trimmed == "quit" || trimmed == "exit" {
            return Ok(LineOutcome::Quit);
        }
        let future = self
            .manager
            .start_future(&self.context, SOURCE_NAME, trimmed)?;
        Ok(LineOutcome::Value(future.wait()?))
    }

    pub fn run(&mut self) -> Result<()> {
        let mut editor = DefaultEditor::new().map_err(|err| std::io::Error::other(err.to_string()))?;
        loop {
            match editor.readline(">> ") {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.trim());
                    match self.handle_line(&line)? {
                        LineOutcome::Skip => {}
                        LineOutcome::Quit => break,
                        LineOutcome::Value(value) if value.is_null() => {}
                        LineOutcome::Value(value) => {
                            self.context.output().write_line(&value.repr());
                        }
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => return Err(std::io::Error::other(err.to_string()).into()),
            }
        }
        debug!("repl finished");
        self.manager.stop();
        Ok(())
    }
}
