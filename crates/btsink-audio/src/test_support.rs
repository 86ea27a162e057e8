//! Scripted command runner shared by the backend tests.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::runner::{CommandOutput, CommandRunner};

/// Answers command lines from a fixed script and records every call.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    available: Mutex<Vec<String>>,
    responses: HashMap<String, CommandOutput>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub(crate) fn new(available: &[&str]) -> Self {
        Self {
            available: Mutex::new(available.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    /// Respond to `command_line` (program and args joined by spaces).
    pub(crate) fn respond(mut self, command_line: &str, output: CommandOutput) -> Self {
        self.responses.insert(command_line.to_string(), output);
        self
    }

    /// Replace the set of programs found on `PATH`.
    pub(crate) fn set_available(&self, available: &[&str]) {
        *self.available.lock().unwrap() = available.iter().map(|s| s.to_string()).collect();
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn was_called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    fn is_available(&self, program: &str) -> bool {
        self.available.lock().unwrap().iter().any(|p| p == program)
    }

    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line.clone());

        if !self.is_available(program) {
            return Err(io::Error::new(io::ErrorKind::NotFound, program.to_string()));
        }

        Ok(self
            .responses
            .get(&line)
            .cloned()
            .unwrap_or_else(|| CommandOutput::failed(1, format!("unscripted command: {}", line))))
    }
}
