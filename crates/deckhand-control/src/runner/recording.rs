//! Scripted command runner for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};

use super::{render, CommandOutput, CommandRunner};

/// A command invocation seen by [`RecordingRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Program name.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

impl RecordedCall {
    /// The call as a single space-separated line.
    #[must_use]
    pub fn line(&self) -> String {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        render(&self.program, &args)
    }
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<RecordedCall>,
    responses: HashMap<String, Vec<CommandOutput>>,
    fallback: Option<CommandOutput>,
}

/// Records every call and answers from scripted responses.
///
/// Responses are looked up by the full command line, then by program plus
/// first argument, then by program alone. Queued responses for a key are
/// consumed in order and the last one repeats. Unmatched calls get the
/// fallback, which defaults to an empty success.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    script: Mutex<Script>,
}

impl RecordingRunner {
    /// Create a runner where every command succeeds with no output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a command key.
    pub fn respond(&self, key: impl Into<String>, output: CommandOutput) {
        if let Ok(mut script) = self.script.lock() {
            script.responses.entry(key.into()).or_default().push(output);
        }
    }

    /// Response for commands matching no key.
    pub fn set_fallback(&self, output: CommandOutput) {
        if let Ok(mut script) = self.script.lock() {
            script.fallback = Some(output);
        }
    }

    /// All calls so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script
            .lock()
            .map(|script| script.calls.clone())
            .unwrap_or_default()
    }

    /// Command lines of all calls so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::line).collect()
    }

    /// Whether any call starts with `prefix`.
    #[must_use]
    pub fn called(&self, prefix: &str) -> bool {
        self.call_count(prefix) > 0
    }

    /// Number of calls starting with `prefix`.
    #[must_use]
    pub fn call_count(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

fn take(queue: &mut Vec<CommandOutput>) -> Option<CommandOutput> {
    match queue.len() {
        0 => None,
        1 => queue.first().cloned(),
        _ => Some(queue.remove(0)),
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[&str]) -> ControlResult<CommandOutput> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let call = RecordedCall {
            program: program.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        };
        let full = call.line();
        script.calls.push(call);

        let mut keys = vec![full];
        if let Some(first) = args.first() {
            keys.push(format!("{program} {first}"));
        }
        keys.push(program.to_owned());

        for key in keys {
            if let Some(output) = script.responses.get_mut(&key).and_then(take) {
                return Ok(output);
            }
        }

        Ok(script
            .fallback
            .clone()
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}
