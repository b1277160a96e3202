//! Scripted executor for engine tests.
//!
//! Every command the engine issues is recorded as one line:
//! `run <host>> <argv...>` or `pipe <sender> => <receiver>`. Rules match a
//! substring of that line (or a suffix when the needle ends in `$`) and
//! play back canned output; unmatched commands succeed with empty output,
//! which conveniently models "dataset exists" and "no snapshots".

use std::collections::VecDeque;
use std::sync::Mutex;
use xync_core::error::ExecError;
use xync_core::exec::{CommandOutput, CommandSpec, Executor};

#[derive(Clone)]
struct Canned {
    stdout: String,
    status: i32,
}

struct Rule {
    needle: String,
    responses: VecDeque<Canned>,
}

impl Rule {
    fn matches(&self, line: &str) -> bool {
        match self.needle.strip_suffix('$') {
            Some(suffix) => line.ends_with(suffix),
            None => line.contains(&self.needle),
        }
    }

    fn next(&mut self) -> Canned {
        if self.responses.len() > 1 {
            self.responses.pop_front().unwrap()
        } else {
            self.responses.front().cloned().unwrap()
        }
    }
}

#[derive(Default)]
struct State {
    run_rules: Vec<Rule>,
    failing_pipes: Vec<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeExecutor {
    state: Mutex<State>,
}

fn render(host: Option<&str>, argv: &[String]) -> String {
    format!("{}> {}", host.unwrap_or("local"), argv.join(" "))
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to matching commands with the given stdout and exit 0.
    pub fn on(&self, needle: &str, stdout: &str) {
        self.on_status(needle, 0, stdout);
    }

    /// Respond to matching commands with the given status and stdout.
    pub fn on_status(&self, needle: &str, status: i32, stdout: &str) {
        let mut state = self.state.lock().unwrap();
        state.run_rules.push(Rule {
            needle: needle.to_string(),
            responses: VecDeque::from([Canned {
                stdout: stdout.to_string(),
                status,
            }]),
        });
    }

    /// Respond with each canned `(status, stdout)` in turn; the last one
    /// repeats.
    pub fn on_sequence(&self, needle: &str, responses: &[(i32, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.run_rules.push(Rule {
            needle: needle.to_string(),
            responses: responses
                .iter()
                .map(|(status, stdout)| Canned {
                    stdout: stdout.to_string(),
                    status: *status,
                })
                .collect(),
        });
    }

    /// Fail any pipeline whose rendered form contains the needle.
    pub fn fail_pipe(&self, needle: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_pipes
            .push(needle.to_string());
    }

    /// Every command seen so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Index of the first recorded call containing `needle`.
    pub fn call_index(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(needle))
    }

    pub fn count_calls(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

impl Executor for FakeExecutor {
    async fn run(&self, host: Option<&str>, argv: &[String]) -> Result<CommandOutput, ExecError> {
        let line = format!("run {}", render(host, argv));
        let mut state = self.state.lock().unwrap();
        state.calls.push(line.clone());
        let canned = state
            .run_rules
            .iter_mut()
            .find(|r| r.matches(&line))
            .map(|r| r.next())
            .unwrap_or(Canned {
                stdout: String::new(),
                status: 0,
            });
        Ok(CommandOutput {
            stdout: canned.stdout,
            stderr: if canned.status == 0 {
                String::new()
            } else {
                "scripted failure".to_string()
            },
            status: canned.status,
        })
    }

    async fn pipe(&self, left: &CommandSpec, right: &CommandSpec) -> Result<(), ExecError> {
        let line = format!(
            "pipe {} => {}",
            render(left.host.as_deref(), &left.argv),
            render(right.host.as_deref(), &right.argv)
        );
        let mut state = self.state.lock().unwrap();
        state.calls.push(line.clone());
        if state.failing_pipes.iter().any(|n| line.contains(n.as_str())) {
            return Err(ExecError::ReceiverFailed {
                status: 1,
                stderr: "scripted receive failure".to_string(),
            });
        }
        Ok(())
    }
}
