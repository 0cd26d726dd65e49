//! Line protocol to the external timing engine.
//!
//! The engine runs as a child process. Each round we write one line to its
//! stdin (a workload path, `pass`, or `exit`) and it answers on stdout with a
//! block of free-form lines closed by a terminator line. The line right
//! before the terminator carries the completion event:
//!
//! ```text
//! ...informational output...
//! sys[0], id: 12, cycle: 1843200
//! Waiting
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, warn};

static EVENT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"sys\[(\d+)\],\s*id:\s*(\d+),\s*cycle:\s*(\d+)").expect("valid event regex")
});

const ROUND_TERMINATOR: &str = "Waiting";
const SHUTDOWN_TERMINATOR: &str = "Checking Non-Exited Systems";

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to spawn timing engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Timing engine I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Timing engine closed its output mid-round")]
    PeerClosed,
    #[error("No parsable completion event in {misses} consecutive rounds")]
    ProtocolDesync { misses: u32 },
    #[error("Timing engine exited with {status}: {stderr}")]
    PeerShutdownFailure { status: String, stderr: String },
}

/// How to start the timing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PeerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// One line of input to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundInput {
    Workload(PathBuf),
    Pass,
    Exit,
}

impl RoundInput {
    fn to_line(&self) -> String {
        match self {
            RoundInput::Workload(path) => path.display().to_string(),
            RoundInput::Pass => "pass".to_string(),
            RoundInput::Exit => "exit".to_string(),
        }
    }
}

/// A step finished on an execution unit at the engine's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub sys: u32,
    pub id: u64,
    pub clock_ns: u64,
}

impl CompletionEvent {
    /// Parse `sys[<sys>], id: <id>, cycle: <ns>` anywhere in `line`.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = EVENT_LINE.captures(line)?;
        Some(Self {
            sys: caps[1].parse().ok()?,
            id: caps[2].parse().ok()?,
            clock_ns: caps[3].parse().ok()?,
        })
    }
}

fn is_terminator(line: &str) -> bool {
    let line = line.trim();
    line == ROUND_TERMINATOR || line.starts_with(SHUTDOWN_TERMINATOR)
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("status {code}"),
        None => "termination by signal".to_string(),
    }
}

/// A running timing-engine process.
pub struct SimulationLink {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<Vec<String>>>,
    desync_tolerance: u32,
    misses: u32,
    rounds: u64,
    shut_down: bool,
}

impl SimulationLink {
    /// Start the engine with piped standard streams.
    pub fn spawn(command: &PeerCommand, desync_tolerance: u32) -> Result<Self, LinkError> {
        let spawn_err = |source| LinkError::Spawn {
            program: command.program.clone(),
            source,
        };
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        let missing = |stream: &str| {
            spawn_err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{stream} was not captured"),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let stderr = thread::Builder::new()
            .name("peer-stderr".to_string())
            .spawn(move || {
                BufReader::new(stderr)
                    .lines()
                    .map_while(Result::ok)
                    .inspect(|line| debug!(target: "servesim::peer", "stderr: {line}"))
                    .collect::<Vec<_>>()
            })
            .map_err(spawn_err)?;

        debug!(
            program = %command.program,
            args = ?command.args,
            pid = child.id(),
            "timing engine started"
        );
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr: Some(stderr),
            desync_tolerance,
            misses: 0,
            rounds: 0,
            shut_down: false,
        })
    }

    /// Write one round input line and flush it.
    pub fn send(&mut self, input: &RoundInput) -> Result<(), LinkError> {
        let stdin = self.stdin.as_mut().ok_or(LinkError::PeerClosed)?;
        let line = input.to_line();
        debug!(round = self.rounds, "-> {line}");
        let written = writeln!(stdin, "{line}").and_then(|_| stdin.flush());
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(LinkError::PeerClosed),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one round of output.
    ///
    /// Returns `Ok(None)` when the round carried no parsable event. Too many
    /// such rounds in a row fail with [`LinkError::ProtocolDesync`].
    pub fn receive(&mut self) -> Result<Option<CompletionEvent>, LinkError> {
        let mut last: Option<String> = None;
        loop {
            let mut line = String::new();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(LinkError::PeerClosed);
            }
            let line = line.trim_end();
            if is_terminator(line) {
                break;
            }
            debug!(target: "servesim::peer", "<- {line}");
            last = Some(line.to_string());
        }
        self.rounds += 1;

        match last.as_deref().and_then(CompletionEvent::parse) {
            Some(event) => {
                self.misses = 0;
                Ok(Some(event))
            }
            None => {
                self.misses += 1;
                warn!(
                    misses = self.misses,
                    line = last.as_deref().unwrap_or(""),
                    "round ended without a completion event"
                );
                if self.misses > self.desync_tolerance {
                    return Err(LinkError::ProtocolDesync {
                        misses: self.misses,
                    });
                }
                Ok(None)
            }
        }
    }

    /// Rounds completed so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Close stdin, drain stdout and check the exit status.
    ///
    /// Call after sending [`RoundInput::Exit`].
    pub fn verify_shutdown(&mut self) -> Result<(), LinkError> {
        drop(self.stdin.take());

        let mut line = String::new();
        while self.stdout.read_line(&mut line)? > 0 {
            debug!(target: "servesim::peer", "<- {}", line.trim_end());
            line.clear();
        }

        let status = self.child.wait()?;
        self.shut_down = true;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            debug!("timing engine exited cleanly");
            return Ok(());
        }
        let status = describe_status(status);
        error!(%status, "timing engine failed to shut down cleanly");
        Err(LinkError::PeerShutdownFailure {
            status,
            stderr: stderr.join("\n"),
        })
    }
}

impl Drop for SimulationLink {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
