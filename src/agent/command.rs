//! Agent backed by an external command.
//!
//! The request goes to the process on stdin, or through a JSON file named in
//! `WSYNC_AGENT_INPUT` when it is large or file mode is configured. The
//! response is read from stdout (stdin mode) or from `WSYNC_AGENT_OUTPUT`.

use std::env;
use std::fs;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::agent::types::{parse_response, AgentRequest, AgentResponse};
use crate::agent::{AgentError, AgentResult, ConflictAgent};

/// requests above this size switch to file handoff
pub const MAX_STDIN_BYTES: usize = 512 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffMode {
    Stdin,
    File,
}

#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    mode: HandoffMode,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(command: &str) -> AgentResult<Self> {
        let mut words = split_command(command)?;
        if words.is_empty() {
            return Err(AgentError::NotConfigured);
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
            mode: HandoffMode::Stdin,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// `WSYNC_AGENT_CMD`, `WSYNC_AGENT_MODE` and `WSYNC_AGENT_TIMEOUT_SECS`
    pub fn from_env() -> AgentResult<Self> {
        let command = env::var("WSYNC_AGENT_CMD").unwrap_or_default();
        if command.trim().is_empty() {
            return Err(AgentError::NotConfigured);
        }
        let mut agent = Self::new(&command)?;
        if let Ok(mode) = env::var("WSYNC_AGENT_MODE") {
            if mode.trim().eq_ignore_ascii_case("file") {
                agent = agent.with_mode(HandoffMode::File);
            }
        }
        if let Some(secs) = env::var("WSYNC_AGENT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            agent = agent.with_timeout(Duration::from_secs(secs));
        }
        Ok(agent)
    }

    pub fn with_mode(mut self, mode: HandoffMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, request: &AgentRequest, mode: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.workspace_path)
            .env("WSYNC_AGENT_MODE", mode)
            .env("WSYNC_AGENT_ACTION", request.action.as_str())
            .env("WSYNC_AGENT_WORKSPACE", &request.workspace_path);
        cmd
    }

    fn run_stdin(&self, request: &AgentRequest, payload: Vec<u8>) -> AgentResult<AgentResponse> {
        let cmd = self.command(request, "stdin");
        let output = self.run(cmd, Some(payload))?;
        parse_response(&output).ok_or_else(|| invalid(&output))
    }

    fn run_file(&self, request: &AgentRequest, payload: &[u8]) -> AgentResult<AgentResponse> {
        let dir = request
            .workspace_path
            .parent()
            .filter(|p| p.is_dir())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(env::temp_dir);
        let mut input = tempfile::Builder::new()
            .prefix("wsync-agent-input-")
            .suffix(".json")
            .tempfile_in(&dir)?;
        input.write_all(payload)?;
        input.flush()?;
        let output_file = tempfile::Builder::new()
            .prefix("wsync-agent-output-")
            .suffix(".json")
            .tempfile_in(&dir)?;

        let mut cmd = self.command(request, "file");
        cmd.env("WSYNC_AGENT_INPUT", input.path())
            .env("WSYNC_AGENT_OUTPUT", output_file.path());
        self.run(cmd, None)?;

        let data = fs::read(output_file.path())?;
        parse_response(&data).ok_or_else(|| invalid(&data))
    }

    /// Run to completion or until the timeout, returning stdout.
    fn run(&self, mut cmd: Command, stdin: Option<Vec<u8>>) -> AgentResult<Vec<u8>> {
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
            command: self.program.clone(),
            source,
        })?;

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // the agent may exit without draining stdin
            thread::spawn(move || {
                let _ = pipe.write_all(&payload);
            });
        }
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = thread::spawn(move || drain(stdout));
        let err_reader = thread::spawn(move || drain(stderr));

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(AgentError::Timeout(self.timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = out_reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();
        debug!(program = %self.program, status = ?status.code(), elapsed_ms = started.elapsed().as_millis() as u64, "agent exited");

        if !status.success() {
            let mut output = String::from_utf8_lossy(&stderr).trim().to_string();
            if output.is_empty() {
                output = String::from_utf8_lossy(&stdout).trim().to_string();
            }
            return Err(AgentError::Failed {
                status: status.code(),
                output,
            });
        }
        Ok(stdout)
    }
}

impl ConflictAgent for CommandAgent {
    fn name(&self) -> &str {
        &self.program
    }

    fn invoke(&self, request: &AgentRequest) -> AgentResult<AgentResponse> {
        let payload = serde_json::to_vec(request)?;
        let mode = match self.mode {
            HandoffMode::Stdin if payload.len() > MAX_STDIN_BYTES => HandoffMode::File,
            mode => mode,
        };
        debug!(action = request.action.as_str(), ?mode, bytes = payload.len(), "invoking agent");
        match mode {
            HandoffMode::Stdin => self.run_stdin(request, payload),
            HandoffMode::File => self.run_file(request, &payload),
        }
    }
}

fn drain<R: Read>(source: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut source) = source {
        let _ = source.read_to_end(&mut buf);
    }
    buf
}

fn invalid(output: &[u8]) -> AgentError {
    let text = String::from_utf8_lossy(output);
    let text = text.trim();
    if text.is_empty() {
        AgentError::InvalidResponse("empty agent response".to_string())
    } else {
        let snippet: String = text.chars().take(200).collect();
        AgentError::InvalidResponse(format!("no versioned JSON in output: {}", snippet))
    }
}

/// Split a command line honoring single quotes, double quotes and
/// backslash escapes.
pub fn split_command(command: &str) -> AgentResult<Vec<String>> {
    let mut args = Vec::new();
    let mut buf = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                let escapable = match chars.peek() {
                    Some('"') | Some('\\') | Some('$') | Some('\n') if in_double => true,
                    Some(' ') | Some('\t') | Some('\n') | Some('"') | Some('\\') if !in_double => true,
                    _ => false,
                };
                if escapable {
                    if let Some(next) = chars.next() {
                        buf.push(next);
                    }
                } else {
                    buf.push(c);
                }
            }
            '"' if !in_single => in_double = !in_double,
            '\'' if !in_double => in_single = !in_single,
            ' ' | '\t' | '\n' if !in_single && !in_double => {
                if !buf.is_empty() {
                    args.push(std::mem::take(&mut buf));
                }
            }
            _ => buf.push(c),
        }
    }
    if in_single || in_double {
        return Err(AgentError::InvalidCommand("unterminated quote in command".to_string()));
    }
    if !buf.is_empty() {
        args.push(buf);
    }
    Ok(args)
}
