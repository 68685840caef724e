use serde_json::Value as JsonValue;
use std::env;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::executor::{ExecutionContext, ResourceKind, TaskHandler};
use crate::model::Task;

/// Handles a command task holds open: stdin, stdout, stderr.
const CHILD_FILE_HANDLES: u64 = 3;

/// Where and how command tasks may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSandbox {
    pub allowed_commands: Vec<String>,
    pub allowed_env: Vec<String>,
    pub working_dir: PathBuf,
}

impl CommandSandbox {
    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        Self {
            allowed_commands: cfg.allowed_commands.clone(),
            allowed_env: cfg.allowed_env.clone(),
            working_dir: cfg.sandbox_dir.clone().unwrap_or_else(env::temp_dir),
        }
    }

    /// A program is allowed when listed by exact path or by file name.
    pub fn check_program(&self, program: &str) -> SwarmResult<()> {
        let file_name = std::path::Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        let allowed = self
            .allowed_commands
            .iter()
            .any(|c| c == program || (!program.contains('/') && c == file_name));
        if allowed {
            Ok(())
        } else {
            Err(SwarmError::SandboxViolation(format!(
                "command '{program}' is not in the allow-list"
            )))
        }
    }

    /// Build a `Command` with a cleared environment, the sandbox working
    /// directory and piped output.
    pub fn command(&self, program: &str, args: &[String]) -> SwarmResult<Command> {
        self.check_program(program)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for name in &self.allowed_env {
            if let Some(value) = env::var_os(name) {
                cmd.env(name, value);
            }
        }
        Ok(cmd)
    }
}

/// Runs `input.command` with `input.args` as a child process.
///
/// Stdout lines are emitted through the context as they arrive. A graceful
/// stop request sends SIGTERM; a revoked context kills the child.
#[derive(Debug, Clone, Default)]
pub struct CommandHandler;

fn parse_input(input: &JsonValue) -> SwarmResult<(String, Vec<String>)> {
    let program = input
        .get("command")
        .and_then(JsonValue::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            SwarmError::task_failed("command task input needs a non-empty 'command' string")
        })?;
    let args = match input.get("args") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    SwarmError::task_failed("command task 'args' must be an array of strings")
                })
            })
            .collect::<SwarmResult<Vec<String>>>()?,
        Some(_) => {
            return Err(SwarmError::task_failed(
                "command task 'args' must be an array of strings",
            ))
        }
    };
    Ok((program.to_string(), args))
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) -> bool {
    child.kill().is_ok()
}

impl CommandHandler {
    fn wait(child: &mut Child, ctx: &ExecutionContext, program: &str) -> SwarmResult<ExitStatus> {
        let poll = Duration::from_millis(10);
        let mut signalled = false;
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| SwarmError::task_failed(format!("wait for '{program}': {e}")))?
            {
                return Ok(status);
            }
            if ctx.is_terminated() {
                warn!(task = ctx.task_id(), program, "killing command after forced termination");
                let _ = child.kill();
                return child
                    .wait()
                    .map_err(|e| SwarmError::task_failed(format!("reap '{program}': {e}")));
            }
            if ctx.should_stop() && !signalled {
                let sent = signal_terminate(child);
                debug!(task = ctx.task_id(), program, sent, "sent stop signal to command");
                signalled = true;
            }
            thread::sleep(poll);
        }
    }
}

impl TaskHandler for CommandHandler {
    fn run(&self, task: &Task, ctx: &ExecutionContext) -> SwarmResult<String> {
        let (program, args) = parse_input(&task.input)?;
        let mut cmd = ctx.sandbox().command(&program, &args)?;
        ctx.allocate(ResourceKind::FileHandles, CHILD_FILE_HANDLES)?;

        let spawned = cmd.spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                ctx.release(ResourceKind::FileHandles, CHILD_FILE_HANDLES);
                return Err(SwarmError::task_failed(format!(
                    "failed to spawn '{program}': {err}"
                )));
            }
        };
        debug!(task = %task.id, program = %program, pid = child.id(), "spawned command");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Drain both pipes concurrently so a chatty child cannot block on a full pipe.
        let out_ctx = ctx.clone();
        let out_handle = thread::spawn(move || -> String {
            let mut collected = String::new();
            let Some(stdout) = stdout else {
                return collected;
            };
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else {
                    break;
                };
                let chunk = format!("{line}\n");
                if out_ctx.emit(&chunk).is_err() {
                    continue;
                }
                collected.push_str(&chunk);
            }
            collected
        });
        let err_handle = thread::spawn(move || -> Vec<u8> {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf);
            }
            buf
        });

        let status = Self::wait(&mut child, ctx, &program);
        let stdout = out_handle
            .join()
            .map_err(|_| SwarmError::task_failed("stdout reader thread panicked"))?;
        let stderr = err_handle
            .join()
            .map_err(|_| SwarmError::task_failed("stderr reader thread panicked"))?;
        ctx.release(ResourceKind::FileHandles, CHILD_FILE_HANDLES);

        let status = status?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(SwarmError::task_failed(format!(
                "'{program}' exited with {status}: {}",
                stderr.trim()
            )));
        }
        Ok(stdout.trim_end().to_string())
    }
}
