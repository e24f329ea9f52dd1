use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use anyhow::{anyhow, Context, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use crate::error::ToolNotFound;
use crate::progress::OutputBuffer;

/// Writer receiving a copy of a tool's stdout (e.g. a debug log file)
pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

/// Number of stderr lines kept in failure messages
const STDERR_TAIL_LINES: usize = 20;

/// Resolve a tool on PATH (or check an explicit path) before any task runs
pub fn require_tool(tool: &Path) -> Result<PathBuf, ToolNotFound> {
    which::which(tool).map_err(|source| ToolNotFound {
        tool: tool.to_path_buf(),
        source,
    })
}

/// Command line of an external tool
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    success_codes: Vec<i32>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ToolCommand {
            program: program.into(),
            args: Vec::new(),
            success_codes: vec![0],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Treat another exit code as success (mkvmerge exits 1 on warnings)
    pub fn accept_exit_code(mut self, code: i32) -> Self {
        self.success_codes.push(code);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Human-readable command line for logs and error messages
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    /// Spawn the tool with stdout streamed into an [`OutputBuffer`].
    ///
    /// When `sink` is given, every stdout chunk is also written there.
    pub fn spawn(&self, sink: Option<OutputSink>) -> Result<RunningTool> {
        let command_line = self.command_line();
        debug!("Executing: {}", command_line);

        let mut child = self.build().spawn().with_context(|| {
            format!(
                "Failed to spawn {}. Ensure it is installed and accessible.",
                self.program.display()
            )
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture stdout of {}", self.program.display()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture stderr of {}", self.program.display()))?;

        let buffer = OutputBuffer::new();
        let reader_buffer = buffer.clone();
        // Read raw chunks, not lines: progress redraws use carriage returns.
        let stdout_reader = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut chunk = [0u8; 8192];
            loop {
                let read = match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                reader_buffer.append(&chunk[..read]);
                if let Some(sink) = &sink {
                    let mut writer = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Err(e) = writer.write_all(&chunk[..read]) {
                        debug!("Failed to copy tool output to sink: {}", e);
                    }
                }
            }
        });

        let stderr_reader = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut line_stream = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = line_stream.next_line().await {
                lines.push(line);
            }
            lines.join("\n")
        });

        Ok(RunningTool {
            child,
            stdout: buffer,
            stdout_reader,
            stderr_reader,
            command_line,
            success_codes: self.success_codes.clone(),
        })
    }

    /// Run to completion and return stdout, failing on a non-success exit
    pub async fn capture(&self) -> Result<String> {
        let command_line = self.command_line();
        debug!("Executing: {}", command_line);

        let output = self
            .build()
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.program.display()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        if !self.success_codes.contains(&exit_code) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(anyhow!(
                "{} failed (exit code {})\nCommand: {}\nSTDERR: {}\nSTDOUT: {}",
                self.program.display(),
                exit_code,
                command_line,
                tail(&stderr),
                tail(&stdout)
            ));
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("Output of {} is not valid UTF-8", self.program.display()))
    }
}

/// Result of a finished tool
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// A spawned tool whose stdout is being collected
#[derive(Debug)]
pub struct RunningTool {
    child: Child,
    stdout: OutputBuffer,
    stdout_reader: JoinHandle<()>,
    stderr_reader: JoinHandle<String>,
    command_line: String,
    success_codes: Vec<i32>,
}

impl RunningTool {
    /// Buffer the tool's stdout is appended to
    pub fn output(&self) -> OutputBuffer {
        self.stdout.clone()
    }

    /// Wait for exit; a non-success exit code becomes an error carrying stderr
    pub async fn wait(mut self) -> Result<ToolOutput> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for: {}", self.command_line))?;

        // Let the readers drain the pipes before judging the run.
        if let Err(e) = self.stdout_reader.await {
            debug!("stdout reader ended abnormally: {}", e);
        }
        let stderr = self.stderr_reader.await.unwrap_or_default();

        let exit_code = status.code();
        if !exit_code.map(|c| self.success_codes.contains(&c)).unwrap_or(false) {
            return Err(anyhow!(
                "{} (exit code: {})\nSTDERR:\n{}",
                self.command_line,
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                tail(&stderr)
            ));
        }

        if exit_code != Some(0) {
            log::warn!("{} exited with {:?}: {}", self.command_line, exit_code, tail(&stderr));
        }

        Ok(ToolOutput { exit_code, stderr })
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
