//! Async execution of external tools with timeout, capture and kill support.
//!
//! [`ProcessRunner`] is the only place in the pipeline that spawns
//! processes. It never retries; callers decide what a failure means.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::progress::{self, ProgressUpdate};

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Read buffer size for output pipes.
const CHUNK_SIZE: usize = 8192;

/// Bytes of stderr kept for error reports and [`ProcessOutput::stderr`].
/// Long encodes print progress for hours; only the tail says why they failed.
const STDERR_TAIL: usize = 64 * 1024;

/// Per-invocation settings for [`ProcessRunner::execute`].
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Maximum execution time before the child is killed.
    pub timeout: Duration,
    /// Return captured stdout in [`ProcessOutput::stdout`]. When off,
    /// stdout is read and discarded.
    pub capture_stdout: bool,
    /// Return captured stderr in [`ProcessOutput::stderr`]. Failures carry
    /// the stderr tail either way.
    pub capture_stderr: bool,
    /// Registers the running process for [`ProcessRunner::kill_by_label`].
    pub label: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            capture_stdout: true,
            capture_stderr: true,
            label: None,
        }
    }
}

impl ExecOptions {
    /// Options with defaults (5 minute timeout, capture both streams).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder: set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Builder: add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Builder: attach a kill label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Builder: choose which streams are returned.
    pub fn capture(mut self, stdout: bool, stderr: bool) -> Self {
        self.capture_stdout = stdout;
        self.capture_stderr = stderr;
        self
    }
}

/// Outcome of a successful execution.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Process exit code.
    pub exit_code: Option<i32>,
    /// Captured standard output (lossy UTF-8), if requested.
    pub stdout: Option<String>,
    /// Last 64 KiB of standard error (lossy UTF-8), if requested.
    pub stderr: Option<String>,
    /// Wall-clock time from spawn to exit.
    pub duration: Duration,
    /// Always `false` here: a timeout is reported as an error.
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Runs external processes and tracks labelled ones so they can be killed.
#[derive(Debug, Default)]
pub struct ProcessRunner {
    running: DashMap<String, CancellationToken>,
}

/// Removes a label from the registry when the execution ends, however it ends.
struct LabelGuard<'a> {
    runner: &'a ProcessRunner,
    label: Option<String>,
}

impl Drop for LabelGuard<'_> {
    fn drop(&mut self) {
        if let Some(label) = self.label.take() {
            self.runner.running.remove(&label);
        }
    }
}

impl ProcessRunner {
    /// Create a runner with no tracked processes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `program` to completion, capturing its output.
    ///
    /// # Errors
    ///
    /// - [`vs_core::Error::ProcessExecution`] on spawn failure, non-zero exit,
    ///   or when killed through [`kill_by_label`](Self::kill_by_label).
    /// - [`vs_core::Error::ProcessTimeout`] when `opts.timeout` elapses; the
    ///   child is killed and reaped before returning.
    pub async fn execute(
        &self,
        program: &Path,
        args: &[String],
        opts: &ExecOptions,
    ) -> vs_core::Result<ProcessOutput> {
        self.run(program, args, opts, None).await
    }

    /// Like [`execute`](Self::execute), but parses every output chunk and
    /// invokes `on_progress` whenever progress information is found.
    ///
    /// `total_duration_secs` enables percentage and ETA computation for
    /// engine-style `time=` output.
    pub async fn execute_with_streaming<F>(
        &self,
        program: &Path,
        args: &[String],
        opts: &ExecOptions,
        total_duration_secs: Option<f64>,
        mut on_progress: F,
    ) -> vs_core::Result<ProcessOutput>
    where
        F: FnMut(ProgressUpdate) + Send,
    {
        let mut on_chunk = |chunk: &str| {
            if let Some(update) = progress::parse_progress(chunk, total_duration_secs) {
                on_progress(update);
            }
        };
        self.run(program, args, opts, Some(&mut on_chunk)).await
    }

    /// Force-terminate the running process registered under `label`.
    ///
    /// Returns `false` when no such process is running.
    pub fn kill_by_label(&self, label: &str) -> bool {
        match self.running.get(label) {
            Some(token) => {
                tracing::warn!(label, "Kill requested for running process");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a process is currently registered under `label`.
    pub fn is_running(&self, label: &str) -> bool {
        self.running.contains_key(label)
    }

    /// Whether `command` resolves to an executable (absolute path or `PATH`).
    pub fn is_command_available(command: &str) -> bool {
        which::which(command).is_ok()
    }

    async fn run(
        &self,
        program: &Path,
        args: &[String],
        opts: &ExecOptions,
        mut on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> vs_core::Result<ProcessOutput> {
        let program_name = program_name(program);

        let token = CancellationToken::new();
        let _guard = match opts.label {
            Some(ref label) => {
                match self.running.entry(label.clone()) {
                    Entry::Occupied(_) => {
                        return Err(vs_core::Error::Validation(format!(
                            "a process labelled {label:?} is already running"
                        )));
                    }
                    Entry::Vacant(e) => {
                        e.insert(token.clone());
                    }
                }
                LabelGuard {
                    runner: self,
                    label: Some(label.clone()),
                }
            }
            None => LabelGuard {
                runner: self,
                label: None,
            },
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = opts.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        tracing::debug!(command = %program_name, args = %args.join(" "), "Spawning process");
        let started = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            vs_core::Error::process(&program_name, None, format!("failed to spawn: {e}"))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<(Stream, String)>();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, tx.clone());
        }
        drop(tx);

        let mut stdout = String::new();
        let mut stderr = TailBuffer::new(STDERR_TAIL);
        let mut status = None;
        let mut pipes_open = true;

        let deadline = tokio::time::sleep(opts.timeout);
        tokio::pin!(deadline);

        while status.is_none() || pipes_open {
            tokio::select! {
                chunk = rx.recv(), if pipes_open => match chunk {
                    Some((stream, text)) => {
                        if let Some(cb) = on_chunk.as_mut() {
                            cb(&text);
                        }
                        match stream {
                            Stream::Stdout if opts.capture_stdout => stdout.push_str(&text),
                            Stream::Stdout => {}
                            Stream::Stderr => stderr.push(&text),
                        }
                    }
                    None => pipes_open = false,
                },
                res = child.wait(), if status.is_none() => {
                    status = Some(res.map_err(|e| {
                        vs_core::Error::process(
                            &program_name,
                            None,
                            format!("I/O error waiting for process: {e}"),
                        )
                    })?);
                }
                _ = &mut deadline => {
                    if status.is_none() {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(
                                command = %program_name,
                                "Failed to kill timed out process: {e}"
                            );
                        }
                    }
                    tracing::warn!(
                        command = %program_name,
                        timeout = ?opts.timeout,
                        "Process timed out"
                    );
                    return Err(vs_core::Error::ProcessTimeout {
                        command: program_name,
                        timeout: opts.timeout,
                    });
                }
                _ = token.cancelled() => {
                    if status.is_none() {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(
                                command = %program_name,
                                "Failed to kill process: {e}"
                            );
                        }
                    }
                    return Err(vs_core::Error::process(
                        program_name,
                        None,
                        "terminated by kill request",
                    ));
                }
            }
        }

        let duration = started.elapsed();
        let Some(status) = status else {
            return Err(vs_core::Error::Internal("process finished without status".into()));
        };

        tracing::debug!(
            command = %program_name,
            exit_code = ?status.code(),
            elapsed_ms = duration.as_millis() as u64,
            "Process exited"
        );

        let stderr = stderr.into_string();
        if !status.success() {
            return Err(vs_core::Error::process(
                program_name,
                status.code(),
                stderr.trim().to_string(),
            ));
        }

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout: opts.capture_stdout.then_some(stdout),
            stderr: opts.capture_stderr.then_some(stderr),
            duration,
            timed_out: false,
        })
    }
}

/// Keeps the last `limit` bytes of a text stream.
struct TailBuffer {
    text: String,
    limit: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        // Trim in batches so a chatty process does not shift the buffer on
        // every chunk.
        if self.text.len() > self.limit * 2 {
            self.trim();
        }
    }

    fn trim(&mut self) {
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
    }

    fn into_string(mut self) -> String {
        self.trim();
        self.text
    }
}

/// Forward everything read from `reader` to `tx` as lossy UTF-8 chunks.
fn spawn_reader<R>(
    mut reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<(Stream, String)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send((stream, text)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string_lossy().to_string())
}
