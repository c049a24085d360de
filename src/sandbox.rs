//! Docker CLI implementation of [`SandboxExecutor`].
//!
//! Stores are named volumes mounted at `/data`. Every widget process is a
//! `docker run --rm --init --network=none` container; the CLI client proxies
//! signals to the container, so stopping the client stops the container. A
//! client that has to be killed is followed by `docker rm --force`.
//!
//! Terminals run the client on a pseudo-terminal with `--tty`, so the shell
//! sees a real terminal (prompt, line editing, job control).

use crate::executor::{
    ExecutorError, Interactive, Origin, ProcessEvent, ProcessSpec, SandboxExecutor, WatchEvent,
    Watched,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use std::io::{Read, Write};
use std::process::Stdio;
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time a process gets to exit after SIGTERM before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Delay before a watcher or terminal that exited on its own is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 4096;
const EVENT_BUFFER: usize = 64;
const TERMINAL_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

#[derive(Debug, Clone)]
pub struct DockerExecutor {
    docker: String,
}

impl DockerExecutor {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    fn run_args(spec: &ProcessSpec, stdin: bool, tty: bool) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string(), "--init".to_string()];
        if stdin {
            args.push("--interactive".to_string());
        }
        if tty {
            args.push("--tty".to_string());
        }
        args.extend([
            "--name".to_string(),
            spec.container.clone(),
            "--network=none".to_string(),
            "--mount".to_string(),
            format!("src={},dst=/data", spec.store),
        ]);
        args
    }

    /// Runs a short docker command to completion.
    async fn docker_output(&self, args: &[&str]) -> Result<(), ExecutorError> {
        let command = format!("{} {}", self.docker, args.join(" "));
        debug!(%command, "running docker command");
        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ExecutorError::Spawn {
                program: self.docker.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ExecutorError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// SIGTERM, then SIGKILL once the grace period is over. Killing the
    /// client does not reach the container, so it is removed by name.
    async fn terminate(&self, child: &mut Child, container: &str) {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(pid, "SIGTERM failed: {}", e);
                }
                if timeout(STOP_GRACE, child.wait()).await.is_ok() {
                    return;
                }
                warn!(pid, container, "Process ignored SIGTERM, killing");
            }
        }
        if let Err(e) = child.kill().await {
            debug!("kill failed: {}", e);
        }
        self.force_remove(container).await;
    }

    async fn force_remove(&self, container: &str) {
        match self.docker_output(&["rm", "--force", container]).await {
            Ok(()) => info!(container, "Force-removed container"),
            Err(e) => debug!(container, "force remove: {}", e),
        }
    }

    /// Starts the docker client on a fresh pseudo-terminal.
    fn spawn_pty(&self, args: &[String]) -> Result<PtyProcess, ExecutorError> {
        debug!(args = ?args, "spawning docker process on a pty");
        let pair = native_pty_system().openpty(TERMINAL_SIZE).map_err(pty_error)?;
        let reader = pair.master.try_clone_reader().map_err(pty_error)?;
        let writer = pair.master.take_writer().map_err(pty_error)?;
        let mut command = CommandBuilder::new(&self.docker);
        command.args(args);
        command.env("TERM", "xterm-256color");
        let child = pair.slave.spawn_command(command).map_err(pty_error)?;
        // The master only sees end of file once every slave handle is gone.
        drop(pair.slave);

        let (output_tx, output) = mpsc::channel(EVENT_BUFFER);
        thread::spawn(move || pty_reader(reader, output_tx));
        let (input, input_rx) = mpsc::unbounded_channel();
        thread::spawn(move || pty_writer(writer, input_rx));

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut child = child;
        let exit = tokio::task::spawn_blocking(move || child.wait().map(|status| status.exit_code()));
        Ok(PtyProcess {
            pid,
            killer,
            exit,
            output,
            input,
            _master: pair.master,
        })
    }

    fn spawn(&self, args: &[String], stdin: bool) -> Result<Child, ExecutorError> {
        debug!(args = ?args, "spawning docker process");
        Command::new(&self.docker)
            .args(args)
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.docker.clone(),
                source,
            })
    }
}

impl Default for DockerExecutor {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl SandboxExecutor for DockerExecutor {
    async fn create_store(&self, store: &str) -> Result<(), ExecutorError> {
        self.docker_output(&["volume", "create", store]).await?;
        info!(store, "Created volume");
        Ok(())
    }

    async fn remove_store(&self, store: &str) -> Result<(), ExecutorError> {
        self.docker_output(&["volume", "rm", store]).await?;
        info!(store, "Removed volume");
        Ok(())
    }

    async fn run_once(
        &self,
        spec: ProcessSpec,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProcessEvent>, ExecutorError> {
        let mut args = Self::run_args(&spec, false, false);
        args.extend([
            spec.image.clone(),
            "/bin/bash".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        let child = self.spawn(&args, false)?;
        info!(container = %spec.container, command, "Started one-shot container");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(pump_once(self.clone(), spec.container, child, tx, cancel));
        Ok(rx)
    }

    async fn run_watched(
        &self,
        spec: ProcessSpec,
        file: &str,
        writable: bool,
        cancel: CancellationToken,
    ) -> Result<Watched, ExecutorError> {
        let mut args = Self::run_args(&spec, writable, false);
        args.extend([spec.image.clone(), file.to_string()]);
        let child = self.spawn(&args, writable)?;
        info!(container = %spec.container, file, writable, "Started watcher container");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            executor: self.clone(),
            container: spec.container,
            args,
            writable,
            input_open: writable,
            events: tx,
            input: input_rx,
            cancel,
        };
        tokio::spawn(watcher.run(child));
        Ok(Watched {
            events: rx,
            input: writable.then_some(input_tx),
        })
    }

    async fn run_interactive(
        &self,
        spec: ProcessSpec,
        working_directory: &str,
        cancel: CancellationToken,
    ) -> Result<Interactive, ExecutorError> {
        let mut args = Self::run_args(&spec, true, true);
        args.extend([
            "--workdir".to_string(),
            working_directory.to_string(),
            spec.image.clone(),
            "/bin/bash".to_string(),
            "-i".to_string(),
        ]);
        let process = self.spawn_pty(&args)?;
        info!(container = %spec.container, working_directory, "Started terminal container");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let terminal = Terminal {
            executor: self.clone(),
            container: spec.container,
            args,
            input_open: true,
            output: tx,
            input: input_rx,
            cancel,
        };
        tokio::spawn(terminal.run(process));
        Ok(Interactive {
            output: rx,
            input: input_tx,
        })
    }
}

fn pty_error<E: std::fmt::Display>(e: E) -> ExecutorError {
    ExecutorError::Unavailable(format!("pty: {}", e))
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> Option<Bytes> {
    let r = reader.as_mut()?;
    match r.read(buf).await {
        Ok(0) | Err(_) => {
            *reader = None;
            None
        }
        Ok(n) => Some(Bytes::copy_from_slice(&buf[..n])),
    }
}

async fn pump_once(
    executor: DockerExecutor,
    container: String,
    mut child: Child,
    tx: mpsc::Sender<ProcessEvent>,
    cancel: CancellationToken,
) {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut cancelled = false;

    while stdout.is_some() || stderr.is_some() {
        let event = tokio::select! {
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                executor.terminate(&mut child, &container).await;
                continue;
            }
            chunk = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => {
                chunk.map(|chunk| ProcessEvent::Output { origin: Origin::Stdout, chunk })
            }
            chunk = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => {
                chunk.map(|chunk| ProcessEvent::Output { origin: Origin::Stderr, chunk })
            }
        };
        if let Some(event) = event {
            // A dropped receiver means nobody cares about the output anymore.
            if tx.send(event).await.is_err() && !cancelled {
                cancelled = true;
                executor.terminate(&mut child, &container).await;
            }
        }
    }

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("wait for one-shot process: {}", e);
            None
        }
    };
    let _ = tx.send(ProcessEvent::Exited(code)).await;
}

/// One docker client attached to a pseudo-terminal. Output and input are
/// pumped by two threads, since the pty handles are blocking.
struct PtyProcess {
    pid: Option<u32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exit: JoinHandle<std::io::Result<u32>>,
    output: mpsc::Receiver<Bytes>,
    input: mpsc::UnboundedSender<Bytes>,
    _master: Box<dyn MasterPty + Send>,
}

impl PtyProcess {
    async fn stop(mut self, executor: &DockerExecutor, container: &str) {
        drop(self.input);
        if !self.exit.is_finished() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Some(pid) = self.pid {
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        debug!(pid, "SIGTERM failed: {}", e);
                    }
                }
            }
            if timeout(STOP_GRACE, &mut self.exit).await.is_ok() {
                return;
            }
            warn!(pid = ?self.pid, container, "Terminal ignored SIGTERM, killing");
            if let Err(e) = self.killer.kill() {
                debug!("kill failed: {}", e);
            }
            executor.force_remove(container).await;
        }
        match self.exit.await {
            Ok(Ok(code)) => debug!(container, code, "Terminal process exited"),
            Ok(Err(e)) => debug!(container, "wait for terminal process: {}", e),
            Err(e) => debug!(container, "terminal wait task: {}", e),
        }
    }
}

fn pty_reader(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            // EIO is how Linux reports a hung-up pty.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if output.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
        }
    }
}

fn pty_writer(mut writer: Box<dyn Write + Send>, mut input: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            warn!("write terminal input: {}", e);
            break;
        }
    }
}

struct Terminal {
    executor: DockerExecutor,
    container: String,
    args: Vec<String>,
    input_open: bool,
    output: mpsc::Sender<Bytes>,
    input: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
}

impl Terminal {
    /// Keeps a shell running, restarting it whenever it exits on its own.
    /// Output of every incarnation goes to the same channel.
    async fn run(mut self, first: PtyProcess) {
        let mut process = first;
        'outer: loop {
            let stopped = self.pump(&mut process).await;
            process.stop(&self.executor, &self.container).await;
            if stopped || self.cancel.is_cancelled() {
                break;
            }

            let notice = Bytes::from_static(b"\r\n[terminal exited, restarting]\r\n");
            if self.output.send(notice).await.is_err() {
                break;
            }
            process = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'outer,
                    _ = sleep(RESTART_DELAY) => {}
                }
                match self.executor.spawn_pty(&self.args) {
                    Ok(next) => break next,
                    Err(e) => {
                        warn!(container = %self.container, "restart terminal: {}", e);
                        let message = Bytes::from(format!("\r\n[{}]\r\n", e));
                        if self.output.send(message).await.is_err() {
                            break 'outer;
                        }
                    }
                }
            };
            info!(container = %self.container, "Restarted terminal container");
        }
        debug!(container = %self.container, "Terminal stopped");
    }

    /// Pumps one shell. Returns true when the terminal should stop for good
    /// (cancelled or nobody listening).
    async fn pump(&mut self, process: &mut PtyProcess) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                data = self.input.recv(), if self.input_open => match data {
                    Some(data) => {
                        if process.input.send(data).is_err() {
                            debug!("dropping terminal input, pty closed");
                        }
                    }
                    None => self.input_open = false,
                },
                chunk = process.output.recv() => match chunk {
                    Some(chunk) => {
                        if self.output.send(chunk).await.is_err() {
                            return true;
                        }
                    }
                    None => return false,
                },
            }
        }
    }
}

#[derive(Deserialize)]
struct MonitorLine {
    contents: String,
}

/// Decodes one stdout line of the monitor image (`{"contents":"<base64>"}`).
fn decode_monitor_line(line: &str) -> Result<Bytes, String> {
    let parsed: MonitorLine =
        serde_json::from_str(line).map_err(|e| format!("malformed monitor output: {}", e))?;
    BASE64
        .decode(parsed.contents.as_bytes())
        .map(Bytes::from)
        .map_err(|e| format!("malformed monitor contents: {}", e))
}

/// Encodes a replacement for the watched file as one stdin line.
fn encode_monitor_input(contents: &[u8]) -> Vec<u8> {
    let mut line = BASE64.encode(contents).into_bytes();
    line.push(b'\n');
    line
}

struct Watcher {
    executor: DockerExecutor,
    container: String,
    args: Vec<String>,
    writable: bool,
    input_open: bool,
    events: mpsc::Sender<WatchEvent>,
    input: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
}

impl Watcher {
    /// Keeps the monitor running, restarting it whenever it exits on its own.
    async fn run(mut self, first: Child) {
        let mut child = first;
        'outer: loop {
            let stopped = self.watch(&mut child).await;
            self.executor.terminate(&mut child, &self.container).await;
            let _ = child.wait().await;
            if stopped || self.cancel.is_cancelled() {
                break;
            }

            let notice = WatchEvent::Error("watcher exited, restarting".to_string());
            if self.events.send(notice).await.is_err() {
                break;
            }
            child = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'outer,
                    _ = sleep(RESTART_DELAY) => {}
                }
                match self.executor.spawn(&self.args, self.writable) {
                    Ok(next) => break next,
                    Err(e) => {
                        warn!("restart watcher: {}", e);
                        if self.events.send(WatchEvent::Error(e.to_string())).await.is_err() {
                            break 'outer;
                        }
                    }
                }
            };
        }
        debug!("Watcher stopped");
    }

    /// Pumps one monitor process. Returns true when the watcher should stop
    /// for good (cancelled or nobody listening).
    async fn watch(&mut self, child: &mut Child) -> bool {
        let mut stdin: Option<ChildStdin> = child.stdin.take();
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        while stdout.is_some() || stderr.is_some() {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return true,
                data = self.input.recv(), if self.input_open => {
                    match (data, stdin.as_mut()) {
                        (Some(data), Some(pipe)) => {
                            if let Err(e) = pipe.write_all(&encode_monitor_input(&data)).await {
                                warn!("write editor contents: {}", e);
                                Some(WatchEvent::Error(format!("write failed: {}", e)))
                            } else {
                                None
                            }
                        }
                        (None, _) => {
                            self.input_open = false;
                            None
                        }
                        (Some(_), None) => Some(WatchEvent::Error("watcher input closed".to_string())),
                    }
                }
                line = next_line(&mut stdout), if stdout.is_some() => {
                    line.map(|line| match decode_monitor_line(&line) {
                        Ok(contents) => WatchEvent::Contents(contents),
                        Err(message) => WatchEvent::Error(message),
                    })
                }
                line = next_line(&mut stderr), if stderr.is_some() => line.map(WatchEvent::Error),
            };
            if let Some(event) = event {
                if self.events.send(event).await.is_err() {
                    return true;
                }
            }
        }
        false
    }
}

async fn next_line<R: AsyncRead + Unpin>(
    lines: &mut Option<tokio::io::Lines<BufReader<R>>>,
) -> Option<String> {
    let reader = lines.as_mut()?;
    match reader.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) | Err(_) => {
            *lines = None;
            None
        }
    }
}
