//! The sandbox capability the session registry drives.
//!
//! Implementations own the container runtime calls. Every process they start
//! is tied to a [`CancellationToken`]: once it is cancelled the process is
//! stopped and its event channel closes after the process has been reaped,
//! so a caller that drains the channel knows nothing is left running.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("{0}")]
    Unavailable(String),
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { origin: Origin, chunk: Bytes },
    /// Last event of a one-shot process. `None` when it was killed by a signal.
    Exited(Option<i32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Full contents of the watched file.
    Contents(Bytes),
    /// A line the watcher reported on stderr, or a restart notice.
    Error(String),
}

/// Where and as what a sandbox process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Session store, mounted at `/data`.
    pub store: String,
    pub image: String,
    pub container: String,
}

/// A running file watcher. `input` is present for writable watchers (editors):
/// every message replaces the watched file's contents.
#[derive(Debug)]
pub struct Watched {
    pub events: mpsc::Receiver<WatchEvent>,
    pub input: Option<mpsc::UnboundedSender<Bytes>>,
}

/// A running interactive shell on a terminal. Bytes are passed through
/// unmodified in both directions.
#[derive(Debug)]
pub struct Interactive {
    pub output: mpsc::Receiver<Bytes>,
    pub input: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync + 'static {
    async fn create_store(&self, store: &str) -> Result<(), ExecutorError>;

    async fn remove_store(&self, store: &str) -> Result<(), ExecutorError>;

    /// Runs `command` once. The receiver yields output chunks in arrival
    /// order, then exactly one [`ProcessEvent::Exited`].
    async fn run_once(
        &self,
        spec: ProcessSpec,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProcessEvent>, ExecutorError>;

    /// Watches `file` inside the store until `cancel` fires.
    async fn run_watched(
        &self,
        spec: ProcessSpec,
        file: &str,
        writable: bool,
        cancel: CancellationToken,
    ) -> Result<Watched, ExecutorError>;

    /// Starts a shell in `working_directory`. A shell that exits is started
    /// again after a short delay, on the same channels, until `cancel` fires.
    async fn run_interactive(
        &self,
        spec: ProcessSpec,
        working_directory: &str,
        cancel: CancellationToken,
    ) -> Result<Interactive, ExecutorError>;
}
