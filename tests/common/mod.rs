//! Shared fixtures: an in-memory sandbox executor and a small page catalog.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use playground::catalog::Catalog;
use playground::executor::{
    ExecutorError, Interactive, Origin, ProcessEvent, ProcessSpec, SandboxExecutor, WatchEvent,
    Watched,
};
use playground::ids::{resource_name, PageId, SessionId};
use playground::protocol::Update;
use playground::registry::{RegistryConfig, SessionRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

pub const CATALOG: &str = r#"{
    "pages": [
        {"url": "/", "title": "Index", "isInteractive": false,
         "widgets": [{"type": "markdown", "content": "Welcome"}]},
        {"url": "/run", "title": "Run", "isInteractive": true,
         "widgets": [
            {"type": "markdown", "content": "Click the button"},
            {"type": "text", "file": "/test.txt"},
            {"type": "button", "label": "A button", "command": "date"}
         ]},
        {"url": "/run/nested", "title": "Nested", "isInteractive": true,
         "widgets": [
            {"type": "editor", "file": "/main.py"},
            {"type": "terminal", "workingDirectory": "/data"},
            {"type": "image", "file": "/plot.png"}
         ]}
    ]
}"#;

pub const DATE_OUTPUT: &[u8] = b"Thu Jan  1 00:00:00 UTC 1970\n";

/// Generous: a dropped SSE client is only noticed at the next keep-alive.
pub const TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateStore(String),
    RemoveStore(String),
    RunOnce {
        container: String,
        image: String,
        command: String,
    },
    RunWatched {
        store: String,
        file: String,
        writable: bool,
    },
    RunInteractive {
        store: String,
        working_directory: String,
    },
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    stores: HashSet<String>,
    double_creates: usize,
    /// Senders of running watchers, by (store, file).
    watchers: HashMap<(String, String), mpsc::Sender<WatchEvent>>,
    editor_writes: Vec<(String, Bytes)>,
    terminal_inputs: Vec<Bytes>,
    scripts: HashMap<String, Vec<(Origin, Bytes)>>,
}

/// Records every call and simulates processes with tasks. Every simulated
/// process closes its channel only after it has been counted as stopped.
pub struct FakeExecutor {
    state: Arc<Mutex<FakeState>>,
    live: Arc<AtomicUsize>,
    pub fail_create_store: AtomicBool,
    pub fail_run_watched: AtomicBool,
    pub fail_run_once: AtomicBool,
    /// When set, button commands wait for a permit before exiting.
    pub hold_buttons: AtomicBool,
    release: Arc<Semaphore>,
    /// When set, `run_watched` does not return until [`Self::unstall_watchers`].
    pub stall_watchers: AtomicBool,
    unstall: Notify,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::default(),
            live: Arc::default(),
            fail_create_store: AtomicBool::new(false),
            fail_run_watched: AtomicBool::new(false),
            fail_run_once: AtomicBool::new(false),
            hold_buttons: AtomicBool::new(false),
            release: Arc::new(Semaphore::new(0)),
            stall_watchers: AtomicBool::new(false),
            unstall: Notify::new(),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn live_stores(&self) -> HashSet<String> {
        self.state.lock().unwrap().stores.clone()
    }

    pub fn double_creates(&self) -> usize {
        self.state.lock().unwrap().double_creates
    }

    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn editor_writes(&self) -> Vec<(String, Bytes)> {
        self.state.lock().unwrap().editor_writes.clone()
    }

    pub fn terminal_inputs(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().terminal_inputs.clone()
    }

    /// Output the fake prints for `command` instead of the default.
    pub fn script(&self, command: &str, chunks: Vec<(Origin, &'static [u8])>) {
        self.state.lock().unwrap().scripts.insert(
            command.to_string(),
            chunks
                .into_iter()
                .map(|(o, c)| (o, Bytes::from_static(c)))
                .collect(),
        );
    }

    pub fn release_buttons(&self, n: usize) {
        self.release.add_permits(n);
    }

    pub fn unstall_watchers(&self) {
        self.stall_watchers.store(false, Ordering::SeqCst);
        self.unstall.notify_waiters();
    }

    /// Feeds an event to the watcher of `file` in `store`. Returns false when
    /// no such watcher runs.
    pub async fn emit(&self, store: &str, file: &str, event: WatchEvent) -> bool {
        let tx = self
            .state
            .lock()
            .unwrap()
            .watchers
            .get(&(store.to_string(), file.to_string()))
            .cloned();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn output_for(&self, command: &str) -> Vec<(Origin, Bytes)> {
        let state = self.state.lock().unwrap();
        match state.scripts.get(command) {
            Some(chunks) => chunks.clone(),
            None if command == "date" => vec![(Origin::Stdout, Bytes::from_static(DATE_OUTPUT))],
            None => vec![(Origin::Stdout, Bytes::from(format!("{}\n", command)))],
        }
    }
}

/// Marks a simulated process as running until dropped.
struct Live(Arc<AtomicUsize>);

impl Live {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxExecutor for FakeExecutor {
    async fn create_store(&self, store: &str) -> Result<(), ExecutorError> {
        self.record(Call::CreateStore(store.to_string()));
        tokio::task::yield_now().await;
        if self.fail_create_store.load(Ordering::SeqCst) {
            return Err(ExecutorError::Unavailable("docker daemon is down".into()));
        }
        let mut state = self.state.lock().unwrap();
        if !state.stores.insert(store.to_string()) {
            state.double_creates += 1;
        }
        Ok(())
    }

    async fn remove_store(&self, store: &str) -> Result<(), ExecutorError> {
        self.record(Call::RemoveStore(store.to_string()));
        tokio::task::yield_now().await;
        self.state.lock().unwrap().stores.remove(store);
        Ok(())
    }

    async fn run_once(
        &self,
        spec: ProcessSpec,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProcessEvent>, ExecutorError> {
        self.record(Call::RunOnce {
            container: spec.container,
            image: spec.image,
            command: command.to_string(),
        });
        if self.fail_run_once.load(Ordering::SeqCst) {
            return Err(ExecutorError::Unavailable("image missing".into()));
        }
        let output = self.output_for(command);
        let hold = self.hold_buttons.load(Ordering::SeqCst);
        let release = self.release.clone();
        let live = Live::start(&self.live);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut code = None;
            let mut delivered = true;
            for (origin, chunk) in output {
                if tx.send(ProcessEvent::Output { origin, chunk }).await.is_err() {
                    delivered = false;
                    break;
                }
            }
            if delivered {
                code = if hold {
                    tokio::select! {
                        permit = release.acquire() => {
                            if let Ok(permit) = permit {
                                permit.forget();
                            }
                            Some(0)
                        }
                        _ = cancel.cancelled() => None,
                    }
                } else {
                    Some(0)
                };
            }
            // Reaped before the channel closes.
            drop(live);
            if delivered {
                let _ = tx.send(ProcessEvent::Exited(code)).await;
            }
        });
        Ok(rx)
    }

    async fn run_watched(
        &self,
        spec: ProcessSpec,
        file: &str,
        writable: bool,
        cancel: CancellationToken,
    ) -> Result<Watched, ExecutorError> {
        self.record(Call::RunWatched {
            store: spec.store.clone(),
            file: file.to_string(),
            writable,
        });
        loop {
            let unstalled = self.unstall.notified();
            if !self.stall_watchers.load(Ordering::SeqCst) {
                break;
            }
            unstalled.await;
        }
        if self.fail_run_watched.load(Ordering::SeqCst) {
            return Err(ExecutorError::Unavailable("monitor image missing".into()));
        }
        let key = (spec.store, file.to_string());
        let (tx, rx) = mpsc::channel(64);
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();
        self.state
            .lock()
            .unwrap()
            .watchers
            .insert(key.clone(), tx.clone());

        let state = self.state.clone();
        let live = Live::start(&self.live);
        tokio::spawn(async move {
            let mut input_open = writable;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    input = input_rx.recv(), if input_open => match input {
                        // The monitor reports the file it just wrote.
                        Some(contents) => {
                            state
                                .lock()
                                .unwrap()
                                .editor_writes
                                .push((key.1.clone(), contents.clone()));
                            let _ = tx.send(WatchEvent::Contents(contents)).await;
                        }
                        None => input_open = false,
                    },
                }
            }
            drop(live);
            state.lock().unwrap().watchers.remove(&key);
        });
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
        self.record(Call::RunInteractive {
            store: spec.store,
            working_directory: working_directory.to_string(),
        });
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Bytes>();
        let state = self.state.clone();
        let live = Live::start(&self.live);
        tokio::spawn(async move {
            let mut input_open = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    input = in_rx.recv(), if input_open => match input {
                        // Echo like a tty would.
                        Some(data) => {
                            state.lock().unwrap().terminal_inputs.push(data.clone());
                            let _ = out_tx.send(data).await;
                        }
                        None => input_open = false,
                    },
                }
            }
            drop(live);
        });
        Ok(Interactive {
            output: out_rx,
            input: in_tx,
        })
    }
}

pub fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::from_json(CATALOG).unwrap())
}

pub fn registry_with(executor: Arc<FakeExecutor>, config: RegistryConfig) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(catalog(), executor, config))
}

pub fn registry(executor: Arc<FakeExecutor>) -> Arc<SessionRegistry> {
    registry_with(executor, RegistryConfig::default())
}

/// A page instance with a fresh session.
pub fn page_id(url: &str) -> PageId {
    PageId::new(url, SessionId::generate()).unwrap()
}

pub fn store_of(page_id: &PageId) -> String {
    resource_name(&RegistryConfig::default().resource_prefix, page_id)
}

pub async fn next_update(rx: &mut mpsc::Receiver<Update>) -> Update {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("update stream closed")
}

/// Receives updates until one matches `pred`, returning everything seen.
pub async fn updates_until(
    rx: &mut mpsc::Receiver<Update>,
    pred: impl Fn(&Update) -> bool,
) -> Vec<Update> {
    let mut seen = Vec::new();
    loop {
        let update = next_update(rx).await;
        let done = pred(&update);
        seen.push(update);
        if done {
            return seen;
        }
    }
}

/// Polls `cond` until it holds or the test timeout passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
