//! Reconciles the local aggregate with the remote document store.
//!
//! The engine is an explicit instance with a start/stop lifecycle and an
//! injected identity; it owns no global state. Local mutations are
//! reported through [`SyncHandle::notify_change`], debounced, and pushed
//! as whole-document snapshots. Remote changes arrive on the store's
//! change feed and trigger coalesced pulls. Every failure path degrades to
//! `Offline`; the local read/write path is never blocked.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use quiz_core::merge::{MergeStrategy, merge};
use quiz_core::model::UserProgress;

use crate::error::SyncError;
use crate::remote::RemoteStore;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    Synced,
    Offline,
    Reconnecting,
}

/// The local side of the merge, implemented by the progress repository.
#[async_trait]
pub trait LocalDocumentStore: Send + Sync {
    /// Current local aggregate, if one has been loaded or created.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Local` if the local store fails.
    async fn load_local(&self) -> Result<Option<UserProgress>, SyncError>;

    /// Replace the local aggregate with a merged document.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Local` if the local store fails.
    async fn store_local(&self, doc: &UserProgress) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub strategy: MergeStrategy,
    /// Quiet period between a local mutation and the snapshot push.
    pub debounce: Duration,
    /// Bound on the initial connect attempt before falling back to
    /// local-only offline mode.
    pub connect_timeout: Duration,
    /// Bound on reconnect cycles and individual pushes.
    pub reconnect_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::default(),
            debounce: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum Command {
    Changed,
    Retry,
    SetOnline(bool),
    PullTick,
    Stop,
}

/// Handle for talking to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SyncState>,
}

impl SyncHandle {
    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    /// Watch receiver for state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_rx.clone()
    }

    /// Report a committed local mutation. Never blocks; a full queue means
    /// a push is already pending, which covers this change too.
    pub fn notify_change(&self) {
        let _ = self.command_tx.try_send(Command::Changed);
    }

    /// Request one fresh pull-merge-push cycle.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotRunning` if the engine has stopped.
    pub async fn retry(&self) -> Result<(), SyncError> {
        self.command_tx
            .send(Command::Retry)
            .await
            .map_err(|_| SyncError::NotRunning)
    }

    /// Report a network transition. Going online triggers a reconnect
    /// cycle; going offline buffers mutations without blocking them.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotRunning` if the engine has stopped.
    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        self.command_tx
            .send(Command::SetOnline(online))
            .await
            .map_err(|_| SyncError::NotRunning)
    }

    /// Stop the engine.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotRunning` if the engine already stopped.
    pub async fn stop(&self) -> Result<(), SyncError> {
        self.command_tx
            .send(Command::Stop)
            .await
            .map_err(|_| SyncError::NotRunning)
    }
}

/// Start a sync engine for `identity` and return its handle.
#[must_use]
pub fn spawn(
    identity: impl Into<String>,
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalDocumentStore>,
) -> SyncHandle {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(SyncState::Disconnected);
    let (pull_tx, pull_rx) = mpsc::channel(8);

    let engine = SyncEngine {
        identity: identity.into(),
        config,
        remote,
        local,
        state_tx,
        command_tx: command_tx.clone(),
        command_rx,
        pull_tx,
        pull_rx,
        pull_generation: 0,
        pulls_in_flight: 0,
        dirty: false,
        push_deadline: None,
        feed_task: None,
    };
    tokio::spawn(engine.run());

    SyncHandle {
        command_tx,
        state_rx,
    }
}

type PullResult = (u64, Result<Option<UserProgress>, SyncError>);

struct SyncEngine {
    identity: String,
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalDocumentStore>,
    state_tx: watch::Sender<SyncState>,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    pull_tx: mpsc::Sender<PullResult>,
    pull_rx: mpsc::Receiver<PullResult>,
    pull_generation: u64,
    pulls_in_flight: usize,
    dirty: bool,
    push_deadline: Option<Instant>,
    feed_task: Option<JoinHandle<()>>,
}

impl SyncEngine {
    async fn run(mut self) {
        self.set_state(SyncState::Connecting);
        match timeout(self.config.connect_timeout, self.cycle()).await {
            Ok(Ok(())) => {
                self.subscribe_feed().await;
                self.set_state(SyncState::Synced);
            }
            Ok(Err(err)) => {
                warn!(identity = %self.identity, error = %err, "initial connect failed, going offline");
                self.set_state(SyncState::Offline);
            }
            Err(_) => {
                warn!(identity = %self.identity, "initial connect timed out, going offline");
                self.set_state(SyncState::Offline);
            }
        }

        loop {
            let deadline = self
                .push_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    None | Some(Command::Stop) => break,
                    Some(Command::Changed) => self.on_changed(),
                    Some(Command::Retry) => self.reconnect().await,
                    Some(Command::SetOnline(true)) => self.reconnect().await,
                    Some(Command::SetOnline(false)) => {
                        debug!(identity = %self.identity, "network reported offline");
                        self.set_state(SyncState::Offline);
                    }
                    Some(Command::PullTick) => self.request_pull(),
                },
                () = sleep_until(deadline), if self.push_deadline.is_some() => {
                    self.push_deadline = None;
                    self.push_snapshot().await;
                }
                result = self.pull_rx.recv(), if self.pulls_in_flight > 0 => {
                    if let Some((generation, result)) = result {
                        self.pulls_in_flight -= 1;
                        self.on_pull_result(generation, result).await;
                    }
                }
            }
        }

        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
        self.set_state(SyncState::Disconnected);
        info!(identity = %self.identity, "sync engine stopped");
    }

    fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SyncState) {
        self.state_tx.send_replace(state);
    }

    fn on_changed(&mut self) {
        if self.state() == SyncState::Synced {
            self.push_deadline = Some(Instant::now() + self.config.debounce);
        } else {
            // Buffered, never blocked: the next reconnect cycle carries it.
            self.dirty = true;
        }
    }

    /// One pull-merge-push pass against the remote.
    async fn cycle(&self) -> Result<(), SyncError> {
        let remote_doc = self.remote.get_document(&self.identity).await?;
        let local_doc = self
            .local
            .load_local()
            .await?;

        match (local_doc, remote_doc) {
            (Some(local), Some(remote)) => {
                let merged = merge(&local, &remote, self.config.strategy);
                if merged != local {
                    self.local.store_local(&merged).await?;
                }
                self.remote.put_document(&self.identity, &merged).await?;
            }
            (Some(local), None) => {
                self.remote.put_document(&self.identity, &local).await?;
            }
            (None, Some(remote)) => {
                self.local.store_local(&remote).await?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn reconnect(&mut self) {
        self.set_state(SyncState::Reconnecting);
        match timeout(self.config.reconnect_timeout, self.cycle()).await {
            Ok(Ok(())) => {
                debug!(identity = %self.identity, was_dirty = self.dirty, "reconnect cycle complete");
                self.dirty = false;
                self.subscribe_feed().await;
                self.set_state(SyncState::Synced);
            }
            Ok(Err(err)) => {
                warn!(identity = %self.identity, error = %err, "reconnect failed");
                self.set_state(SyncState::Offline);
            }
            Err(_) => {
                warn!(identity = %self.identity, "reconnect timed out");
                self.set_state(SyncState::Offline);
            }
        }
    }

    async fn subscribe_feed(&mut self) {
        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
        match self.remote.changes(&self.identity).await {
            Ok(mut feed) => {
                let command_tx = self.command_tx.clone();
                self.feed_task = Some(tokio::spawn(async move {
                    while feed.recv().await.is_some() {
                        if command_tx.send(Command::PullTick).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "change feed unavailable");
            }
        }
    }

    /// Start a pull in the background. A newer request supersedes older
    /// in-flight ones: stale generations are discarded on arrival.
    fn request_pull(&mut self) {
        if self.state() != SyncState::Synced {
            return;
        }
        self.pull_generation += 1;
        let generation = self.pull_generation;
        let remote = Arc::clone(&self.remote);
        let identity = self.identity.clone();
        let pull_tx = self.pull_tx.clone();
        self.pulls_in_flight += 1;
        tokio::spawn(async move {
            let result = remote.get_document(&identity).await;
            let _ = pull_tx.send((generation, result)).await;
        });
    }

    async fn on_pull_result(
        &mut self,
        generation: u64,
        result: Result<Option<UserProgress>, SyncError>,
    ) {
        if generation < self.pull_generation {
            debug!(identity = %self.identity, generation, "discarding superseded pull");
            return;
        }
        let remote_doc = match result {
            Ok(doc) => doc,
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "pull failed, going offline");
                self.set_state(SyncState::Offline);
                return;
            }
        };
        let local_doc = match self.local.load_local().await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "local load failed during pull apply");
                return;
            }
        };

        match (local_doc, remote_doc) {
            (Some(local), Some(remote)) => {
                let merged = merge(&local, &remote, self.config.strategy);
                if merged != local {
                    if let Err(err) = self.local.store_local(&merged).await {
                        warn!(identity = %self.identity, error = %err, "failed to store merged document");
                        return;
                    }
                }
                if merged != remote {
                    // The next debounce window pushes the merged state back.
                    self.push_deadline = Some(Instant::now());
                }
            }
            (Some(_), None) => {
                self.push_deadline = Some(Instant::now());
            }
            (None, Some(remote)) => {
                if let Err(err) = self.local.store_local(&remote).await {
                    warn!(identity = %self.identity, error = %err, "failed to adopt remote document");
                }
            }
            (None, None) => {}
        }
    }

    async fn push_snapshot(&mut self) {
        if self.state() != SyncState::Synced {
            self.dirty = true;
            return;
        }
        let snapshot = match self.local.load_local().await {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "local load failed before push");
                return;
            }
        };
        match timeout(
            self.config.reconnect_timeout,
            self.remote.put_document(&self.identity, &snapshot),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(identity = %self.identity, "pushed snapshot");
            }
            Ok(Err(err)) => {
                warn!(identity = %self.identity, error = %err, "push failed, going offline");
                self.dirty = true;
                self.set_state(SyncState::Offline);
            }
            Err(_) => {
                warn!(identity = %self.identity, "push timed out, going offline");
                self.dirty = true;
                self.set_state(SyncState::Offline);
            }
        }
    }
}
