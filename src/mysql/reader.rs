//! Snapshot reader lifecycle
//!
//! [`SnapshotReader`] owns the snapshot worker: `start()` spawns the
//! orchestrator on a dedicated task, `poll()` hands batches of events to
//! the caller, and `stop()` requests cooperative cancellation and
//! returns immediately.
//!
//! States: `Created → Running → {Stopping → Stopped, Failed}`. `start`
//! may be called at most once, `stop` is idempotent, and the terminal
//! states are absorbing. Cancellation ends in `Stopped`; a fatal
//! protocol error ends in `Failed` with the error surfaced from `poll`.

use crate::common::{
    CdcConfig, CdcError, ChangeEvent, Filters, Result, SnapshotMetrics,
};
use crate::mysql::connection::{MySqlConnection, SnapshotConnection};
use crate::mysql::schema::MySqlSchema;
use crate::mysql::snapshot::SnapshotOrchestrator;
use crate::mysql::source_info::SourceInfo;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle states of a [`SnapshotReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    /// Constructed, not yet started.
    Created = 0,
    /// The snapshot worker is running.
    Running = 1,
    /// Stop was requested; the worker is winding down.
    Stopping = 2,
    /// The worker finished or was stopped. Terminal.
    Stopped = 3,
    /// The worker hit a fatal error. Terminal.
    Failed = 4,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

/// Atomic state holder enforcing the legal transitions.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ReaderState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ReaderState {
        ReaderState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `to` if the current state is one of `allowed_from`.
    fn transition(&self, to: ReaderState, allowed_from: &[ReaderState]) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if allowed_from.contains(&ReaderState::from_u8(current)) {
                    Some(to as u8)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// Reader that produces the snapshot phase of the change stream.
pub struct SnapshotReader<C: SnapshotConnection + 'static> {
    config: Arc<CdcConfig>,
    filters: Arc<Filters>,
    schema: Arc<RwLock<MySqlSchema>>,
    metrics: Arc<SnapshotMetrics>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    events: mpsc::Receiver<ChangeEvent>,
    sink: Option<mpsc::Sender<ChangeEvent>>,
    conn: Option<C>,
    handle: Option<tokio::task::JoinHandle<()>>,
    failure: Arc<Mutex<Option<CdcError>>>,
    completed_source: Arc<Mutex<Option<SourceInfo>>>,
}

impl<C: SnapshotConnection + 'static> std::fmt::Debug for SnapshotReader<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotReader")
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

impl SnapshotReader<MySqlConnection> {
    /// Connect to the configured server and build a reader over the new
    /// session.
    pub async fn connect(config: CdcConfig) -> Result<Self> {
        config.validate()?;
        let conn = MySqlConnection::connect(&config).await?;
        Self::new(config, conn)
    }
}

impl<C: SnapshotConnection + Sync + 'static> SnapshotReader<C> {
    /// Build a reader over an established session. Validates the
    /// configuration and compiles the filters.
    pub fn new(config: CdcConfig, conn: C) -> Result<Self> {
        config.validate()?;
        let filters = Arc::new(Filters::new(&config)?);
        let (tx, rx) = mpsc::channel(config.max_queue_size);
        let metrics = Arc::new(SnapshotMetrics::new(config.server_name.clone()));
        Ok(Self {
            config: Arc::new(config),
            filters,
            schema: Arc::new(RwLock::new(MySqlSchema::new())),
            metrics,
            state: Arc::new(StateCell::new(ReaderState::Created)),
            cancel: CancellationToken::new(),
            events: rx,
            sink: Some(tx),
            conn: Some(conn),
            handle: None,
            failure: Arc::new(Mutex::new(None)),
            completed_source: Arc::new(Mutex::new(None)),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReaderState {
        self.state.load()
    }

    /// The schema model rebuilt by the snapshot. Shared-read while the
    /// snapshot runs; only the snapshot worker writes it.
    pub fn schema(&self) -> Arc<RwLock<MySqlSchema>> {
        Arc::clone(&self.schema)
    }

    /// Snapshot metrics.
    pub fn metrics(&self) -> Arc<SnapshotMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The source position streaming should resume from; present once
    /// the snapshot completed successfully.
    pub fn completed_source_info(&self) -> Option<SourceInfo> {
        self.completed_source.lock().unwrap().clone()
    }

    /// Start the snapshot worker. May be called at most once.
    pub fn start(&mut self) -> Result<()> {
        if !self
            .state
            .transition(ReaderState::Running, &[ReaderState::Created])
        {
            return Err(CdcError::invalid_state(
                "start() may be called at most once",
            ));
        }

        if !self.config.snapshot_mode.activates_snapshot() {
            info!("snapshot mode 'never': nothing to snapshot");
            self.conn.take();
            self.sink.take();
            self.state
                .transition(ReaderState::Stopped, &[ReaderState::Running]);
            return Ok(());
        }

        let conn = self
            .conn
            .take()
            .ok_or_else(|| CdcError::invalid_state("connection already consumed"))?;
        let sink = self
            .sink
            .take()
            .ok_or_else(|| CdcError::invalid_state("sink already consumed"))?;
        let orchestrator = SnapshotOrchestrator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.filters),
            Arc::clone(&self.schema),
            conn,
            SourceInfo::new(self.config.server_name.clone()),
            sink,
            self.cancel.clone(),
            Arc::clone(&self.metrics),
        );

        let state = Arc::clone(&self.state);
        let failure = Arc::clone(&self.failure);
        let completed = Arc::clone(&self.completed_source);
        self.handle = Some(tokio::spawn(async move {
            match orchestrator.execute().await {
                Ok(source) => {
                    *completed.lock().unwrap() = Some(source);
                    state.transition(
                        ReaderState::Stopped,
                        &[ReaderState::Running, ReaderState::Stopping],
                    );
                }
                Err(e) if e.is_cancellation() => {
                    state.transition(
                        ReaderState::Stopped,
                        &[ReaderState::Running, ReaderState::Stopping],
                    );
                }
                Err(e) => {
                    *failure.lock().unwrap() = Some(e);
                    state.transition(
                        ReaderState::Failed,
                        &[ReaderState::Running, ReaderState::Stopping],
                    );
                }
            }
        }));
        Ok(())
    }

    /// Return the next batch of events, blocking up to the configured
    /// poll interval for the first one. An empty batch means no events
    /// arrived in time or the reader reached a terminal state; a fatal
    /// worker error is returned once cleanup has run.
    pub async fn poll(&mut self) -> Result<Vec<ChangeEvent>> {
        if self.state.load() == ReaderState::Failed {
            return Err(self.take_failure());
        }

        let mut batch = Vec::new();
        match tokio::time::timeout(self.config.poll_interval, self.events.recv()).await {
            Ok(Some(event)) => {
                batch.push(event);
                while batch.len() < self.config.max_batch_size {
                    match self.events.try_recv() {
                        Ok(event) => batch.push(event),
                        Err(_) => break,
                    }
                }
            }
            Ok(None) => {
                // The worker dropped its sink; wait for it to publish
                // its terminal state before reporting.
                if let Some(handle) = self.handle.take() {
                    let _ = handle.await;
                }
                if self.state.load() == ReaderState::Failed {
                    return Err(self.take_failure());
                }
            }
            Err(_elapsed) => {}
        }
        Ok(batch)
    }

    /// Request cooperative cancellation and return immediately.
    /// Idempotent; terminal states absorb further stops.
    pub fn stop(&self) {
        match self.state.load() {
            ReaderState::Created => {
                self.state
                    .transition(ReaderState::Stopped, &[ReaderState::Created]);
                self.cancel.cancel();
            }
            ReaderState::Running => {
                if self
                    .state
                    .transition(ReaderState::Stopping, &[ReaderState::Running])
                {
                    info!("stopping snapshot reader");
                }
                self.cancel.cancel();
            }
            ReaderState::Stopping | ReaderState::Stopped | ReaderState::Failed => {}
        }
    }

    fn take_failure(&self) -> CdcError {
        self.failure
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| CdcError::fatal("snapshot previously failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SnapshotMode;
    use crate::mysql::connection::MemoryConnection;

    fn config() -> CdcConfig {
        CdcConfig::new("localhost", "repl", "inventory")
    }

    #[tokio::test]
    async fn test_mode_never_stops_immediately() {
        let mut reader = SnapshotReader::new(
            config().with_snapshot_mode(SnapshotMode::Never),
            MemoryConnection::new(),
        )
        .unwrap();

        assert_eq!(reader.state(), ReaderState::Created);
        reader.start().unwrap();
        assert_eq!(reader.state(), ReaderState::Stopped);

        let batch = reader.poll().await.unwrap();
        assert!(batch.is_empty());
        assert!(reader.completed_source_info().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut conn = MemoryConnection::new();
        conn.set_master_status("binlog.000001", 4, None);
        let mut reader = SnapshotReader::new(config(), conn).unwrap();

        reader.start().unwrap();
        let err = reader.start().unwrap_err();
        assert!(matches!(err, CdcError::InvalidState(_)));
        reader.stop();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_terminal() {
        let reader = SnapshotReader::new(config(), MemoryConnection::new()).unwrap();
        reader.stop();
        assert_eq!(reader.state(), ReaderState::Stopped);
        // Idempotent.
        reader.stop();
        assert_eq!(reader.state(), ReaderState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let bad = config().with_queue_sizes(10, 10);
        let err = SnapshotReader::new(bad, MemoryConnection::new()).unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
    }
}
