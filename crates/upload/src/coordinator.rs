//! Upload session coordinator.
//!
//! Drives one file through `PLANNING -> RESUMING|STARTING -> TRANSFERRING ->
//! FINISHING`, applying the classifier's verdict whenever a phase fails.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use driveup_transfer::{
    ChunkDescriptor, ChunkLayout, ChunkPlanner, ProgressCallback, ProgressEmitter, ProgressState,
    ProgressUpdate, validate_file_name, validate_sub_path,
};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::classifier::{Classification, FailureKind, Verdict, classify};
use crate::client::{EmptyFile, SessionClient, StartSession, UploadSession};
use crate::config::{ConfigError, EngineConfig};
use crate::error::{ClientError, UploadError};
use crate::store::{PendingUploadStore, StoredSession};
use crate::transmitter::ChunkTransmitter;
use crate::types::{
    UploadEvent, UploadFailure, UploadOrigin, UploadOutcome, UploadReport, UploadableFile,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Planning,
    Resuming,
    Starting,
    Transferring,
    Finishing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Planning => "planning",
            Self::Resuming => "resuming",
            Self::Starting => "starting",
            Self::Transferring => "transferring",
            Self::Finishing => "finishing",
        })
    }
}

/// Why one attempt stopped short of DONE.
enum Interrupt {
    Cancelled,
    Failed {
        phase: Phase,
        error: UploadError,
        session: Option<UploadSession>,
    },
}

impl Interrupt {
    fn failed(
        phase: Phase,
        error: impl Into<UploadError>,
        session: Option<&UploadSession>,
    ) -> Self {
        Self::Failed {
            phase,
            error: error.into(),
            session: session.cloned(),
        }
    }
}

enum Stop {
    Cancelled,
    Failed(UploadFailure),
}

#[derive(Debug, Default)]
struct Effects {
    record_discarded: bool,
    disable_auto_sync: bool,
}

/// Resumable chunked-upload engine.
pub struct UploadEngine {
    client: Arc<dyn SessionClient>,
    store: Arc<dyn PendingUploadStore>,
    planner: ChunkPlanner,
    config: EngineConfig,
}

impl UploadEngine {
    /// Creates an engine after validating `config`.
    pub fn new(
        client: Arc<dyn SessionClient>,
        store: Arc<dyn PendingUploadStore>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            client,
            store,
            planner: ChunkPlanner::new(config.limits),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Uploads `file`, holding at most `memory_budget` bytes of chunk buffers.
    ///
    /// Progress and the final result are also reported on `events`.
    /// Cancelling `cancel` stops in-flight chunks and leaves the remote
    /// session resumable. The file's source is released on success and on
    /// non-retryable failures.
    pub async fn upload(
        &self,
        file: &mut UploadableFile,
        memory_budget: u64,
        events: &mpsc::Sender<UploadEvent>,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        match self.run(file, memory_budget, events, cancel).await {
            Ok(report) => {
                info!(
                    file_id = %file.id,
                    chunks_sent = report.chunks_sent,
                    chunks_skipped = report.chunks_skipped,
                    resumed = report.resumed,
                    "upload completed"
                );
                file.release();
                let _ = events
                    .send(UploadEvent::Completed {
                        file_id: file.id.clone(),
                    })
                    .await;
                UploadOutcome::Completed(report)
            }
            Err(Stop::Cancelled) => {
                info!(file_id = %file.id, "upload cancelled, session kept for resume");
                UploadOutcome::Cancelled
            }
            Err(Stop::Failed(failure)) => {
                warn!(
                    file_id = %file.id,
                    kind = %failure.kind,
                    retryable = failure.retryable,
                    "upload failed: {}",
                    failure.description
                );
                if !failure.retryable {
                    file.release();
                }
                let _ = events
                    .send(UploadEvent::Failed {
                        file_id: file.id.clone(),
                        kind: failure.kind,
                    })
                    .await;
                UploadOutcome::Failed(failure)
            }
        }
    }

    async fn run(
        &self,
        file: &mut UploadableFile,
        memory_budget: u64,
        events: &mpsc::Sender<UploadEvent>,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, Stop> {
        // Highest value reported so far, shared by every session of this call.
        let reported = Arc::new(AtomicU64::new(0));
        let mut restarts = 0;
        loop {
            let interrupt = match self
                .attempt(file, memory_budget, events, &reported, cancel, restarts)
                .await
            {
                Ok(report) => return Ok(report),
                Err(interrupt) => interrupt,
            };
            let (phase, error, session) = match interrupt {
                Interrupt::Cancelled => return Err(Stop::Cancelled),
                Interrupt::Failed {
                    phase,
                    error,
                    session,
                } => (phase, error, session),
            };

            let classification = classify(&error);
            debug!(
                file_id = %file.id,
                %phase,
                kind = %classification.kind,
                verdict = ?classification.verdict,
                error = %error,
                "upload attempt failed"
            );
            let effects = self
                .apply_verdict(file, session.as_ref(), &classification)
                .await;

            if self.should_restart(phase, &classification, restarts) {
                restarts += 1;
                info!(file_id = %file.id, restarts, "restarting upload with a new session");
                continue;
            }
            return Err(Stop::Failed(self.failure(classification, effects)));
        }
    }

    async fn attempt(
        &self,
        file: &mut UploadableFile,
        memory_budget: u64,
        events: &mpsc::Sender<UploadEvent>,
        reported: &Arc<AtomicU64>,
        cancel: &CancellationToken,
        restarts: u32,
    ) -> Result<UploadReport, Interrupt> {
        if cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        // PLANNING
        validate_file_name(&file.file_name).map_err(|e| {
            Interrupt::failed(Phase::Planning, UploadError::InvalidRequest(e.to_string()), None)
        })?;
        if let Some(sub_path) = &file.sub_path {
            validate_sub_path(sub_path).map_err(|e| {
                Interrupt::failed(Phase::Planning, UploadError::InvalidRequest(e.to_string()), None)
            })?;
        }
        let source = file.source().cloned().ok_or_else(|| {
            Interrupt::failed(
                Phase::Planning,
                UploadError::Source(io::Error::new(
                    io::ErrorKind::NotFound,
                    "source already released",
                )),
                None,
            )
        })?;

        let size = source
            .size()
            .await
            .map_err(|e| Interrupt::failed(Phase::Planning, UploadError::Source(e), None))?;
        if size != file.size {
            info!(
                file_id = %file.id,
                expected = file.size,
                actual = size,
                "file size changed, using actual size"
            );
            file.size = size;
        }
        if file.size == 0 {
            return self.upload_empty(file, events).await;
        }

        let stored = self.load_stored_session(file).await;
        let (mut layout, stored) = self.plan(file, memory_budget, stored).await?;
        if layout.parallelism > 1 && !source.supports_concurrent_reads() {
            debug!(file_id = %file.id, "source reads are sequential, parallelism forced to 1");
            layout = layout.with_max_parallelism(1);
        }
        debug!(
            file_id = %file.id,
            file_size = layout.file_size,
            chunk_size = layout.chunk_size,
            total_chunks = layout.total_chunks,
            parallelism = layout.parallelism,
            "planned chunk layout"
        );

        // RESUMING | STARTING
        let resumed = match &stored {
            Some(stored) => self.resume(file, stored, &layout, cancel).await?,
            None => None,
        };
        let (session, accepted, resumed) = match resumed {
            Some((session, accepted)) => (session, accepted, true),
            None => (
                self.start(file, &layout, cancel).await?,
                BTreeSet::new(),
                false,
            ),
        };
        if cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        // TRANSFERRING
        let progress = Arc::new(ProgressState::new(file.size));
        let chunks = layout.descriptors(&accepted);
        let (chunks_skipped, resumed_bytes) = chunks
            .iter()
            .filter(|c| c.already_accepted)
            .fold((0u32, 0u64), |(count, bytes), c| (count + 1, bytes + c.length));
        progress.add(resumed_bytes).map_err(|e| {
            Interrupt::failed(
                Phase::Transferring,
                UploadError::WrittenBytesExceeded {
                    attempted: e.attempted,
                    total: e.total,
                },
                Some(&session),
            )
        })?;

        let mut emitter = ProgressEmitter::start(
            Arc::clone(&progress),
            self.config.progress_interval(),
            progress_callback(file.id.clone(), events.clone(), Arc::clone(reported)),
        );
        let transmitter = Arc::new(
            ChunkTransmitter::new(
                Arc::clone(&self.client),
                source,
                Arc::clone(&progress),
                file.drive_id,
                session.clone(),
            )
            .with_retries(self.config.max_chunk_attempts, self.config.chunk_retry_delay()),
        );

        let chunks_sent = match self
            .transfer(&file.id, &layout, chunks, transmitter, &session, cancel)
            .await
        {
            Ok(sent) => sent,
            Err(interrupt) => {
                emitter.stop().await;
                return Err(interrupt);
            }
        };

        // FINISHING
        debug!(file_id = %file.id, token = %session.token, "finishing session");
        let finished = until_cancelled(
            cancel,
            self.client.finish_session(file.drive_id, session.token.clone()),
        )
        .await;
        let remote = match finished {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                emitter.stop().await;
                return Err(Interrupt::failed(Phase::Finishing, e, Some(&session)));
            }
            Err(interrupt) => {
                emitter.stop().await;
                return Err(interrupt);
            }
        };
        self.clear_stored(file);
        emitter.complete().await;

        Ok(UploadReport {
            file: remote,
            chunks_sent,
            chunks_skipped,
            resumed,
            session_restarts: restarts,
        })
    }

    /// Computes the layout, pinning the chunk size of a stored session.
    ///
    /// A stored chunk size the current limits reject makes the session stale.
    async fn plan(
        &self,
        file: &UploadableFile,
        memory_budget: u64,
        stored: Option<StoredSession>,
    ) -> Result<(ChunkLayout, Option<StoredSession>), Interrupt> {
        if let Some(stored) = stored {
            match self
                .planner
                .compute_layout(file.size, memory_budget, Some(stored.chunk_size))
            {
                Ok(layout) => return Ok((layout, Some(stored))),
                Err(e) => {
                    info!(
                        file_id = %file.id,
                        token = %stored.token,
                        error = %e,
                        "stored chunk size no longer valid, starting over"
                    );
                    self.discard_session(file, &stored).await;
                }
            }
        }
        let layout = self
            .planner
            .compute_layout(file.size, memory_budget, None)
            .map_err(|e| Interrupt::failed(Phase::Planning, e, None))?;
        Ok((layout, None))
    }

    /// Loads the persisted session of `file` if it is still usable.
    async fn load_stored_session(&self, file: &UploadableFile) -> Option<StoredSession> {
        let stored = match self.store.load_session(&file.id) {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(file_id = %file.id, error = %e, "failed to load stored session");
                return None;
            }
        };
        if !stored.is_fresh(Utc::now(), self.config.session_ttl()) {
            info!(file_id = %file.id, token = %stored.token, "stored session expired");
            self.discard_session(file, &stored).await;
            return None;
        }
        if stored.upload_host.is_empty() {
            info!(file_id = %file.id, token = %stored.token, "stored session has no upload host");
            self.discard_session(file, &stored).await;
            return None;
        }
        Some(stored)
    }

    /// Returns the session and its accepted chunks if it can be resumed.
    async fn resume(
        &self,
        file: &UploadableFile,
        stored: &StoredSession,
        layout: &ChunkLayout,
        cancel: &CancellationToken,
    ) -> Result<Option<(UploadSession, BTreeSet<u32>)>, Interrupt> {
        let session = UploadSession {
            token: stored.token.clone(),
            upload_host: stored.upload_host.clone(),
        };
        let queried = until_cancelled(
            cancel,
            self.client
                .query_accepted_chunks(file.drive_id, session.token.clone()),
        )
        .await?;
        let remote = match queried {
            Ok(remote) => remote,
            Err(ClientError::NotFound) => {
                info!(file_id = %file.id, token = %session.token, "stored session no longer exists");
                self.clear_stored(file);
                return Ok(None);
            }
            Err(e) => return Err(Interrupt::failed(Phase::Resuming, e, Some(&session))),
        };

        let mismatch = if stored.expected_size != layout.file_size {
            Some("file size changed")
        } else if stored.chunk_size != layout.chunk_size {
            Some("chunk size changed")
        } else if remote.expected_size != layout.file_size {
            Some("server expects another size")
        } else if remote.chunk_size.is_some_and(|size| size != layout.chunk_size) {
            Some("server holds chunks of another size")
        } else if remote.expected_chunks != 0 && remote.expected_chunks != layout.total_chunks {
            Some("server expects another chunk count")
        } else {
            None
        };
        if let Some(reason) = mismatch {
            info!(
                file_id = %file.id,
                token = %session.token,
                reason,
                "stored session is stale, starting a new one"
            );
            self.discard_session(file, stored).await;
            return Ok(None);
        }

        let accepted: BTreeSet<u32> = remote
            .accepted
            .into_iter()
            .filter(|n| (1..=layout.total_chunks).contains(n))
            .collect();
        debug!(
            file_id = %file.id,
            token = %session.token,
            accepted = accepted.len(),
            "resuming session"
        );
        Ok(Some((session, accepted)))
    }

    /// Opens a new session and persists it before any chunk is sent.
    async fn start(
        &self,
        file: &UploadableFile,
        layout: &ChunkLayout,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, Interrupt> {
        let request = StartSession {
            drive_id: file.drive_id,
            directory_id: file.directory_id,
            file_name: file.file_name.clone(),
            sub_path: file.sub_path.clone(),
            total_chunks: layout.total_chunks,
            total_size: layout.file_size,
            created_at: file.created_at,
            modified_at: file.modified_at,
            conflict: file.conflict,
        };
        let session = until_cancelled(cancel, self.client.start_session(request))
            .await?
            .map_err(|e| Interrupt::failed(Phase::Starting, e, None))?;

        let stored = StoredSession {
            token: session.token.clone(),
            upload_host: session.upload_host.clone(),
            expected_size: layout.file_size,
            chunk_size: layout.chunk_size,
            created_at: Utc::now(),
        };
        self.store
            .save_session(&file.id, &stored)
            .map_err(|e| Interrupt::failed(Phase::Starting, e, Some(&session)))?;
        debug!(file_id = %file.id, token = %session.token, "started session");
        Ok(session)
    }

    /// Sends every chunk not yet accepted through a pool of
    /// `layout.parallelism` slots. Returns the number of chunks sent.
    async fn transfer(
        &self,
        file_id: &str,
        layout: &ChunkLayout,
        chunks: Vec<ChunkDescriptor>,
        transmitter: Arc<ChunkTransmitter>,
        session: &UploadSession,
        cancel: &CancellationToken,
    ) -> Result<u32, Interrupt> {
        let slots = Arc::new(Semaphore::new(layout.parallelism.max(1) as usize));
        let mut queue: VecDeque<ChunkDescriptor> =
            chunks.into_iter().filter(|c| !c.already_accepted).collect();
        let mut tasks: JoinSet<Result<u32, UploadError>> = JoinSet::new();
        let mut sent = 0;

        while !queue.is_empty() || !tasks.is_empty() {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tasks.shutdown().await;
                    return Err(Interrupt::Cancelled);
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let result = joined.unwrap_or_else(|e| {
                        Err(UploadError::Internal(format!("chunk task failed: {e}")))
                    });
                    match result {
                        Ok(index) => {
                            sent += 1;
                            trace!(file_id, chunk = index, sent, "chunk done");
                        }
                        Err(error) => {
                            tasks.shutdown().await;
                            return Err(Interrupt::failed(Phase::Transferring, error, Some(session)));
                        }
                    }
                }

                permit = Arc::clone(&slots).acquire_owned(), if !queue.is_empty() => {
                    let permit = permit.map_err(|e| {
                        Interrupt::failed(
                            Phase::Transferring,
                            UploadError::Internal(e.to_string()),
                            Some(session),
                        )
                    })?;
                    if let Some(chunk) = queue.pop_front() {
                        let transmitter = Arc::clone(&transmitter);
                        tasks.spawn(async move {
                            let _permit = permit;
                            transmitter.send(&chunk).await.map(|()| chunk.index)
                        });
                    }
                }
            }
        }
        Ok(sent)
    }

    /// Creates a zero-byte file without a session.
    async fn upload_empty(
        &self,
        file: &UploadableFile,
        events: &mpsc::Sender<UploadEvent>,
    ) -> Result<UploadReport, Interrupt> {
        debug!(file_id = %file.id, "empty file, creating it directly");
        if let Some(stored) = self.load_stored_session(file).await {
            self.discard_session(file, &stored).await;
        }
        let request = EmptyFile {
            drive_id: file.drive_id,
            directory_id: file.directory_id,
            file_name: file.file_name.clone(),
            conflict: file.conflict,
        };
        let remote = self
            .client
            .create_empty_file(request)
            .await
            .map_err(|e| Interrupt::failed(Phase::Starting, e, None))?;
        let _ = events
            .send(UploadEvent::Progress {
                file_id: file.id.clone(),
                update: ProgressUpdate {
                    bytes_uploaded: 0,
                    total_bytes: 0,
                    bytes_per_second: 0.0,
                    eta: None,
                },
            })
            .await;
        Ok(UploadReport {
            file: remote,
            ..UploadReport::default()
        })
    }

    /// Performs the side effects prescribed by a verdict.
    async fn apply_verdict(
        &self,
        file: &UploadableFile,
        session: Option<&UploadSession>,
        classification: &Classification,
    ) -> Effects {
        // Fatal stops raised before a session exists still clean up the stored one.
        let stored;
        let session = match session {
            Some(session) => Some(session),
            None if !classification.verdict.is_retryable() => {
                stored = self.stored_session(file);
                stored.as_ref()
            }
            None => None,
        };
        match classification.verdict {
            Verdict::RetryChunk => Effects::default(),
            Verdict::RetrySession => {
                self.clear_stored(file);
                if let Some(session) = session {
                    self.cancel_remote(file, session).await;
                }
                Effects::default()
            }
            Verdict::Fatal => {
                if let Some(session) = session {
                    self.clear_stored(file);
                    self.cancel_remote(file, session).await;
                }
                Effects::default()
            }
            Verdict::FatalWithCleanup => {
                if let Some(session) = session {
                    self.cancel_remote(file, session).await;
                }
                let record_discarded = match self.store.discard_record(&file.id) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(file_id = %file.id, error = %e, "failed to discard pending record");
                        false
                    }
                };
                Effects {
                    record_discarded,
                    disable_auto_sync: classification.kind == FailureKind::FolderNotFound
                        && file.origin == UploadOrigin::AutoSync,
                }
            }
        }
    }

    fn should_restart(&self, phase: Phase, classification: &Classification, restarts: u32) -> bool {
        classification.verdict == Verdict::RetrySession
            && phase == Phase::Transferring
            && !matches!(
                classification.kind,
                FailureKind::LockError | FailureKind::SessionIncomplete
            )
            && restarts < self.config.max_session_restarts
    }

    fn failure(&self, classification: Classification, effects: Effects) -> UploadFailure {
        let Classification {
            kind,
            verdict,
            description,
        } = classification;
        UploadFailure {
            kind,
            verdict,
            description,
            retryable: verdict.is_retryable(),
            retry_after: (kind == FailureKind::LockError).then(|| self.config.lock_retry_delay()),
            record_discarded: effects.record_discarded,
            disable_auto_sync: effects.disable_auto_sync,
        }
    }

    /// Raw stored session, regardless of age.
    fn stored_session(&self, file: &UploadableFile) -> Option<UploadSession> {
        match self.store.load_session(&file.id) {
            Ok(stored) => stored.map(|s| UploadSession {
                token: s.token,
                upload_host: s.upload_host,
            }),
            Err(e) => {
                warn!(file_id = %file.id, error = %e, "failed to load stored session");
                None
            }
        }
    }

    /// Cancels a stored session remotely and forgets it locally.
    async fn discard_session(&self, file: &UploadableFile, stored: &StoredSession) {
        let session = UploadSession {
            token: stored.token.clone(),
            upload_host: stored.upload_host.clone(),
        };
        self.cancel_remote(file, &session).await;
        self.clear_stored(file);
    }

    async fn cancel_remote(&self, file: &UploadableFile, session: &UploadSession) {
        match self
            .client
            .cancel_session(file.drive_id, session.token.clone())
            .await
        {
            Ok(()) => debug!(file_id = %file.id, token = %session.token, "cancelled remote session"),
            Err(e) => warn!(
                file_id = %file.id,
                token = %session.token,
                error = %e,
                "failed to cancel remote session"
            ),
        }
    }

    fn clear_stored(&self, file: &UploadableFile) {
        if let Err(e) = self.store.clear_session(&file.id) {
            warn!(file_id = %file.id, error = %e, "failed to clear stored session");
        }
    }
}

/// Runs `fut` unless `cancel` fires first.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, Interrupt> {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        output = fut => Ok(output),
    }
}

/// Forwards updates to `events`, dropping any below the `reported` mark.
fn progress_callback(
    file_id: String,
    events: mpsc::Sender<UploadEvent>,
    reported: Arc<AtomicU64>,
) -> ProgressCallback {
    Box::new(move |update| {
        let previous = reported.fetch_max(update.bytes_uploaded, Ordering::SeqCst);
        if update.bytes_uploaded < previous {
            return;
        }
        if let Err(e) = events.try_send(UploadEvent::Progress {
            file_id: file_id.clone(),
            update,
        }) {
            trace!(file_id = %file_id, "progress update dropped: {e}");
        }
    })
}
