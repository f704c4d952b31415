//! Sends one chunk: exact-range read, hash, transfer, response validation.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use driveup_protocol::envelope::decode_error_body;
use driveup_transfer::{ChunkDescriptor, ProgressOverflow, ProgressState, UploadSource, chunk_hash};
use tracing::{trace, warn};

use crate::classifier::{Verdict, classify};
use crate::client::{ChunkTarget, RawResponse, SessionClient, TransferObserver, UploadSession};
use crate::error::{ClientError, UploadError};

/// Transmits the chunks of one session.
pub(crate) struct ChunkTransmitter {
    client: Arc<dyn SessionClient>,
    source: Arc<dyn UploadSource>,
    progress: Arc<ProgressState>,
    drive_id: i64,
    session: UploadSession,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ChunkTransmitter {
    pub(crate) fn new(
        client: Arc<dyn SessionClient>,
        source: Arc<dyn UploadSource>,
        progress: Arc<ProgressState>,
        drive_id: i64,
        session: UploadSession,
    ) -> Self {
        Self {
            client,
            source,
            progress,
            drive_id,
            session,
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        }
    }

    /// Retries `RetryChunk` failures up to `max_attempts` times in total,
    /// waiting `delay * attempt` in between.
    pub(crate) fn with_retries(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Sends `chunk`, retrying transient failures.
    pub(crate) async fn send(&self, chunk: &ChunkDescriptor) -> Result<(), UploadError> {
        let mut attempt = 1;
        loop {
            let error = match self.transmit(chunk).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if classify(&error).verdict != Verdict::RetryChunk || attempt >= self.max_attempts {
                return Err(error);
            }
            let delay = self.retry_delay * attempt;
            warn!(
                chunk = chunk.index,
                attempt,
                error = %error,
                "chunk upload failed, retrying in {delay:?}"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Sends `chunk` once.
    ///
    /// Progress credited by a failed attempt is rolled back; a successful
    /// attempt always ends up credited with exactly the chunk length.
    pub(crate) async fn transmit(&self, chunk: &ChunkDescriptor) -> Result<(), UploadError> {
        let data = self
            .source
            .read_range(chunk.offset, chunk.length)
            .await
            .map_err(UploadError::Source)?;

        let target = ChunkTarget {
            upload_host: self.session.upload_host.clone(),
            drive_id: self.drive_id,
            token: self.session.token.clone(),
            chunk_number: chunk.index,
            chunk_size: chunk.length,
            chunk_hash: chunk_hash(&data),
        };
        trace!(
            chunk = chunk.index,
            offset = chunk.offset,
            length = chunk.length,
            "sending chunk"
        );

        let attempt = Arc::new(AttemptProgress::new(Arc::clone(&self.progress)));
        let observer: Arc<dyn TransferObserver> = attempt.clone();
        let result = self.client.upload_chunk(target, data, observer).await;

        if let Some(overflow) = attempt.overflow() {
            attempt.rollback();
            return Err(overflow_error(overflow));
        }
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                attempt.rollback();
                return Err(e.into());
            }
        };
        if !response.is_success() {
            attempt.rollback();
            return Err(response_error(response));
        }
        if let Err(overflow) = attempt.settle(chunk.length) {
            attempt.rollback();
            return Err(overflow_error(overflow));
        }
        trace!(chunk = chunk.index, "chunk accepted");
        Ok(())
    }
}

fn overflow_error(overflow: ProgressOverflow) -> UploadError {
    UploadError::WrittenBytesExceeded {
        attempted: overflow.attempted,
        total: overflow.total,
    }
}

/// Turns a non-2xx answer into an error, decoding the body when possible.
fn response_error(response: RawResponse) -> UploadError {
    match decode_error_body(&response.body) {
        Some(error) => ClientError::Api {
            status: response.status,
            error,
        }
        .into(),
        None => UploadError::HttpStatus {
            status: response.status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        },
    }
}

/// Per-attempt bridge from transport callbacks to the shared counter.
struct AttemptProgress {
    progress: Arc<ProgressState>,
    /// Highest cumulative count reported by the transport.
    reported: AtomicU64,
    /// Bytes this attempt added to `progress`.
    credited: AtomicU64,
    overflow: Mutex<Option<ProgressOverflow>>,
}

impl AttemptProgress {
    fn new(progress: Arc<ProgressState>) -> Self {
        Self {
            progress,
            reported: AtomicU64::new(0),
            credited: AtomicU64::new(0),
            overflow: Mutex::new(None),
        }
    }

    fn overflow(&self) -> Option<ProgressOverflow> {
        self.overflow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn credit(&self, delta: u64) -> Result<(), ProgressOverflow> {
        self.progress.add(delta)?;
        self.credited.fetch_add(delta, Ordering::SeqCst);
        Ok(())
    }

    /// Tops the attempt up to `length` credited bytes.
    fn settle(&self, length: u64) -> Result<(), ProgressOverflow> {
        let credited = self.credited.load(Ordering::SeqCst);
        if credited < length {
            self.credit(length - credited)?;
        }
        Ok(())
    }

    fn rollback(&self) {
        let credited = self.credited.swap(0, Ordering::SeqCst);
        if credited > 0 {
            self.progress.rollback(credited);
        }
    }
}

impl TransferObserver for AttemptProgress {
    fn bytes_sent(&self, total: u64) -> ControlFlow<()> {
        if self.overflow().is_some() {
            return ControlFlow::Break(());
        }
        let previous = self.reported.fetch_max(total, Ordering::SeqCst);
        if total <= previous {
            return ControlFlow::Continue(());
        }
        match self.credit(total - previous) {
            Ok(()) => ControlFlow::Continue(()),
            Err(overflow) => {
                *self.overflow.lock().unwrap_or_else(PoisonError::into_inner) = Some(overflow);
                ControlFlow::Break(())
            }
        }
    }
}
