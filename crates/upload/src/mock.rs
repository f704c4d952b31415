//! Scripted in-memory `SessionClient` for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use driveup_protocol::types::RemoteFile;
use driveup_protocol::{ApiError, ApiResponse};
use driveup_transfer::{BoxFuture, chunk_hash};
use tokio_util::sync::CancellationToken;

use crate::client::{
    AcceptedChunks, ChunkTarget, EmptyFile, RawResponse, SessionClient, StartSession,
    TransferObserver, UploadSession,
};
use crate::error::ClientError;

pub(crate) const UPLOAD_HOST: &str = "https://upload.mock";

/// A recorded client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Start { total_chunks: u32, total_size: u64 },
    Query { token: String },
    Chunk { token: String, number: u32, size: u64 },
    Finish { token: String },
    Cancel { token: String },
    EmptyFile { file_name: String },
}

/// Scripted misbehavior of one chunk upload.
#[derive(Debug, Clone)]
pub(crate) enum ChunkFailure {
    /// Reports `after_bytes` sent, then fails at the transport level.
    Transport { after_bytes: u64 },
    /// Answers with an error envelope.
    Api { status: u16, code: &'static str },
    /// Answers with a non-JSON body.
    Raw { status: u16, body: &'static str },
    /// Reports more bytes than the chunk holds.
    Overreport { extra: u64 },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockSession {
    pub file_name: String,
    pub expected_size: u64,
    pub total_chunks: u32,
    pub chunks: BTreeMap<u32, Vec<u8>>,
    pub cancelled: bool,
    pub finished: bool,
}

#[derive(Default)]
struct MockState {
    next_token: u32,
    sessions: HashMap<String, MockSession>,
    calls: Vec<Call>,
    chunk_failures: HashMap<u32, VecDeque<ChunkFailure>>,
    start_failures: VecDeque<ClientError>,
    query_failures: VecDeque<ClientError>,
    finish_failures: VecDeque<ClientError>,
    cancel_fails: bool,
    hang_on_chunk: Option<(u32, CancellationToken)>,
    hang_on_start: Option<CancellationToken>,
    chunk_delay: Option<Duration>,
}

/// In-memory upload server.
#[derive(Default)]
pub(crate) struct MockClient {
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn api_error(status: u16, code: &str) -> ClientError {
    ClientError::Api {
        status,
        error: ApiError {
            code: code.into(),
            description: String::new(),
        },
    }
}

fn error_body(code: &str) -> Vec<u8> {
    serde_json::to_vec(&ApiResponse::<()>::error(code, "mock error")).unwrap()
}

impl MockClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_chunk(&self, number: u32, failure: ChunkFailure) {
        self.lock()
            .chunk_failures
            .entry(number)
            .or_default()
            .push_back(failure);
    }

    pub(crate) fn fail_start(&self, error: ClientError) {
        self.lock().start_failures.push_back(error);
    }

    pub(crate) fn fail_query(&self, error: ClientError) {
        self.lock().query_failures.push_back(error);
    }

    pub(crate) fn fail_finish(&self, error: ClientError) {
        self.lock().finish_failures.push_back(error);
    }

    pub(crate) fn fail_cancel(&self) {
        self.lock().cancel_fails = true;
    }

    /// Cancels `token` when chunk `number` is sent, then never answers.
    pub(crate) fn hang_on_chunk(&self, number: u32, token: CancellationToken) {
        self.lock().hang_on_chunk = Some((number, token));
    }

    /// Cancels `token` on the next session start, then never answers.
    pub(crate) fn hang_on_start(&self, token: CancellationToken) {
        self.lock().hang_on_start = Some(token);
    }

    pub(crate) fn set_chunk_delay(&self, delay: Duration) {
        self.lock().chunk_delay = Some(delay);
    }

    /// Registers an existing session holding the given chunks.
    pub(crate) fn seed_session(
        &self,
        token: &str,
        expected_size: u64,
        total_chunks: u32,
        chunks: &[(u32, Vec<u8>)],
    ) {
        self.lock().sessions.insert(
            token.to_string(),
            MockSession {
                file_name: "seeded".into(),
                expected_size,
                total_chunks,
                chunks: chunks.iter().cloned().collect(),
                ..MockSession::default()
            },
        );
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub(crate) fn session(&self, token: &str) -> Option<MockSession> {
        self.lock().sessions.get(token).cloned()
    }

    /// Chunk numbers sent for `token`, in call order.
    pub(crate) fn chunk_calls(&self, token: &str) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Chunk { token: t, number, .. } if t == token => Some(number),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn cancelled_tokens(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Cancel { token } => Some(token),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Concatenates the accepted chunks of `token` in chunk order.
    pub(crate) fn assembled(&self, token: &str) -> Vec<u8> {
        self.session(token)
            .map(|s| s.chunks.into_values().flatten().collect())
            .unwrap_or_default()
    }
}

impl SessionClient for MockClient {
    fn start_session(
        &self,
        request: StartSession,
    ) -> BoxFuture<'_, Result<UploadSession, ClientError>> {
        Box::pin(async move {
            let hang = {
                let mut state = self.lock();
                state.calls.push(Call::Start {
                    total_chunks: request.total_chunks,
                    total_size: request.total_size,
                });
                state.hang_on_start.take()
            };
            if let Some(token) = hang {
                token.cancel();
                std::future::pending::<()>().await;
            }

            let mut state = self.lock();
            if let Some(error) = state.start_failures.pop_front() {
                return Err(error);
            }
            state.next_token += 1;
            let token = format!("token-{}", state.next_token);
            state.sessions.insert(
                token.clone(),
                MockSession {
                    file_name: request.file_name,
                    expected_size: request.total_size,
                    total_chunks: request.total_chunks,
                    ..MockSession::default()
                },
            );
            Ok(UploadSession {
                token,
                upload_host: UPLOAD_HOST.into(),
            })
        })
    }

    fn query_accepted_chunks(
        &self,
        _drive_id: i64,
        token: String,
    ) -> BoxFuture<'_, Result<AcceptedChunks, ClientError>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(Call::Query {
                token: token.clone(),
            });
            if let Some(error) = state.query_failures.pop_front() {
                return Err(error);
            }
            let session = match state.sessions.get(&token) {
                Some(s) if !s.cancelled && !s.finished => s,
                _ => return Err(ClientError::NotFound),
            };
            let chunk_size = session
                .chunks
                .iter()
                .filter(|(n, _)| **n < session.total_chunks)
                .map(|(_, data)| data.len() as u64)
                .max();
            Ok(AcceptedChunks {
                expected_size: session.expected_size,
                expected_chunks: session.total_chunks,
                chunk_size,
                accepted: session.chunks.keys().copied().collect(),
            })
        })
    }

    fn upload_chunk(
        &self,
        target: ChunkTarget,
        data: Vec<u8>,
        observer: Arc<dyn TransferObserver>,
    ) -> BoxFuture<'_, Result<RawResponse, ClientError>> {
        Box::pin(async move {
            let (failure, hang, delay) = {
                let mut state = self.lock();
                state.calls.push(Call::Chunk {
                    token: target.token.clone(),
                    number: target.chunk_number,
                    size: target.chunk_size,
                });
                let failure = state
                    .chunk_failures
                    .get_mut(&target.chunk_number)
                    .and_then(VecDeque::pop_front);
                let hang = if state
                    .hang_on_chunk
                    .as_ref()
                    .is_some_and(|(number, _)| *number == target.chunk_number)
                {
                    state.hang_on_chunk.take().map(|(_, token)| token)
                } else {
                    None
                };
                (failure, hang, state.chunk_delay)
            };

            let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);

            if let Some(token) = hang {
                token.cancel();
                std::future::pending::<()>().await;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let len = data.len() as u64;
            match failure {
                Some(ChunkFailure::Transport { after_bytes }) => {
                    let _ = observer.bytes_sent(after_bytes);
                    return Err(ClientError::Transport("connection reset by peer".into()));
                }
                Some(ChunkFailure::Api { status, code }) => {
                    return Ok(RawResponse {
                        status,
                        body: error_body(code),
                    });
                }
                Some(ChunkFailure::Raw { status, body }) => {
                    return Ok(RawResponse {
                        status,
                        body: body.as_bytes().to_vec(),
                    });
                }
                Some(ChunkFailure::Overreport { extra }) => {
                    if observer.bytes_sent(len + extra).is_break() {
                        return Err(ClientError::Aborted);
                    }
                }
                None => {}
            }

            if observer.bytes_sent(len / 2).is_break() || observer.bytes_sent(len).is_break() {
                return Err(ClientError::Aborted);
            }

            if len != target.chunk_size || target.chunk_hash != chunk_hash(&data) {
                return Ok(RawResponse {
                    status: 400,
                    body: error_body("invalid_chunk"),
                });
            }

            let mut state = self.lock();
            match state.sessions.get_mut(&target.token) {
                Some(session) if !session.cancelled && !session.finished => {
                    session.chunks.insert(target.chunk_number, data);
                    Ok(RawResponse {
                        status: 200,
                        body: br#"{"result":"success","data":null}"#.to_vec(),
                    })
                }
                _ => Ok(RawResponse {
                    status: 400,
                    body: error_body("upload_token_is_not_valid"),
                }),
            }
        })
    }

    fn finish_session(
        &self,
        _drive_id: i64,
        token: String,
    ) -> BoxFuture<'_, Result<Option<RemoteFile>, ClientError>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(Call::Finish {
                token: token.clone(),
            });
            if let Some(error) = state.finish_failures.pop_front() {
                return Err(error);
            }
            let session = match state.sessions.get_mut(&token) {
                Some(s) if !s.cancelled && !s.finished => s,
                _ => return Err(api_error(404, "object_not_found")),
            };
            let size: u64 = session.chunks.values().map(|c| c.len() as u64).sum();
            if session.chunks.len() != session.total_chunks as usize
                || size != session.expected_size
            {
                return Err(api_error(400, "upload_not_terminated"));
            }
            session.finished = true;
            Ok(Some(RemoteFile {
                id: 1000,
                name: session.file_name.clone(),
                size,
                parent_id: None,
            }))
        })
    }

    fn cancel_session(
        &self,
        _drive_id: i64,
        token: String,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(Call::Cancel {
                token: token.clone(),
            });
            if state.cancel_fails {
                return Err(ClientError::Transport("cancel failed".into()));
            }
            if let Some(session) = state.sessions.get_mut(&token) {
                session.cancelled = true;
            }
            Ok(())
        })
    }

    fn create_empty_file(
        &self,
        request: EmptyFile,
    ) -> BoxFuture<'_, Result<Option<RemoteFile>, ClientError>> {
        Box::pin(async move {
            self.lock().calls.push(Call::EmptyFile {
                file_name: request.file_name.clone(),
            });
            Ok(Some(RemoteFile {
                id: 2000,
                name: request.file_name,
                size: 0,
                parent_id: Some(request.directory_id),
            }))
        })
    }
}
