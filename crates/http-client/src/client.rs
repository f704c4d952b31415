//! Upload-session REST client.
//!
//! Async HTTP client using `reqwest` with Bearer token authentication.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use driveup_protocol::envelope::decode_error_body;
use driveup_protocol::messages::{
    FinishSessionResponse, SessionStatusResponse, StartSessionResponse,
};
use driveup_protocol::types::RemoteFile;
use driveup_protocol::{ApiError, ApiResponse, ErrorCode};
use driveup_transfer::BoxFuture;
use driveup_upload::{
    AcceptedChunks, ChunkTarget, ClientError, EmptyFile, RawResponse, SessionClient, StartSession,
    TransferObserver, UploadSession,
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::body::observed_slices;
use crate::config::HttpClientConfig;

/// Longest raw body quoted in an error description.
const MAX_QUOTED_BODY: usize = 256;

/// Errors from building the client.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid API token")]
    InvalidToken,
}

/// `SessionClient` backed by the drive's REST API.
pub struct HttpSessionClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSessionClient {
    /// Creates a client authenticating with `config.api_token`.
    pub fn new(config: &HttpClientConfig) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_token))
                .map_err(|_| HttpError::InvalidToken)?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn drive_url(&self, drive_id: i64, path: &str) -> String {
        format!("{}/3/drive/{drive_id}/{path}", self.base_url)
    }

    fn session_url(&self, drive_id: i64, token: &str, suffix: &str) -> String {
        let token = utf8_percent_encode(token, NON_ALPHANUMERIC);
        self.drive_url(drive_id, &format!("upload/session/{token}{suffix}"))
    }

    /// Sends a request and unwraps the response envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, ClientError> {
        let resp = request.send().await.map_err(transport)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(transport)?;
        decode_envelope(status, &body)
    }
}

impl SessionClient for HttpSessionClient {
    fn start_session(
        &self,
        request: StartSession,
    ) -> BoxFuture<'_, Result<UploadSession, ClientError>> {
        Box::pin(async move {
            let url = self.drive_url(request.drive_id, "upload/session/start");
            debug!(
                file_name = %request.file_name,
                total_chunks = request.total_chunks,
                total_size = request.total_size,
                "starting upload session"
            );
            let data: StartSessionResponse = self
                .call(self.http.post(&url).json(&request.to_request()))
                .await?
                .ok_or_else(|| ClientError::Decode("session start without data".into()))?;
            Ok(UploadSession {
                token: data.token,
                upload_host: data.upload_url,
            })
        })
    }

    fn query_accepted_chunks(
        &self,
        drive_id: i64,
        token: String,
    ) -> BoxFuture<'_, Result<AcceptedChunks, ClientError>> {
        Box::pin(async move {
            let url = self.session_url(drive_id, &token, "");
            let status: SessionStatusResponse = match self.call(self.http.get(&url)).await {
                Ok(Some(status)) => status,
                Ok(None) => return Err(ClientError::Decode("session status without data".into())),
                Err(ClientError::Api { status, error })
                    if status == 404
                        || ErrorCode::parse(&error.code) == ErrorCode::ObjectNotFound =>
                {
                    return Err(ClientError::NotFound);
                }
                Err(e) => return Err(e),
            };
            trace!(%token, chunks = status.chunks.len(), "session status");
            Ok(AcceptedChunks::from(status))
        })
    }

    fn upload_chunk(
        &self,
        target: ChunkTarget,
        data: Vec<u8>,
        observer: Arc<dyn TransferObserver>,
    ) -> BoxFuture<'_, Result<RawResponse, ClientError>> {
        Box::pin(async move {
            let token = utf8_percent_encode(&target.token, NON_ALPHANUMERIC);
            let url = format!(
                "{}/3/drive/{}/upload/session/{token}/chunk",
                target.upload_host.trim_end_matches('/'),
                target.drive_id,
            );
            let len = data.len();
            let aborted = Arc::new(AtomicBool::new(false));
            let body = reqwest::Body::wrap_stream(observed_slices(
                Bytes::from(data),
                observer,
                Arc::clone(&aborted),
            ));

            let resp = self
                .http
                .post(&url)
                .query(&target.query())
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, len)
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    if aborted.load(Ordering::SeqCst) {
                        ClientError::Aborted
                    } else {
                        transport(e)
                    }
                })?;

            let status = resp.status().as_u16();
            let body = resp.bytes().await.map_err(transport)?;
            trace!(chunk = target.chunk_number, status, "chunk response");
            Ok(RawResponse {
                status,
                body: body.to_vec(),
            })
        })
    }

    fn finish_session(
        &self,
        drive_id: i64,
        token: String,
    ) -> BoxFuture<'_, Result<Option<RemoteFile>, ClientError>> {
        Box::pin(async move {
            let url = self.session_url(drive_id, &token, "/finish");
            debug!(%token, "finishing upload session");
            let data: Option<FinishSessionResponse> = self.call(self.http.post(&url)).await?;
            Ok(data.and_then(|d| d.file))
        })
    }

    fn cancel_session(
        &self,
        drive_id: i64,
        token: String,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            let url = self.session_url(drive_id, &token, "");
            debug!(%token, "cancelling upload session");
            self.call::<serde_json::Value>(self.http.delete(&url))
                .await
                .map(|_| ())
        })
    }

    fn create_empty_file(
        &self,
        request: EmptyFile,
    ) -> BoxFuture<'_, Result<Option<RemoteFile>, ClientError>> {
        Box::pin(async move {
            let url = self.drive_url(request.drive_id, "upload");
            debug!(file_name = %request.file_name, "creating empty file");
            self.call(
                self.http
                    .post(&url)
                    .query(&request.query())
                    .header(CONTENT_LENGTH, 0),
            )
            .await
        })
    }
}

fn transport(e: reqwest::Error) -> ClientError {
    ClientError::Transport(e.to_string())
}

/// Maps a status and body onto the envelope's data or a `ClientError`.
///
/// Error statuses without an envelope keep the status with an empty code.
fn decode_envelope<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<Option<T>, ClientError> {
    if !(200..300).contains(&status) {
        let error = decode_error_body(body).unwrap_or_else(|| ApiError {
            code: String::new(),
            description: quote_body(body),
        });
        return Err(ClientError::Api { status, error });
    }
    if body.is_empty() {
        return Ok(None);
    }
    let envelope: ApiResponse<T> =
        serde_json::from_slice(body).map_err(|e| ClientError::Decode(e.to_string()))?;
    envelope
        .into_result()
        .map_err(|error| ClientError::Api { status, error })
}

fn quote_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(MAX_QUOTED_BODY) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use driveup_protocol::ConflictPolicy;
    use std::ops::ControlFlow;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// A request as seen by the mock server.
    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        target: String,
        authorization: Option<String>,
        body: Vec<u8>,
    }

    type Log = Arc<Mutex<Vec<Recorded>>>;

    /// Starts a mock HTTP server answering one connection per scripted
    /// response, in order.
    async fn mock_server(responses: Vec<(u16, &str)>) -> (String, Log, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let log: Log = Arc::default();
        let responses: Vec<(u16, String)> = responses
            .into_iter()
            .map(|(status, body)| (status, body.to_string()))
            .collect();

        let server_log = Arc::clone(&log);
        let handle = tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                server_log.lock().unwrap().push(request);

                let resp = format!(
                    "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, log, handle)
    }

    async fn read_request(stream: &mut TcpStream) -> Recorded {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if n == 0 {
                break buf.len();
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let mut lines = head.lines();
        let mut request_line = lines.next().unwrap_or_default().split_whitespace();
        let method = request_line.next().unwrap_or_default().to_string();
        let target = request_line.next().unwrap_or_default().to_string();

        let mut content_length = 0;
        let mut authorization = None;
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                match name.trim().to_ascii_lowercase().as_str() {
                    "content-length" => content_length = value.trim().parse().unwrap(),
                    "authorization" => authorization = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }

        let mut body = buf[head_end..].to_vec();
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        Recorded {
            method,
            target,
            authorization,
            body,
        }
    }

    fn client(url: &str) -> HttpSessionClient {
        HttpSessionClient::new(&HttpClientConfig::new(url, "secret")).unwrap()
    }

    fn requests(log: &Log) -> Vec<Recorded> {
        log.lock().unwrap().clone()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
        stop: bool,
    }

    impl TransferObserver for Recorder {
        fn bytes_sent(&self, total: u64) -> ControlFlow<()> {
            self.seen.lock().unwrap().push(total);
            if self.stop {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }

    fn target(upload_host: &str, data: &[u8]) -> ChunkTarget {
        ChunkTarget {
            upload_host: upload_host.to_string(),
            drive_id: 7,
            token: "tok-1".into(),
            chunk_number: 2,
            chunk_size: data.len() as u64,
            chunk_hash: driveup_transfer::chunk_hash(data),
        }
    }

    #[tokio::test]
    async fn start_session_posts_request_body() {
        let (url, log, handle) = mock_server(vec![(
            200,
            r#"{"result":"success","data":{"token":"tok-1","upload_url":"https://up.example"}}"#,
        )])
        .await;

        let modified: DateTime<Utc> = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let session = client(&url)
            .start_session(StartSession {
                drive_id: 7,
                directory_id: 42,
                file_name: "clip.mov".into(),
                sub_path: None,
                total_chunks: 3,
                total_size: 120,
                created_at: None,
                modified_at: modified,
                conflict: ConflictPolicy::Rename,
            })
            .await
            .unwrap();

        assert_eq!(session.token, "tok-1");
        assert_eq!(session.upload_host, "https://up.example");

        let reqs = requests(&log);
        assert_eq!(reqs[0].method, "POST");
        assert_eq!(reqs[0].target, "/3/drive/7/upload/session/start");
        assert_eq!(reqs[0].authorization.as_deref(), Some("Bearer secret"));
        let body: serde_json::Value = serde_json::from_slice(&reqs[0].body).unwrap();
        assert_eq!(body["total_chunks"], 3);
        assert_eq!(body["conflict"], "rename");
        assert_eq!(body["last_modified_at"], 1_700_000_000);

        handle.abort();
    }

    #[tokio::test]
    async fn start_session_error_keeps_code() {
        let (url, _log, handle) = mock_server(vec![(
            400,
            r#"{"result":"error","error":{"code":"destination_not_found","description":"gone"}}"#,
        )])
        .await;

        let err = client(&url)
            .start_session(StartSession {
                drive_id: 7,
                directory_id: 42,
                file_name: "a".into(),
                sub_path: None,
                total_chunks: 1,
                total_size: 1,
                created_at: None,
                modified_at: Utc::now(),
                conflict: ConflictPolicy::Version,
            })
            .await
            .unwrap_err();

        match err {
            ClientError::Api { status, error } => {
                assert_eq!(status, 400);
                assert_eq!(error.code, "destination_not_found");
                assert_eq!(error.description, "gone");
            }
            other => panic!("expected API error, got {other:?}"),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn query_returns_accepted_chunks() {
        let (url, log, handle) = mock_server(vec![(
            200,
            r#"{"result":"success","data":{"expected_chunks":3,"expected_size":25,
                "uploaded_chunks":2,"uploaded_size":20,
                "chunks":[{"number":1,"status":"ok","size":10},{"number":2,"status":"ok","size":10}]}}"#,
        )])
        .await;

        let accepted = client(&url)
            .query_accepted_chunks(7, "tok-1".into())
            .await
            .unwrap();

        assert_eq!(accepted.expected_chunks, 3);
        assert_eq!(accepted.expected_size, 25);
        assert_eq!(accepted.chunk_size, Some(10));
        assert_eq!(accepted.accepted.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        let reqs = requests(&log);
        assert_eq!(reqs[0].method, "GET");
        assert_eq!(reqs[0].target, "/3/drive/7/upload/session/tok%2D1");

        handle.abort();
    }

    #[tokio::test]
    async fn query_of_missing_session_is_not_found() {
        let (url, _log, handle) = mock_server(vec![
            (
                404,
                r#"{"result":"error","error":{"code":"object_not_found"}}"#,
            ),
            (
                400,
                r#"{"result":"error","error":{"code":"object_not_found"}}"#,
            ),
        ])
        .await;
        let client = client(&url);

        for _ in 0..2 {
            let err = client
                .query_accepted_chunks(7, "gone".into())
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::NotFound), "{err:?}");
        }

        handle.abort();
    }

    #[tokio::test]
    async fn upload_chunk_streams_body_and_reports_bytes() {
        let (url, log, handle) =
            mock_server(vec![(200, r#"{"result":"success","data":null}"#)]).await;
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let recorder = Arc::new(Recorder::default());

        let resp = client("http://unused.invalid")
            .upload_chunk(target(&url, &data), data.clone(), recorder.clone())
            .await
            .unwrap();

        assert!(resp.is_success());
        assert_eq!(*recorder.seen.lock().unwrap(), vec![65_536, 131_072, 150_000]);

        let reqs = requests(&log);
        assert_eq!(reqs[0].method, "POST");
        assert!(
            reqs[0]
                .target
                .starts_with("/3/drive/7/upload/session/tok%2D1/chunk?chunk_number=2&chunk_size=150000&chunk_hash=sha256"),
            "{}",
            reqs[0].target
        );
        assert_eq!(reqs[0].body, data);

        handle.abort();
    }

    #[tokio::test]
    async fn upload_chunk_returns_error_status_raw() {
        let (url, _log, handle) = mock_server(vec![(502, "<html>bad gateway</html>")]).await;
        let data = vec![1u8; 10];

        let resp = client(&url)
            .upload_chunk(target(&url, &data), data, Arc::new(Recorder::default()))
            .await
            .unwrap();

        assert_eq!(resp.status, 502);
        assert_eq!(resp.body, b"<html>bad gateway</html>");

        handle.abort();
    }

    #[tokio::test]
    async fn upload_chunk_aborted_by_observer() {
        let (url, _log, handle) = mock_server(vec![(200, r#"{"result":"success"}"#)]).await;
        let data = vec![0u8; 200_000];
        let recorder = Arc::new(Recorder {
            stop: true,
            ..Recorder::default()
        });

        let err = client(&url)
            .upload_chunk(target(&url, &data), data, recorder)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Aborted), "{err:?}");

        handle.abort();
    }

    #[tokio::test]
    async fn finish_returns_created_file() {
        let (url, log, handle) = mock_server(vec![(
            200,
            r#"{"result":"success","data":{"file":{"id":99,"name":"clip.mov","size":120,"parent_id":42}}}"#,
        )])
        .await;

        let file = client(&url)
            .finish_session(7, "tok-1".into())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(file.id, 99);
        assert_eq!(file.parent_id, Some(42));
        assert_eq!(
            requests(&log)[0].target,
            "/3/drive/7/upload/session/tok%2D1/finish"
        );

        handle.abort();
    }

    #[tokio::test]
    async fn cancel_uses_delete() {
        let (url, log, handle) =
            mock_server(vec![(200, r#"{"result":"success","data":true}"#)]).await;

        client(&url).cancel_session(7, "tok".into()).await.unwrap();

        let reqs = requests(&log);
        assert_eq!(reqs[0].method, "DELETE");
        assert_eq!(reqs[0].target, "/3/drive/7/upload/session/tok");

        handle.abort();
    }

    #[tokio::test]
    async fn empty_file_uses_direct_upload() {
        let (url, log, handle) = mock_server(vec![(
            200,
            r#"{"result":"success","data":{"id":5,"name":"empty.txt","size":0}}"#,
        )])
        .await;

        let file = client(&url)
            .create_empty_file(EmptyFile {
                drive_id: 7,
                directory_id: 42,
                file_name: "empty.txt".into(),
                conflict: ConflictPolicy::Version,
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(file.id, 5);
        let reqs = requests(&log);
        assert_eq!(
            reqs[0].target,
            "/3/drive/7/upload?directory_id=42&file_name=empty.txt&total_size=0&conflict=version"
        );
        assert!(reqs[0].body.is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client(&format!("http://127.0.0.1:{port}"))
            .cancel_session(7, "tok".into())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)), "{err:?}");
    }

    #[test]
    fn envelope_decoding() {
        let ok: Option<serde_json::Value> =
            decode_envelope(200, br#"{"result":"success","data":{"a":1}}"#).unwrap();
        assert_eq!(ok.unwrap()["a"], 1);

        let empty: Option<serde_json::Value> = decode_envelope(204, b"").unwrap();
        assert!(empty.is_none());

        let err = decode_envelope::<serde_json::Value>(503, b"  Service Unavailable \n").unwrap_err();
        match err {
            ClientError::Api { status, error } => {
                assert_eq!(status, 503);
                assert!(error.code.is_empty());
                assert_eq!(error.description, "Service Unavailable");
            }
            other => panic!("expected API error, got {other:?}"),
        }

        assert!(matches!(
            decode_envelope::<serde_json::Value>(200, b"not json"),
            Err(ClientError::Decode(_))
        ));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let quoted = quote_body(body.as_bytes());
        assert_eq!(quoted.len(), MAX_QUOTED_BODY + 3);
        assert!(quoted.ends_with("..."));
    }

    #[test]
    fn invalid_token_is_rejected() {
        let err = HttpSessionClient::new(&HttpClientConfig::new("http://x", "bad\ntoken"));
        assert!(matches!(err, Err(HttpError::InvalidToken)));
    }
}
