//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with tool-server child processes:
//! - Writing JSON-RPC requests to stdin (one JSON object per line)
//! - A background reader task that routes each response on stdout to the
//!   request waiting on the same `id`
//!
//! Several requests may be in flight on one transport at once; correlation
//! is by id only, so responses may arrive in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport and start its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            pending,
            closed,
            reader,
        }
    }

    /// Whether the server's stdout has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a JSON-RPC request and wait up to `timeout` for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        // The reader may have shut down between the check above and the insert.
        if self.is_closed() {
            lock_pending(&self.pending).remove(&id);
            return Err(self.closed_error());
        }

        let line = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        });
        let written = match line {
            Ok(line) => self.write_line(line).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            lock_pending(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(McpError::Timeout {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        self.write_line(notification.to_string()).await
    }

    /// Drop the write half, closing the server's stdin.
    ///
    /// Later requests fail with a transport error. Idempotent.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write_line(&self, mut line: String) -> Result<(), McpError> {
        line.push('\n');
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::TransportError {
            server: self.server_name.clone(),
            reason: "transport closed".into(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Route responses from stdout to their waiting requests until EOF.
async fn read_loop<R>(server: String, stdout: R, pending: PendingMap, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(resp) => {
                        let waiter = lock_pending(&pending).remove(&resp.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => tracing::debug!(
                                server = %server,
                                id = resp.id,
                                "dropping response with no waiting request"
                            ),
                        }
                    }
                    // Servers sometimes log to stdout; skip anything that is not a response.
                    Err(_) => tracing::debug!(
                        server = %server,
                        line = %trimmed,
                        "ignoring non-response output"
                    ),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "stdout read failed");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every in-flight request with a closed error.
    lock_pending(&pending).clear();
    tracing::debug!(server = %server, "transport reader finished");
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::JsonRpcError;

    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Wire a transport to an in-memory peer.
    ///
    /// Returns the transport plus the peer's view: lines the client wrote,
    /// and a writer for the client's "stdout".
    fn in_memory_transport() -> (
        StdioTransport,
        tokio::io::Lines<BufReader<tokio::io::DuplexStream>>,
        tokio::io::DuplexStream,
    ) {
        let (client_stdin, server_stdin) = duplex(64 * 1024);
        let (server_stdout, client_stdout) = duplex(64 * 1024);
        let transport = StdioTransport::new("mem", client_stdin, client_stdout);
        (transport, BufReader::new(server_stdin).lines(), server_stdout)
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (transport, mut requests, mut stdout) = in_memory_transport();
        let transport = Arc::new(transport);

        let t1 = Arc::clone(&transport);
        let first = tokio::spawn(async move {
            t1.request("first", None, Duration::from_secs(5)).await
        });
        let t2 = Arc::clone(&transport);
        let second = tokio::spawn(async move {
            t2.request("second", None, Duration::from_secs(5)).await
        });

        let mut seen = Vec::new();
        for _ in 0..2 {
            let line = requests.next_line().await.unwrap().unwrap();
            let req: JsonRpcRequest = serde_json::from_str(&line).unwrap();
            seen.push(req);
        }

        // Answer in reverse order, with some log noise in between.
        stdout.write_all(b"server booting...\n").await.unwrap();
        for req in seen.iter().rev() {
            let resp = JsonRpcResponse::success(req.id, serde_json::json!({"method": req.method}));
            let mut line = serde_json::to_string(&resp).unwrap();
            line.push('\n');
            stdout.write_all(line.as_bytes()).await.unwrap();
        }

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.result.unwrap()["method"], "first");
        assert_eq!(second.result.unwrap()["method"], "second");
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (transport, _requests, _stdout) = in_memory_transport();
        let err = transport
            .request("slow", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(transport.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_stdout_fails_pending_and_future_requests() {
        let (transport, _requests, stdout) = in_memory_transport();
        let transport = Arc::new(transport);

        let t = Arc::clone(&transport);
        let pending = tokio::spawn(async move {
            t.request("never", None, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(stdout);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.is_closed());
        let err = transport
            .request("after", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }

    #[tokio::test]
    async fn test_close_ends_peer_input() {
        let (transport, mut requests, _stdout) = in_memory_transport();
        transport.close().await;
        transport.close().await;

        assert!(requests.next_line().await.unwrap().is_none());
        let err = transport.notify("late", None).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }
}
