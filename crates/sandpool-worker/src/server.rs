//! Worker IPC server.
//!
//! Listens on a Unix-domain socket; every inbound connection carries exactly
//! one JSON request and receives exactly one JSON response. The write side
//! is half-closed after the response and the connection is dropped. On
//! shutdown the listener stops accepting, in-flight connections drain, and
//! the socket file is removed.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sandpool_core::wire::{self, Profile, WireRequest, WireResponse};

use crate::loader::{ComputeContext, ModuleLoader};

/// Errors from the worker server.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Socket setup or accept failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve compute requests on `socket_path` until `shutdown` is cancelled.
pub async fn serve(
    socket_path: PathBuf,
    loader: Arc<dyn ModuleLoader>,
    max_document_bytes: usize,
    shutdown: CancellationToken,
) -> Result<(), ServeError> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(socket = %socket_path.display(), "Worker listening");

    // In-flight connection count; the drain below waits for zero.
    let inflight = Arc::new(watch::channel(0usize).0);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        inflight.send_modify(|n| *n += 1);
                        let guard = ConnGuard {
                            inflight: Arc::clone(&inflight),
                        };
                        let loader = Arc::clone(&loader);
                        tokio::spawn(async move {
                            let _guard = guard;
                            handle_connection(stream, loader.as_ref(), max_document_bytes).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
        }
    }

    // Stop accepting, then let in-flight exchanges finish.
    drop(listener);
    let mut inflight_rx = inflight.subscribe();
    let _ = inflight_rx.wait_for(|n| *n == 0).await;

    let _ = tokio::fs::remove_file(&socket_path).await;
    info!("Worker drained and stopped");
    Ok(())
}

struct ConnGuard {
    inflight: Arc<watch::Sender<usize>>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.inflight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    loader: &dyn ModuleLoader,
    max_document_bytes: usize,
) {
    let response = process(&mut stream, loader, max_document_bytes).await;
    match response.to_vec() {
        Ok(bytes) => {
            if let Err(e) = wire::write_document(&mut stream, &bytes).await {
                debug!(error = %e, "Failed to write response");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode response"),
    }
}

/// Run one exchange: decode, resolve, invoke. Every failure takes the error
/// branch; the caller always writes back whatever this returns.
async fn process(
    stream: &mut UnixStream,
    loader: &dyn ModuleLoader,
    max_document_bytes: usize,
) -> WireResponse {
    let body = match wire::read_document(stream, max_document_bytes).await {
        Ok(body) => body,
        Err(e) => {
            return WireResponse::error("BadRequest", format!("unreadable request: {e}"), 400);
        }
    };
    let request: WireRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return WireResponse::error("BadRequest", format!("malformed request: {e}"), 400);
        }
    };
    debug!(module_url = %request.module_url, "Handling compute request");

    let module = match loader.resolve(&request.module_url).await {
        Ok(module) => module,
        Err(err) => return WireResponse::Error(err),
    };

    let ctx = ComputeContext::new();
    let outcome = module.compute(request.params, &ctx).await;
    let duration_ms = u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX);
    let response = match outcome {
        Ok(value) => WireResponse::result(value, Some(Profile { duration_ms })),
        Err(err) => WireResponse::Error(err),
    };
    ctx.finalize();
    response
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loader::StaticLoader;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;

    async fn start_server(dir: &Path) -> (PathBuf, CancellationToken, tokio::task::JoinHandle<()>) {
        let socket_path = dir.join("worker.sock");
        let token = CancellationToken::new();
        let loader: Arc<dyn ModuleLoader> = Arc::new(StaticLoader::with_builtins());

        let serve_path = socket_path.clone();
        let serve_token = token.clone();
        let task = tokio::spawn(async move {
            serve(
                serve_path,
                loader,
                wire::DEFAULT_MAX_DOCUMENT_BYTES,
                serve_token,
            )
            .await
            .unwrap();
        });

        // Wait for the socket to appear.
        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (socket_path, token, task)
    }

    async fn exchange(socket_path: &Path, request: &[u8]) -> WireResponse {
        let mut stream = UnixStream::connect(socket_path).await.unwrap();
        wire::write_document(&mut stream, request).await.unwrap();
        let body = wire::read_document(&mut stream, wire::DEFAULT_MAX_DOCUMENT_BYTES)
            .await
            .unwrap();
        WireResponse::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn serves_greet_request() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, token, task) = start_server(dir.path()).await;

        let response = exchange(
            &socket_path,
            br#"{"moduleUrl":"builtin:greet","params":{"name":"World"}}"#,
        )
        .await;
        match response {
            WireResponse::Result { value, profile } => {
                assert_eq!(value, json!("Hello, World"));
                assert!(profile.is_some());
            }
            WireResponse::Error(err) => panic!("unexpected error: {err:?}"),
        }

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_module_yields_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, token, task) = start_server(dir.path()).await;

        let response = exchange(
            &socket_path,
            br#"{"moduleUrl":"builtin:nope","params":null}"#,
        )
        .await;
        match response {
            WireResponse::Error(err) => {
                assert_eq!(err.name, "ModuleNotFound");
                assert_eq!(err.status, 404);
            }
            WireResponse::Result { .. } => panic!("expected error"),
        }

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_request_yields_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, token, task) = start_server(dir.path()).await;

        let response = exchange(&socket_path, b"this is not json").await;
        match response {
            WireResponse::Error(err) => {
                assert_eq!(err.name, "BadRequest");
                assert_eq!(err.status, 400);
            }
            WireResponse::Result { .. } => panic!("expected error"),
        }

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn module_error_takes_error_branch() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, token, task) = start_server(dir.path()).await;

        let response = exchange(
            &socket_path,
            br#"{"moduleUrl":"builtin:fail","params":{"name":"RangeError","message":"nope","status":422}}"#,
        )
        .await;
        match response {
            WireResponse::Error(err) => {
                assert_eq!(err.name, "RangeError");
                assert_eq!(err.status, 422);
            }
            WireResponse::Result { .. } => panic!("expected error"),
        }

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_and_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, token, task) = start_server(dir.path()).await;

        // An in-flight slow exchange must finish before serve returns.
        let slow_socket = socket_path.clone();
        let slow = tokio::spawn(async move {
            exchange(
                &slow_socket,
                br#"{"moduleUrl":"builtin:sleep","params":{"ms":200}}"#,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();
        task.await.unwrap();

        let response = slow.await.unwrap();
        assert!(matches!(response, WireResponse::Result { .. }));
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("worker.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let (socket_path, token, task) = {
            let token = CancellationToken::new();
            let loader: Arc<dyn ModuleLoader> = Arc::new(StaticLoader::with_builtins());
            let serve_path = socket_path.clone();
            let serve_token = token.clone();
            let task = tokio::spawn(async move {
                serve(
                    serve_path,
                    loader,
                    wire::DEFAULT_MAX_DOCUMENT_BYTES,
                    serve_token,
                )
                .await
                .unwrap();
            });
            for _ in 0..100 {
                if socket_path.exists() && std::fs::metadata(&socket_path).is_ok_and(|m| !m.is_file()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            (socket_path, token, task)
        };

        let response = exchange(
            &socket_path,
            br#"{"moduleUrl":"builtin:echo","params":1}"#,
        )
        .await;
        assert!(matches!(response, WireResponse::Result { .. }));

        token.cancel();
        task.await.unwrap();
    }
}
