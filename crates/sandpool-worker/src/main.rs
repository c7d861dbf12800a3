//! Sandpool Worker
//!
//! Launched by the supervisor as `sandpool-worker <socket-path>`. Scrubs
//! the inherited environment, then serves compute requests on the socket
//! until SIGTERM, draining in-flight connections before exiting 0.
//!
//! Success responses travel over the socket; stdout stays silent and all
//! diagnostics go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sandpool_worker::loader::{ModuleLoader, StaticLoader};
use sandpool_worker::{scrub, server};

fn main() -> anyhow::Result<()> {
    let socket_path: PathBuf = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: sandpool-worker <socket-path>")?;

    // Scrub before the runtime exists: no other thread can be touching the
    // environment yet.
    scrub::scrub_environment();

    sandpool_core::tracing_init::init_tracing_stderr("sandpool_worker=info", false);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(socket_path))
}

async fn run(socket_path: PathBuf) -> anyhow::Result<()> {
    info!(socket = %socket_path.display(), "Worker starting");

    let shutdown = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            info!("Received SIGTERM, draining connections");
            shutdown.cancel();
        });
    }

    let loader: Arc<dyn ModuleLoader> = Arc::new(StaticLoader::with_builtins());
    server::serve(
        socket_path,
        loader,
        sandpool_core::wire::DEFAULT_MAX_DOCUMENT_BYTES,
        shutdown,
    )
    .await
    .context("worker server failed")?;

    info!("Worker exited cleanly");
    Ok(())
}
