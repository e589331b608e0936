/*!
Serving helpers shared by the stubs.
*/

use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A router served on an ephemeral local port. Aborted on drop.
pub struct StubServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StubServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Test logging routed through the test writer. Safe to call from every test.
pub fn init_tracing() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

pub async fn serve_router(router: Router) -> Result<StubServer> {
    init_tracing();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::warn!(error = %e, "stub server stopped");
        }
    });

    tracing::debug!(%addr, "stub server listening");
    Ok(StubServer { addr, task })
}
