use tokio::net::TcpListener;

use crate::routes::router;
use crate::state::AppState;

/// Grounded on `orch-web/src/server.rs`: bind then `axum::serve`, nothing
/// else — graceful shutdown is the daemon process's job (`verved`), not
/// this one's, since this process owns no background loops to drain.
pub async fn run_web_server(bind_addr: &str, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    axum::serve(listener, router(state)).await
}
