//! Background job: drop expired authorization codes and access tokens.
//!
//! Expired entries are already rejected on use; this keeps the persisted
//! blob from growing with tokens nobody will present again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::auth::Authority;

/// Spawn the periodic sweep. Call this once at startup.
pub fn spawn(authority: Arc<Authority>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        // the first tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep(&authority).await;
        }
    })
}

async fn sweep(authority: &Authority) -> usize {
    let removed = authority.purge_expired().await;
    if removed > 0 {
        tracing::info!(removed, "expired codes and access tokens removed");
    }
    removed
}
