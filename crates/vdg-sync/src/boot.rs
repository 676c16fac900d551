use std::sync::Arc;
use tracing::warn;

use vdg_core::Session;
use vdg_store::{KvStore, MigrationRunner};

use crate::client::SyncClient;

/// Start-of-process work: the migration procedures and the one-time sync
/// orchestration run as independent tasks with no ordering between them.
/// Each migration re-enumerates keys itself and every procedure is flag
/// gated, so interleaving is safe. Failures never propagate.
pub async fn run_startup_tasks(kv: Arc<dyn KvStore>, sync: Arc<SyncClient>, session: Session) {
    let migrations = {
        let kv = Arc::clone(&kv);
        let session = session.clone();
        tokio::spawn(async move {
            MigrationRunner::new(kv).run_all(&session).await;
        })
    };
    let sync_task = tokio::spawn(async move {
        sync.sync_once(&session).await;
    });

    for task in [migrations, sync_task] {
        if let Err(err) = task.await {
            warn!(error = %err, "startup task panicked");
        }
    }
}
