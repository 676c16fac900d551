use std::sync::Arc;
use tokio::sync::Mutex;

use vdg_core::keys::SELECTED_VENUE;
use vdg_core::Session;

use crate::error::StoreError;
use crate::kv::KvStore;

/// Tracks which venue is "current" for a user.
///
/// The selection is written twice: user-scoped and global. The global copy
/// lets screens opened without navigation context recover the selection even
/// when the user id is not available (logout/login races). A crash between
/// the two writes leaves the global key authoritative until the next write.
pub struct VenueSelector {
    kv: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl VenueSelector {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    /// User-scoped selection first, global selection as fallback.
    pub async fn selected_venue_id(
        &self,
        session: &Session,
    ) -> Result<Option<String>, StoreError> {
        if session.user_id().is_some() {
            if let Some(venue_id) = self.kv.get(&session.user_key(SELECTED_VENUE)).await? {
                return Ok(Some(venue_id));
            }
        }
        self.kv.get(SELECTED_VENUE).await
    }

    /// Dual-write of the selection. The two writes are serialized under a
    /// mutex so concurrent selections cannot interleave them.
    pub async fn set_selected_venue_id(
        &self,
        session: &Session,
        venue_id: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if session.user_id().is_some() {
            self.kv
                .set(&session.user_key(SELECTED_VENUE), venue_id)
                .await?;
        }
        self.kv.set(SELECTED_VENUE, venue_id).await
    }
}
