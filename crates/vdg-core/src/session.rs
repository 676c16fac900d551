//! Explicit session context.
//!
//! Store calls take the identifiers they scope by as a value rather than
//! re-reading the ambient user/venue keys on every call.

use crate::keys::scoped_key;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub user_id: Option<String>,
    pub venue_id: Option<String>,
}

impl Session {
    /// Pre-registration context: only legacy/global keys are visible.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            venue_id: None,
        }
    }

    pub fn with_venue(mut self, venue_id: impl Into<String>) -> Self {
        self.venue_id = Some(venue_id.into());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn venue_id(&self) -> Option<&str> {
        self.venue_id.as_deref()
    }

    /// User-scoped key for this session, ignoring any selected venue.
    pub fn user_key(&self, base: &str) -> String {
        scoped_key(base, self.user_id(), None)
    }

    /// Fully scoped key: user and venue, whichever are present.
    pub fn venue_key(&self, base: &str) -> String {
        scoped_key(base, self.user_id(), self.venue_id())
    }

    /// Legacy global key, used as a read fallback for pre-account data.
    pub fn global_key(&self, base: &str) -> String {
        scoped_key(base, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_session_uses_global_keys() {
        let session = Session::anonymous();
        assert_eq!(session.user_key("diagnosisBlocks"), "diagnosisBlocks");
        assert_eq!(session.venue_key("diagnosis_notes"), "diagnosis_notes");
    }

    #[test]
    fn venue_key_embeds_both_identifiers() {
        let session = Session::for_user("u1").with_venue("v1");
        assert_eq!(session.user_key("diagnosisBlocks"), "user_u1_diagnosisBlocks");
        assert_eq!(
            session.venue_key("diagnosis_notes"),
            "user_u1_diagnosis_notes_v1"
        );
    }
}
