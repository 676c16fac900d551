//! Storage key namespace.
//!
//! Every persisted value lives under a string key derived from a base name
//! plus the identifiers available in the current [`Session`](crate::Session):
//!
//! - `base` — legacy/global form, written before accounts existed
//! - `user_{userId}_{base}` — user-scoped form
//! - `{base}_{venueId}` / `user_{userId}_{base}_{venueId}` — venue-suffixed forms
//!
//! The same `(base, user, venue)` triple always maps to the same key, and
//! distinct triples never collide for non-empty components.

use std::collections::BTreeSet;

/// Global key holding the registered user id.
pub const USER_ID: &str = "userId";

/// Selected venue pointer, written both globally and user-scoped.
pub const SELECTED_VENUE: &str = "diagnosis_selected_venue_id";

pub const BLOCKS: &str = "diagnosisBlocks";
pub const TASKS: &str = "actionPlanTasks";
pub const QUESTIONNAIRE: &str = "questionnaireData";
pub const QUESTIONNAIRE_COMPLETED: &str = "questionnaireCompleted";

pub const DASHBOARD_ALL_BLOCKS_COMPLETED: &str = "dashboardAllBlocksCompleted";
pub const DASHBOARD_PREVIOUS_RESULT: &str = "dashboardPreviousResult";
pub const DASHBOARD_CURRENT_RESULT: &str = "dashboardCurrentResult";

/// Per-block answer snapshots: `diagnosis_answers_{blockId}`, venue-suffixed.
pub const DIAGNOSIS_ANSWERS_PREFIX: &str = "diagnosis_answers";
/// Per-user progress map keyed by venue id inside the value.
pub const DIAGNOSIS_PROGRESS: &str = "diagnosis_progress";
pub const DIAGNOSIS_SELECTED_BLOCKS: &str = "diagnosis_selected_blocks";
pub const DIAGNOSIS_NOTES: &str = "diagnosis_notes";

/// Compose a storage key from a base name and the identifiers at hand.
pub fn scoped_key(base: &str, user_id: Option<&str>, venue_id: Option<&str>) -> String {
    match (user_id, venue_id) {
        (None, None) => base.to_string(),
        (Some(user), None) => format!("user_{user}_{base}"),
        (None, Some(venue)) => format!("{base}_{venue}"),
        (Some(user), Some(venue)) => format!("user_{user}_{base}_{venue}"),
    }
}

/// How a key family is scoped when written through [`scoped_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// One global key, never user- or venue-scoped.
    Global,
    /// Global legacy form plus a user-scoped form.
    User,
    /// User-scoped and venue-suffixed forms.
    UserVenue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamilyId {
    SelectedVenue,
    Blocks,
    Tasks,
    Questionnaire,
    QuestionnaireCompleted,
    DashboardAllBlocksCompleted,
    DashboardPreviousResult,
    DashboardCurrentResult,
    DiagnosisAnswers,
    DiagnosisProgress,
    DiagnosisSelectedBlocks,
    DiagnosisNotes,
}

/// A typed key family: base name plus scoping rule.
///
/// Migrations target families by identity instead of scanning raw keys for
/// substrings, so adding a new key later cannot silently widen an old reset.
#[derive(Debug, Clone, Copy)]
pub struct KeyFamily {
    pub id: KeyFamilyId,
    pub base: &'static str,
    pub scope: KeyScope,
    /// The base is a prefix followed by `_{discriminator}` (e.g. a block id)
    /// rather than a complete key name.
    pub open_ended: bool,
    /// The value is a JSON map keyed by venue id, so venue-targeted resets
    /// rewrite sub-entries instead of deleting whole keys.
    pub venue_map: bool,
}

impl KeyFamily {
    pub const ALL: &'static [KeyFamily] = &[
        KeyFamily {
            id: KeyFamilyId::SelectedVenue,
            base: SELECTED_VENUE,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::Blocks,
            base: BLOCKS,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::Tasks,
            base: TASKS,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::Questionnaire,
            base: QUESTIONNAIRE,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::QuestionnaireCompleted,
            base: QUESTIONNAIRE_COMPLETED,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::DashboardAllBlocksCompleted,
            base: DASHBOARD_ALL_BLOCKS_COMPLETED,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::DashboardPreviousResult,
            base: DASHBOARD_PREVIOUS_RESULT,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::DashboardCurrentResult,
            base: DASHBOARD_CURRENT_RESULT,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::DiagnosisAnswers,
            base: DIAGNOSIS_ANSWERS_PREFIX,
            scope: KeyScope::UserVenue,
            open_ended: true,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::DiagnosisProgress,
            base: DIAGNOSIS_PROGRESS,
            scope: KeyScope::User,
            open_ended: false,
            venue_map: true,
        },
        KeyFamily {
            id: KeyFamilyId::DiagnosisSelectedBlocks,
            base: DIAGNOSIS_SELECTED_BLOCKS,
            scope: KeyScope::UserVenue,
            open_ended: false,
            venue_map: false,
        },
        KeyFamily {
            id: KeyFamilyId::DiagnosisNotes,
            base: DIAGNOSIS_NOTES,
            scope: KeyScope::UserVenue,
            open_ended: false,
            venue_map: false,
        },
    ];

    pub fn by_id(id: KeyFamilyId) -> KeyFamily {
        *Self::ALL
            .iter()
            .find(|family| family.id == id)
            .expect("every KeyFamilyId has a registry entry")
    }

    /// Whether a stored key belongs to this family.
    ///
    /// `venues == None` matches every scoped form of the family; `Some(set)`
    /// restricts the match to keys suffixed with one of the given venue ids
    /// (used by venue-targeted resets, which must leave other venues alone).
    pub fn matches(&self, key: &str, venues: Option<&BTreeSet<String>>) -> bool {
        let Some(idx) = key.find(self.base) else {
            return false;
        };
        let prefix = &key[..idx];
        if !prefix.is_empty() && !(prefix.starts_with("user_") && prefix.ends_with('_')) {
            return false;
        }

        let suffix = &key[idx + self.base.len()..];
        match (self.open_ended, venues) {
            // A complete base: the tail is empty or a venue suffix.
            (false, None) => match self.scope {
                KeyScope::Global | KeyScope::User => suffix.is_empty(),
                KeyScope::UserVenue => suffix.is_empty() || suffix.starts_with('_'),
            },
            (false, Some(set)) => suffix
                .strip_prefix('_')
                .is_some_and(|venue| set.contains(venue)),
            // An open-ended base always carries `_{discriminator}`.
            (true, None) => suffix.starts_with('_'),
            (true, Some(set)) => {
                suffix.starts_with('_')
                    && set
                        .iter()
                        .any(|venue| suffix.ends_with(&format!("_{venue}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_key_covers_the_presence_matrix() {
        assert_eq!(scoped_key(BLOCKS, None, None), "diagnosisBlocks");
        assert_eq!(
            scoped_key(BLOCKS, Some("u1"), None),
            "user_u1_diagnosisBlocks"
        );
        assert_eq!(
            scoped_key(DIAGNOSIS_NOTES, None, Some("v1")),
            "diagnosis_notes_v1"
        );
        assert_eq!(
            scoped_key(DIAGNOSIS_NOTES, Some("u1"), Some("v1")),
            "user_u1_diagnosis_notes_v1"
        );
    }

    #[test]
    fn scoped_key_is_deterministic() {
        let a = scoped_key("base", Some("user"), Some("venue"));
        let b = scoped_key("base", Some("user"), Some("venue"));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_triples_never_collide() {
        let triples = [
            ("notes", None, None),
            ("notes", Some("u1"), None),
            ("notes", None, Some("v1")),
            ("notes", Some("u1"), Some("v1")),
            ("notes", Some("u2"), Some("v1")),
            ("notes", Some("u1"), Some("v2")),
            ("progress", Some("u1"), Some("v1")),
        ];
        let keys: Vec<String> = triples
            .iter()
            .map(|&(base, user, venue)| scoped_key(base, user, venue))
            .collect();
        for (i, a) in keys.iter().enumerate() {
            for (j, b) in keys.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "triples {:?} and {:?}", triples[i], triples[j]);
                }
            }
        }
    }

    #[test]
    fn family_matches_every_scoped_form() {
        let family = KeyFamily::by_id(KeyFamilyId::DiagnosisNotes);
        assert!(family.matches("diagnosis_notes", None));
        assert!(family.matches("diagnosis_notes_v1", None));
        assert!(family.matches("user_u1_diagnosis_notes", None));
        assert!(family.matches("user_u1_diagnosis_notes_v1", None));
        assert!(!family.matches("diagnosis_progress", None));
        assert!(!family.matches("user_u1_diagnosisBlocks", None));
    }

    #[test]
    fn venue_restriction_only_matches_listed_venues() {
        let family = KeyFamily::by_id(KeyFamilyId::DiagnosisAnswers);
        let venues: BTreeSet<String> = ["v1".to_string()].into();
        assert!(family.matches("diagnosis_answers_finance_v1", Some(&venues)));
        assert!(family.matches("user_u1_diagnosis_answers_finance_v1", Some(&venues)));
        assert!(!family.matches("diagnosis_answers_finance_v2", Some(&venues)));
        assert!(!family.matches("diagnosis_answers_finance", Some(&venues)));
    }

    #[test]
    fn user_scoped_family_does_not_match_venue_suffixed_keys() {
        let family = KeyFamily::by_id(KeyFamilyId::Blocks);
        assert!(family.matches("diagnosisBlocks", None));
        assert!(family.matches("user_u1_diagnosisBlocks", None));
        assert!(!family.matches("diagnosisBlocks_v1", None));
    }

    #[test]
    fn selected_blocks_family_does_not_shadow_selected_venue() {
        let blocks = KeyFamily::by_id(KeyFamilyId::DiagnosisSelectedBlocks);
        assert!(!blocks.matches(SELECTED_VENUE, None));
        let venue = KeyFamily::by_id(KeyFamilyId::SelectedVenue);
        assert!(!venue.matches("diagnosis_selected_blocks", None));
    }
}
