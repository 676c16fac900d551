//! One-time destructive reset procedures.
//!
//! Each migration is an entry in an ordered registry, gated by its own
//! completion flag key in the same store it operates on. The flag is read
//! first (a set flag short-circuits the whole procedure) and written LAST,
//! only after every removal succeeded, so a partial failure re-runs the
//! procedure on the next boot instead of falsely marking it complete.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use serde_json::Value;
use vdg_core::{KeyFamily, KeyFamilyId, Session};

use crate::error::StoreError;
use crate::kv::KvStore;
use crate::user_data::UserDataStore;
use crate::venue::VenueSelector;

#[derive(Debug, Clone, Copy)]
pub enum MigrationTarget {
    /// Remove every stored key belonging to the listed families.
    Families(&'static [KeyFamilyId]),
    /// Remove only the keys of the listed families that are scoped to the
    /// venues whose names match one of `venue_names` (case-insensitive
    /// substring) or to the currently selected venue.
    VenueScoped {
        families: &'static [KeyFamilyId],
        venue_names: &'static [&'static str],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The procedure ran and its flag is now set.
    Completed,
    /// The flag was already set; nothing happened.
    AlreadyDone,
    /// A venue-targeted procedure found no questionnaire and no selected
    /// venue to resolve targets from. The flag stays unset so the reset
    /// retries once registration data exists.
    Deferred,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationDescriptor {
    pub version: &'static str,
    pub flag_key: &'static str,
    pub description: &'static str,
    pub target: MigrationTarget,
}

/// The registry, in the order the procedures shipped.
pub fn all_migrations() -> Vec<MigrationDescriptor> {
    vec![
        MigrationDescriptor {
            version: "v1",
            flag_key: "diagnosisResetCompleted_v1",
            description: "reset all per-venue diagnosis state after the answer format change",
            target: MigrationTarget::Families(&[
                KeyFamilyId::DiagnosisAnswers,
                KeyFamilyId::DiagnosisProgress,
                KeyFamilyId::DiagnosisSelectedBlocks,
                KeyFamilyId::DiagnosisNotes,
            ]),
        },
        MigrationDescriptor {
            version: "v3",
            flag_key: "pilotVenueResetCompleted_v3",
            description: "clear diagnosis state seeded into pilot venues",
            target: MigrationTarget::VenueScoped {
                families: &[
                    KeyFamilyId::DiagnosisAnswers,
                    KeyFamilyId::DiagnosisProgress,
                    KeyFamilyId::DiagnosisSelectedBlocks,
                    KeyFamilyId::DiagnosisNotes,
                ],
                venue_names: &["pilot", "demo"],
            },
        },
        MigrationDescriptor {
            version: "v4",
            flag_key: "notesResetCompleted_v4",
            description: "drop free-text notes after the notes schema change",
            target: MigrationTarget::Families(&[KeyFamilyId::DiagnosisNotes]),
        },
    ]
}

pub struct MigrationRunner {
    kv: Arc<dyn KvStore>,
    user_data: UserDataStore,
    venues: VenueSelector,
}

impl MigrationRunner {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            user_data: UserDataStore::new(kv.clone()),
            venues: VenueSelector::new(kv.clone()),
            kv,
        }
    }

    /// Runs every registered migration in order. Failures are logged and
    /// swallowed; a failed procedure retries on the next boot because its
    /// flag was never set.
    pub async fn run_all(&self, session: &Session) {
        for descriptor in all_migrations() {
            match self.run_one(session, &descriptor).await {
                Ok(MigrationOutcome::Completed) => {
                    info!(version = descriptor.version, "migration completed");
                }
                Ok(MigrationOutcome::AlreadyDone) => {
                    debug!(version = descriptor.version, "migration already done");
                }
                Ok(MigrationOutcome::Deferred) => {
                    debug!(
                        version = descriptor.version,
                        "migration deferred until registration data exists"
                    );
                }
                Err(err) => {
                    warn!(
                        version = descriptor.version,
                        error = %err,
                        "migration failed, will retry on next start"
                    );
                }
            }
        }
    }

    /// Running a procedure twice leaves the store in the same state as
    /// running it once; only a [`MigrationOutcome::Completed`] run sets the
    /// flag.
    pub async fn run_one(
        &self,
        session: &Session,
        descriptor: &MigrationDescriptor,
    ) -> Result<MigrationOutcome, StoreError> {
        if self.kv.get(descriptor.flag_key).await?.as_deref() == Some("true") {
            return Ok(MigrationOutcome::AlreadyDone);
        }

        let (family_ids, venue_filter) = match descriptor.target {
            MigrationTarget::Families(ids) => (ids, None),
            MigrationTarget::VenueScoped {
                families,
                venue_names,
            } => match self.resolve_target_venues(session, venue_names).await? {
                Some(venues) => (families, Some(venues)),
                // Latching the flag before the user has any venues would
                // permanently skip the reset for data that appears later.
                None => return Ok(MigrationOutcome::Deferred),
            },
        };

        let stored = self.kv.all_keys().await?;
        let mut to_remove = Vec::new();
        for key in &stored {
            for id in family_ids {
                let family = KeyFamily::by_id(*id);
                // Venue-map families are rewritten below for targeted
                // resets, their key only goes away on a full reset.
                if family.venue_map && venue_filter.is_some() {
                    continue;
                }
                if family.matches(key, venue_filter.as_ref()) {
                    to_remove.push(key.clone());
                    break;
                }
            }
        }
        if !to_remove.is_empty() {
            self.kv.multi_remove(&to_remove).await?;
        }

        if let Some(venues) = &venue_filter {
            for id in family_ids {
                let family = KeyFamily::by_id(*id);
                if family.venue_map {
                    self.rewrite_venue_maps(&stored, family, venues).await?;
                }
            }
        }

        info!(
            version = descriptor.version,
            removed = to_remove.len(),
            description = descriptor.description,
            "migration removed keys"
        );
        self.kv.set(descriptor.flag_key, "true").await?;
        Ok(MigrationOutcome::Completed)
    }

    /// Venues named like one of `venue_names` in the user's questionnaire,
    /// plus the currently selected venue. `None` when neither questionnaire
    /// nor selection exists yet (pre-registration): there is nothing to
    /// resolve targets from, not a legitimately empty target set.
    async fn resolve_target_venues(
        &self,
        session: &Session,
        venue_names: &[&str],
    ) -> Result<Option<BTreeSet<String>>, StoreError> {
        let questionnaire = self.user_data.load_questionnaire(session).await;
        let selected = self.venues.selected_venue_id(session).await?;
        if questionnaire.is_none() && selected.is_none() {
            return Ok(None);
        }

        let mut venues = BTreeSet::new();
        if let Some(questionnaire) = questionnaire {
            venues.extend(questionnaire.venue_ids_matching(venue_names));
        }
        if let Some(selected) = selected {
            venues.insert(selected);
        }
        Ok(Some(venues))
    }

    /// For families whose value is a map keyed by venue id, delete the
    /// matching sub-entries and rewrite each stored copy of the aggregate.
    async fn rewrite_venue_maps(
        &self,
        stored: &[String],
        family: KeyFamily,
        venues: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        for key in stored {
            if !family.matches(key, None) {
                continue;
            }
            let Some(raw) = self.kv.get(key).await? else {
                continue;
            };
            let mut map: HashMap<String, Value> = match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(err) => {
                    warn!(key, error = %err, "venue map failed to parse, leaving untouched");
                    continue;
                }
            };
            let before = map.len();
            map.retain(|venue_id, _| !venues.contains(venue_id));
            if map.len() != before {
                self.kv.set(key, &serde_json::to_string(&map)?).await?;
            }
        }
        Ok(())
    }
}
