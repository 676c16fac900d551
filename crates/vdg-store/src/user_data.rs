use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use serde_json::Value;
use vdg_core::keys::{
    scoped_key, BLOCKS, DASHBOARD_ALL_BLOCKS_COMPLETED, DASHBOARD_CURRENT_RESULT,
    DASHBOARD_PREVIOUS_RESULT, DIAGNOSIS_ANSWERS_PREFIX, DIAGNOSIS_NOTES, DIAGNOSIS_PROGRESS,
    DIAGNOSIS_SELECTED_BLOCKS, QUESTIONNAIRE, QUESTIONNAIRE_COMPLETED, TASKS, USER_ID,
};
use vdg_core::{
    DashboardRollup, DashboardUpdate, DiagnosisBlockState, DiagnosisNote, QuestionnaireData,
    Session, TaskRecord,
};

use crate::error::StoreError;
use crate::kv::KvStore;

/// Typed accessors for the user-scoped domain aggregates.
///
/// Loads never fail: a storage or parse error is logged and read as "no
/// data", and every load falls back to the legacy global key when the
/// user-scoped key is absent. Writes surface [`StoreError`] to the caller.
pub struct UserDataStore {
    kv: Arc<dyn KvStore>,
    // Serializes multi-key logical writes (dashboard, progress map) so two
    // concurrent updates cannot interleave their individual key writes.
    write_lock: Mutex<()>,
}

impl UserDataStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn user_id(&self) -> Option<String> {
        self.read_opt(USER_ID).await
    }

    pub async fn set_user_id(&self, user_id: &str) -> Result<(), StoreError> {
        self.kv.set(USER_ID, user_id).await
    }

    /// Scoped-over-global read: the user-scoped value wins, the global value
    /// is only consulted when the scoped key is absent.
    async fn read_scoped(
        &self,
        session: &Session,
        base: &str,
    ) -> Result<Option<String>, StoreError> {
        if session.user_id().is_some() {
            if let Some(value) = self.kv.get(&session.user_key(base)).await? {
                return Ok(Some(value));
            }
        }
        self.kv.get(base).await
    }

    async fn read_opt(&self, key: &str) -> Option<String> {
        match self.kv.get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "read failed, treating as absent");
                None
            }
        }
    }

    fn parse_or_log<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "stored value failed to parse, treating as absent");
                None
            }
        }
    }

    async fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        session: &Session,
        base: &str,
    ) -> Option<T> {
        let raw = self.read_scoped_logged(session, base).await?;
        Self::parse_or_log(base, &raw)
    }

    /// Venue-aware read: the user+venue key first, then the venue-suffixed
    /// global form written before accounts existed. Venue-scoped aggregates
    /// are stored under [`Session::venue_key`], so their reads must carry
    /// the venue suffix too.
    async fn read_venue_scoped(
        &self,
        session: &Session,
        base: &str,
    ) -> Result<Option<String>, StoreError> {
        if session.user_id().is_some() {
            if let Some(value) = self.kv.get(&session.venue_key(base)).await? {
                return Ok(Some(value));
            }
        }
        self.kv
            .get(&scoped_key(base, None, session.venue_id()))
            .await
    }

    async fn load_venue_json<T: serde::de::DeserializeOwned>(
        &self,
        session: &Session,
        base: &str,
    ) -> Option<T> {
        match self.read_venue_scoped(session, base).await {
            Ok(Some(raw)) => Self::parse_or_log(base, &raw),
            Ok(None) => None,
            Err(err) => {
                warn!(base, error = %err, "read failed, treating as absent");
                None
            }
        }
    }

    async fn save_json<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.kv.set(key, &raw).await
    }

    pub async fn save_blocks(
        &self,
        session: &Session,
        blocks: &[DiagnosisBlockState],
    ) -> Result<(), StoreError> {
        self.save_json(&session.user_key(BLOCKS), &blocks).await
    }

    pub async fn load_blocks(&self, session: &Session) -> Option<Vec<DiagnosisBlockState>> {
        self.load_json(session, BLOCKS).await
    }

    pub async fn save_tasks(
        &self,
        session: &Session,
        tasks: &[TaskRecord],
    ) -> Result<(), StoreError> {
        self.save_json(&session.user_key(TASKS), &tasks).await
    }

    /// Missing or unparseable tasks read as an empty list.
    pub async fn load_tasks(&self, session: &Session) -> Vec<TaskRecord> {
        self.load_json(session, TASKS).await.unwrap_or_default()
    }

    pub async fn save_questionnaire(
        &self,
        session: &Session,
        data: &QuestionnaireData,
    ) -> Result<(), StoreError> {
        self.save_json(&session.user_key(QUESTIONNAIRE), data).await
    }

    pub async fn load_questionnaire(&self, session: &Session) -> Option<QuestionnaireData> {
        self.load_json(session, QUESTIONNAIRE).await
    }

    /// Dedicated completion flag, not derived from questionnaire data.
    pub async fn is_questionnaire_completed(&self, session: &Session) -> bool {
        self.read_opt(&session.user_key(QUESTIONNAIRE_COMPLETED))
            .await
            .as_deref()
            == Some("true")
    }

    pub async fn set_questionnaire_completed(&self, session: &Session) -> Result<(), StoreError> {
        self.kv
            .set(&session.user_key(QUESTIONNAIRE_COMPLETED), "true")
            .await
    }

    /// Partial dashboard update: only the fields present in `update` are
    /// written, each as an independent single-key write, so an update never
    /// clobbers a field it does not mention. The whole update is serialized
    /// under the store's write lock.
    pub async fn save_dashboard(
        &self,
        session: &Session,
        update: &DashboardUpdate,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(completed) = &update.all_blocks_completed {
            self.kv
                .set(&session.user_key(DASHBOARD_ALL_BLOCKS_COMPLETED), completed)
                .await?;
        }
        if let Some(previous) = &update.previous_result {
            self.kv
                .set(&session.user_key(DASHBOARD_PREVIOUS_RESULT), previous)
                .await?;
        }
        if let Some(current) = &update.current_result {
            self.kv
                .set(&session.user_key(DASHBOARD_CURRENT_RESULT), current)
                .await?;
        }
        Ok(())
    }

    pub async fn load_dashboard(&self, session: &Session) -> DashboardRollup {
        DashboardRollup {
            all_blocks_completed: self
                .read_scoped_logged(session, DASHBOARD_ALL_BLOCKS_COMPLETED)
                .await
                .as_deref()
                == Some("true"),
            previous_result: self
                .read_scoped_logged(session, DASHBOARD_PREVIOUS_RESULT)
                .await,
            current_result: self
                .read_scoped_logged(session, DASHBOARD_CURRENT_RESULT)
                .await,
        }
    }

    async fn read_scoped_logged(&self, session: &Session, base: &str) -> Option<String> {
        match self.read_scoped(session, base).await {
            Ok(value) => value,
            Err(err) => {
                warn!(base, error = %err, "read failed, treating as absent");
                None
            }
        }
    }

    /// One-shot copy of every present legacy global aggregate into the
    /// user-scoped namespace. Absent legacy keys are skipped.
    ///
    /// NOT self-gating: the caller must ensure this runs at most once per
    /// user (it is invoked only from first registration). Re-running it
    /// after scoped data has advanced overwrites the newer scoped values
    /// with the stale legacy snapshot.
    pub async fn migrate_user_data(&self, session: &Session) -> Result<(), StoreError> {
        if session.user_id().is_none() {
            return Ok(());
        }
        for base in [
            BLOCKS,
            TASKS,
            QUESTIONNAIRE,
            QUESTIONNAIRE_COMPLETED,
            DASHBOARD_ALL_BLOCKS_COMPLETED,
            DASHBOARD_PREVIOUS_RESULT,
            DASHBOARD_CURRENT_RESULT,
        ] {
            if let Some(value) = self.kv.get(base).await? {
                self.kv.set(&session.user_key(base), &value).await?;
            }
        }
        Ok(())
    }

    /// Batched removal of the user-scoped aggregate keys. Legacy global keys
    /// and venue-scoped diagnosis keys are left untouched (the latter are
    /// cleared by migrations instead).
    pub async fn clear_user_data(&self, session: &Session) -> Result<(), StoreError> {
        if session.user_id().is_none() {
            warn!("clear_user_data called without a user id, refusing to touch global keys");
            return Ok(());
        }
        let keys: Vec<String> = [
            BLOCKS,
            TASKS,
            QUESTIONNAIRE,
            QUESTIONNAIRE_COMPLETED,
            DASHBOARD_ALL_BLOCKS_COMPLETED,
            DASHBOARD_PREVIOUS_RESULT,
            DASHBOARD_CURRENT_RESULT,
        ]
        .iter()
        .map(|base| session.user_key(base))
        .collect();
        self.kv.multi_remove(&keys).await
    }

    /// Per-venue answer snapshot for one block.
    pub async fn save_answers(
        &self,
        session: &Session,
        block_id: &str,
        answers: &HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        let base = format!("{DIAGNOSIS_ANSWERS_PREFIX}_{block_id}");
        self.save_json(&session.venue_key(&base), answers).await
    }

    pub async fn load_answers(
        &self,
        session: &Session,
        block_id: &str,
    ) -> Option<HashMap<String, Value>> {
        let base = format!("{DIAGNOSIS_ANSWERS_PREFIX}_{block_id}");
        self.load_venue_json(session, &base).await
    }

    pub async fn save_selected_blocks(
        &self,
        session: &Session,
        block_ids: &[String],
    ) -> Result<(), StoreError> {
        self.save_json(&session.venue_key(DIAGNOSIS_SELECTED_BLOCKS), &block_ids)
            .await
    }

    pub async fn load_selected_blocks(&self, session: &Session) -> Vec<String> {
        self.load_venue_json(session, DIAGNOSIS_SELECTED_BLOCKS)
            .await
            .unwrap_or_default()
    }

    pub async fn save_note(
        &self,
        session: &Session,
        note: &DiagnosisNote,
    ) -> Result<(), StoreError> {
        self.save_json(&session.venue_key(DIAGNOSIS_NOTES), note)
            .await
    }

    pub async fn load_note(&self, session: &Session) -> Option<DiagnosisNote> {
        self.load_venue_json(session, DIAGNOSIS_NOTES).await
    }

    /// Diagnosis progress is one user-scoped key holding a map keyed by
    /// venue id, so the update is a read-modify-write under the write lock.
    pub async fn set_progress(
        &self,
        session: &Session,
        venue_id: &str,
        percent: u32,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = session.user_key(DIAGNOSIS_PROGRESS);
        let mut map: HashMap<String, u32> = match self.kv.get(&key).await? {
            Some(raw) => Self::parse_or_log(&key, &raw).unwrap_or_default(),
            None => HashMap::new(),
        };
        map.insert(venue_id.to_string(), percent);
        self.save_json(&key, &map).await
    }

    pub async fn load_progress(&self, session: &Session) -> HashMap<String, u32> {
        self.load_json(session, DIAGNOSIS_PROGRESS)
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use serde_json::json;

    fn store() -> (Arc<MemoryKvStore>, UserDataStore) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = UserDataStore::new(kv.clone() as Arc<dyn KvStore>);
        (kv, store)
    }

    fn sample_blocks() -> Vec<DiagnosisBlockState> {
        vec![DiagnosisBlockState::completed_with(
            "finance",
            80,
            HashMap::from([("q1".to_string(), json!("yes"))]),
        )
        .expect("valid block")]
    }

    #[tokio::test]
    async fn blocks_roundtrip_for_a_user() {
        let (_kv, store) = store();
        let session = Session::for_user("u1");
        let blocks = sample_blocks();

        store
            .save_blocks(&session, &blocks)
            .await
            .expect("save blocks");
        let loaded = store.load_blocks(&session).await.expect("blocks present");
        assert_eq!(loaded, blocks);
    }

    #[tokio::test]
    async fn scoped_blocks_win_over_global() {
        let (kv, store) = store();
        kv.set(
            "diagnosisBlocks",
            r#"[{"id":"legacy","completed":false,"answers":{}}]"#,
        )
        .await
        .expect("seed global");
        kv.set(
            "user_u1_diagnosisBlocks",
            r#"[{"id":"scoped","completed":true,"answers":{}}]"#,
        )
        .await
        .expect("seed scoped");

        let loaded = store
            .load_blocks(&Session::for_user("u1"))
            .await
            .expect("blocks present");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "scoped");
    }

    #[tokio::test]
    async fn anonymous_load_falls_back_to_legacy_global_key() {
        let (kv, store) = store();
        kv.set(
            "diagnosisBlocks",
            r#"[{"id":"finance","completed":true,"efficiency":80,"answers":{}}]"#,
        )
        .await
        .expect("seed global");

        let loaded = store
            .load_blocks(&Session::anonymous())
            .await
            .expect("blocks present");
        assert_eq!(loaded[0].id, "finance");
        assert!(loaded[0].completed);
        assert_eq!(loaded[0].efficiency, Some(80));
    }

    #[tokio::test]
    async fn unparseable_blocks_read_as_absent() {
        let (kv, store) = store();
        kv.set("user_u1_diagnosisBlocks", "not json")
            .await
            .expect("seed garbage");
        assert!(store.load_blocks(&Session::for_user("u1")).await.is_none());
    }

    #[tokio::test]
    async fn unparseable_tasks_read_as_empty() {
        let (kv, store) = store();
        kv.set("user_u1_actionPlanTasks", "{broken")
            .await
            .expect("seed garbage");
        assert!(store.load_tasks(&Session::for_user("u1")).await.is_empty());
    }

    #[tokio::test]
    async fn questionnaire_flag_is_independent_of_data() {
        let (_kv, store) = store();
        let session = Session::for_user("u1");

        store
            .save_questionnaire(&session, &QuestionnaireData::default())
            .await
            .expect("save questionnaire");
        assert!(!store.is_questionnaire_completed(&session).await);

        store
            .set_questionnaire_completed(&session)
            .await
            .expect("set flag");
        assert!(store.is_questionnaire_completed(&session).await);
    }

    #[tokio::test]
    async fn dashboard_partial_update_leaves_other_fields_alone() {
        let (_kv, store) = store();
        let session = Session::for_user("u1");

        store
            .save_dashboard(
                &session,
                &DashboardUpdate {
                    previous_result: Some("40".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("write previous");
        store
            .save_dashboard(
                &session,
                &DashboardUpdate {
                    current_result: Some("50".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("write current");

        let rollup = store.load_dashboard(&session).await;
        assert_eq!(rollup.previous_result.as_deref(), Some("40"));
        assert_eq!(rollup.current_result.as_deref(), Some("50"));
    }

    #[tokio::test]
    async fn two_full_passes_shift_the_previous_result() {
        let (_kv, store) = store();
        let session = Session::for_user("u1");

        let first = store.load_dashboard(&session).await.advance("70");
        store
            .save_dashboard(&session, &first)
            .await
            .expect("first pass");
        let rollup = store.load_dashboard(&session).await;
        assert!(rollup.all_blocks_completed);
        assert_eq!(rollup.previous_result, None);
        assert_eq!(rollup.current_result.as_deref(), Some("70"));

        let second = rollup.advance("85");
        store
            .save_dashboard(&session, &second)
            .await
            .expect("second pass");
        let rollup = store.load_dashboard(&session).await;
        assert_eq!(rollup.previous_result.as_deref(), Some("70"));
        assert_eq!(rollup.current_result.as_deref(), Some("85"));
    }

    #[tokio::test]
    async fn migrate_user_data_copies_present_legacy_keys_only() {
        let (kv, store) = store();
        kv.set("diagnosisBlocks", "[]").await.expect("seed blocks");
        kv.set("dashboardCurrentResult", "70")
            .await
            .expect("seed current");

        let session = Session::for_user("u1");
        store
            .migrate_user_data(&session)
            .await
            .expect("migrate");

        assert_eq!(
            kv.get("user_u1_diagnosisBlocks")
                .await
                .expect("get")
                .as_deref(),
            Some("[]")
        );
        assert_eq!(
            kv.get("user_u1_dashboardCurrentResult")
                .await
                .expect("get")
                .as_deref(),
            Some("70")
        );
        // Absent legacy keys are skipped, not written as empty.
        assert_eq!(kv.get("user_u1_actionPlanTasks").await.expect("get"), None);
    }

    #[tokio::test]
    async fn clear_user_data_spares_legacy_and_venue_keys() {
        let (kv, store) = store();
        let session = Session::for_user("u1");

        kv.set("actionPlanTasks", r#"[{"id":"t0","blockId":"b","title":"legacy"}]"#)
            .await
            .expect("seed legacy");
        kv.set("user_u1_diagnosis_answers_finance_v1", "{}")
            .await
            .expect("seed venue key");
        store
            .save_tasks(
                &session,
                &[TaskRecord {
                    id: "t1".to_string(),
                    block_id: "finance".to_string(),
                    answer_id: None,
                    title: "scoped".to_string(),
                    done: false,
                    extra: HashMap::new(),
                }],
            )
            .await
            .expect("save tasks");

        store.clear_user_data(&session).await.expect("clear");

        assert!(store.load_tasks(&Session::for_user("u1")).await.len() == 1);
        // ...because the legacy key is still readable through the fallback.
        let legacy = store.load_tasks(&Session::anonymous()).await;
        assert_eq!(legacy[0].title, "legacy");
        assert!(kv
            .get("user_u1_diagnosis_answers_finance_v1")
            .await
            .expect("get")
            .is_some());
        assert!(kv.get("user_u1_actionPlanTasks").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn venue_scoped_answers_are_partitioned_by_venue() {
        let (_kv, store) = store();
        let at_v1 = Session::for_user("u1").with_venue("v1");
        let at_v2 = Session::for_user("u1").with_venue("v2");

        let answers = HashMap::from([("q1".to_string(), json!(3))]);
        store
            .save_answers(&at_v1, "finance", &answers)
            .await
            .expect("save answers");

        assert_eq!(store.load_answers(&at_v1, "finance").await, Some(answers));
        assert_eq!(store.load_answers(&at_v2, "finance").await, None);
    }

    #[tokio::test]
    async fn saved_answers_read_back_under_the_same_session() {
        let (_kv, store) = store();
        let session = Session::for_user("u1").with_venue("v1");

        let answers = HashMap::from([("q1".to_string(), json!("yes"))]);
        store
            .save_answers(&session, "finance", &answers)
            .await
            .expect("save answers");

        assert_eq!(
            store.load_answers(&session, "finance").await,
            Some(answers)
        );
    }

    #[tokio::test]
    async fn note_and_selected_blocks_roundtrip_for_a_venue() {
        let (_kv, store) = store();
        let session = Session::for_user("u1").with_venue("v1");

        let note = DiagnosisNote::new("check walk-in fridge seals");
        store.save_note(&session, &note).await.expect("save note");
        assert_eq!(store.load_note(&session).await, Some(note));

        let blocks = vec!["finance".to_string(), "staff".to_string()];
        store
            .save_selected_blocks(&session, &blocks)
            .await
            .expect("save selection");
        assert_eq!(store.load_selected_blocks(&session).await, blocks);
    }

    #[tokio::test]
    async fn venue_reads_fall_back_to_the_venue_suffixed_global_key() {
        let (kv, store) = store();
        // Written before registration: venue suffix, no user scope.
        kv.set("diagnosis_answers_finance_v1", r#"{"q1":"legacy"}"#)
            .await
            .expect("seed global venue key");

        let session = Session::for_user("u1").with_venue("v1");
        let answers = store
            .load_answers(&session, "finance")
            .await
            .expect("fallback hit");
        assert_eq!(answers.get("q1"), Some(&json!("legacy")));
    }

    #[tokio::test]
    async fn progress_map_accumulates_per_venue() {
        let (_kv, store) = store();
        let session = Session::for_user("u1");

        store
            .set_progress(&session, "v1", 40)
            .await
            .expect("set v1");
        store
            .set_progress(&session, "v2", 10)
            .await
            .expect("set v2");
        store
            .set_progress(&session, "v1", 60)
            .await
            .expect("update v1");

        let progress = store.load_progress(&session).await;
        assert_eq!(progress.get("v1"), Some(&60));
        assert_eq!(progress.get("v2"), Some(&10));
    }
}
