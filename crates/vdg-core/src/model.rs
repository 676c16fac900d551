use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("efficiency {0} out of range (expected 0-100)")]
    EfficiencyOutOfRange(u32),
}

/// Per-block diagnostic state: completion flag, efficiency score and the raw
/// answer map. Written as a whole snapshot when a block's question set is
/// completed, never partially.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisBlockState {
    pub id: String,
    #[serde(default)]
    pub completed: bool,
    /// 0-100, absent until the block has been scored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<u32>,
    #[serde(default)]
    pub answers: HashMap<String, Value>,
}

impl DiagnosisBlockState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            completed: false,
            efficiency: None,
            answers: HashMap::new(),
        }
    }

    pub fn completed_with(
        id: impl Into<String>,
        efficiency: u32,
        answers: HashMap<String, Value>,
    ) -> Result<Self, ModelError> {
        if efficiency > 100 {
            return Err(ModelError::EfficiencyOutOfRange(efficiency));
        }
        Ok(Self {
            id: id.into(),
            completed: true,
            efficiency: Some(efficiency),
            answers,
        })
    }
}

/// Mean efficiency across the blocks that have been scored, rounded half up.
/// `None` when no block carries a score yet, so callers can tell "nothing
/// scored" apart from a genuine zero.
pub fn average_efficiency(blocks: &[DiagnosisBlockState]) -> Option<u32> {
    let scored: Vec<u32> = blocks.iter().filter_map(|block| block.efficiency).collect();
    if scored.is_empty() {
        return None;
    }
    let len = scored.len() as u32;
    Some((scored.iter().sum::<u32>() + len / 2) / len)
}

/// Generated action item tied to a block and an answer. Produced by the
/// recommendation layer and persisted verbatim; unknown fields survive a
/// round-trip through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub block_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Venue {
    pub id: String,
    pub name: String,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl Venue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            extra: HashMap::new(),
        }
    }
}

/// Registration questionnaire: the user's venues plus whatever else the
/// questionnaire screens collected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireData {
    #[serde(default)]
    pub venues: Vec<Venue>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl QuestionnaireData {
    /// Venue ids whose names case-insensitively contain one of `needles`.
    pub fn venue_ids_matching(&self, needles: &[&str]) -> Vec<String> {
        self.venues
            .iter()
            .filter(|venue| {
                let name = venue.name.to_lowercase();
                needles.iter().any(|needle| name.contains(&needle.to_lowercase()))
            })
            .map(|venue| venue.id.clone())
            .collect()
    }
}

/// Free-text note attached to a venue's diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisNote {
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

impl DiagnosisNote {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Partial dashboard write: only the fields present are persisted, each under
/// its own key, so an update never clobbers a field it does not mention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardUpdate {
    pub all_blocks_completed: Option<String>,
    pub previous_result: Option<String>,
    pub current_result: Option<String>,
}

impl DashboardUpdate {
    pub fn is_empty(&self) -> bool {
        self.all_blocks_completed.is_none()
            && self.previous_result.is_none()
            && self.current_result.is_none()
    }
}

/// Dashboard rollup as read back from the three dashboard keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardRollup {
    pub all_blocks_completed: bool,
    pub previous_result: Option<String>,
    pub current_result: Option<String>,
}

impl DashboardRollup {
    /// Update for a newly completed full pass over all blocks.
    ///
    /// The first completion populates `currentResult` only; every later pass
    /// shifts the old current result into `previousResult`.
    pub fn advance(&self, new_result: impl Into<String>) -> DashboardUpdate {
        DashboardUpdate {
            all_blocks_completed: Some("true".to_string()),
            previous_result: self.current_result.clone(),
            current_result: Some(new_result.into()),
        }
    }
}
