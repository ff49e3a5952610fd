use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First `<recommendation>…</recommendation>` block, non-greedy, across newlines.
static RECOMMENDATION_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<recommendation>(.*?)</recommendation>").unwrap());

/// One reviewed condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRecord {
    pub dx_code: String,
    pub description: String,
    pub memo: ConditionMemo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionMemo {
    pub date: String,
    pub note: String,
}

/// Active and inactive conditions recommended by a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub active: Vec<ConditionRecord>,
    pub inactive: Vec<ConditionRecord>,
}

impl Recommendation {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.inactive.is_empty()
    }

    /// Descriptions of active then inactive conditions, duplicates kept.
    pub fn flatten(&self) -> Vec<String> {
        self.active
            .iter()
            .chain(self.inactive.iter())
            .map(|r| r.description.clone())
            .collect()
    }

    /// Render in the wire shape the model is asked to produce.
    pub fn to_block_json(&self) -> serde_json::Value {
        serde_json::to_value(WireRecommendation::from(self)).unwrap_or(serde_json::Value::Null)
    }
}

/// Why a recommendation block could not be read. Never fatal to a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseIssue {
    #[error("No <recommendation> block found")]
    Miss,

    #[error("Malformed recommendation block: {0}")]
    Malformed(String),
}

/// A successfully located and decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecommendation {
    pub recommendation: Recommendation,
    /// Trimmed text between the markers.
    pub block: String,
    /// Records dropped for being incomplete.
    pub skipped_records: usize,
}

/// Locate and decode the first recommendation block in `raw`.
pub fn parse_recommendation(raw: &str) -> Result<ParsedRecommendation, ParseIssue> {
    let block = extract_block(raw).ok_or(ParseIssue::Miss)?;

    let wire: WireBlock =
        serde_json::from_str(block).map_err(|e| ParseIssue::Malformed(e.to_string()))?;

    let total = wire.active.len() + wire.inactive.len();
    let recommendation = Recommendation {
        active: parse_records_lenient(&wire.active),
        inactive: parse_records_lenient(&wire.inactive),
    };
    let kept = recommendation.active.len() + recommendation.inactive.len();

    Ok(ParsedRecommendation {
        recommendation,
        block: block.to_string(),
        skipped_records: total - kept,
    })
}

/// Text between the first pair of markers, trimmed.
pub fn extract_block(raw: &str) -> Option<&str> {
    RECOMMENDATION_BLOCK
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

// ── Wire shape ────────────────────────────────────────────

/// Outer object. Either list may be absent; anything that is not an object
/// with array-valued lists fails the whole block.
#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "Active_Condition", default)]
    active: Vec<serde_json::Value>,
    #[serde(rename = "Inactive_Condition", default)]
    inactive: Vec<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    #[serde(rename = "Review")]
    review: WireReview,
}

#[derive(Serialize, Deserialize)]
struct WireReview {
    #[serde(rename = "DX_Code")]
    dx_code: String,
    #[serde(rename = "Description")]
    description: String,
    #[serde(rename = "Memo")]
    memo: WireMemo,
}

#[derive(Serialize, Deserialize)]
struct WireMemo {
    date: String,
    note: String,
}

#[derive(Serialize)]
struct WireRecommendation {
    #[serde(rename = "Active_Condition")]
    active: Vec<WireEntry>,
    #[serde(rename = "Inactive_Condition")]
    inactive: Vec<WireEntry>,
}

impl From<&ConditionRecord> for WireEntry {
    fn from(record: &ConditionRecord) -> Self {
        WireEntry {
            review: WireReview {
                dx_code: record.dx_code.clone(),
                description: record.description.clone(),
                memo: WireMemo {
                    date: record.memo.date.clone(),
                    note: record.memo.note.clone(),
                },
            },
        }
    }
}

impl From<&Recommendation> for WireRecommendation {
    fn from(rec: &Recommendation) -> Self {
        WireRecommendation {
            active: rec.active.iter().map(WireEntry::from).collect(),
            inactive: rec.inactive.iter().map(WireEntry::from).collect(),
        }
    }
}

/// Decode each entry on its own; skip entries that are malformed or have a
/// blank code or description.
fn parse_records_lenient(items: &[serde_json::Value]) -> Vec<ConditionRecord> {
    items
        .iter()
        .filter_map(|v| serde_json::from_value::<WireEntry>(v.clone()).ok())
        .filter(|e| !e.review.dx_code.trim().is_empty() && !e.review.description.trim().is_empty())
        .map(|e| ConditionRecord {
            dx_code: e.review.dx_code.trim().to_string(),
            description: e.review.description.trim().to_string(),
            memo: ConditionMemo {
                date: e.review.memo.date,
                note: e.review.memo.note,
            },
        })
        .collect()
}
