//! Core domain model for CQI tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cqi-core";

/// Internal task template a raw civic issue is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Archetype {
    FixBounty,
    CleanupSweep,
    SafetyPatrol,
}

impl Archetype {
    /// Default archetype-specific sub-record attached to a freshly created task.
    pub fn default_detail(&self) -> TaskDetail {
        match self {
            Archetype::FixBounty => TaskDetail::Severity { level: 1 },
            Archetype::CleanupSweep => TaskDetail::Activity { target_count: 1 },
            Archetype::SafetyPatrol => TaskDetail::Patrol { checkpoints: 1 },
        }
    }
}

/// Archetype-specific auxiliary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskDetail {
    Severity { level: u8 },
    Activity { target_count: u32 },
    Patrol { checkpoints: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Claimed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Normal,
    High,
}

/// Numeric coordinates. `(0, 0)` is the documented degradation when the
/// source omits latitude/longitude.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Provenance block pointing back at the originating feed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub feed: String,
    pub external_key: String,
    pub label: String,
}

/// Durable task record created by the ingestion pipeline.
///
/// The id is a pure function of (feed name, external key), so re-ingesting an
/// overlapping feed window can never create a second record for the same
/// external key. Tasks are created exactly once and never updated or deleted
/// by the pipeline; `created_at` is stamped by the document store at commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub archetype: Archetype,
    pub title: String,
    pub description: String,
    pub location: String,
    pub coords: GeoPoint,
    pub reward: u32,
    pub status: TaskStatus,
    pub urgency: Urgency,
    pub source: SourceRef,
    pub detail: TaskDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}
