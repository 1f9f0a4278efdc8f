//! Feed clients, the issue taxonomy, and raw-record-to-task normalization.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cqi_core::{Archetype, GeoPoint, SourceRef, Task, TaskStatus, Urgency};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cqi-feeds";

/// One external record as the feed returns it. Never mutated; lives only for
/// the duration of a single pipeline run. Field names follow the Socrata
/// 311 export schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFeedRecord {
    pub unique_key: String,
    pub complaint_type: String,
    #[serde(default)]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub incident_address: Option<String>,
    #[serde(default)]
    pub borough: Option<String>,
    #[serde(default)]
    pub latitude: Option<String>,
    #[serde(default)]
    pub longitude: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedConfig>,
}

impl FeedRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|f| f.enabled)
    }
}

fn default_lookback_hours() -> i64 {
    24
}

fn default_page_limit() -> u32 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub feed_name: String,
    pub source_label: String,
    pub endpoint: String,
    pub enabled: bool,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Seam over the outbound feed call so pipeline tests can substitute a
/// canned record set.
#[async_trait]
pub trait FeedFetch: Send + Sync {
    async fn fetch_window(
        &self,
        run_id: Uuid,
        feed: &FeedConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawFeedRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// HTTP client for Socrata-style open-data endpoints. Exactly one outbound
/// GET per `fetch_window` invocation; no retry here, re-attempts belong to
/// the scheduler.
#[derive(Debug)]
pub struct FeedClient {
    client: reqwest::Client,
}

impl FeedClient {
    pub fn new(config: FeedClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

/// Socrata `$where` clause selecting open, geolocated records created after
/// the cutoff, matching the window the pipeline is willing to re-process.
pub fn window_filter(cutoff: DateTime<Utc>) -> String {
    format!(
        "status = 'Open' AND latitude IS NOT NULL AND longitude IS NOT NULL AND created_date > '{}'",
        cutoff.format("%Y-%m-%dT%H:%M:%S")
    )
}

#[async_trait]
impl FeedFetch for FeedClient {
    async fn fetch_window(
        &self,
        run_id: Uuid,
        feed: &FeedConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawFeedRecord>, FetchError> {
        let cutoff = now - chrono::Duration::hours(feed.lookback_hours);
        let span = info_span!("feed_fetch", %run_id, feed = %feed.feed_name, url = %feed.endpoint);
        let _guard = span.enter();

        let resp = self
            .client
            .get(&feed.endpoint)
            .query(&[
                ("$limit", feed.page_limit.to_string()),
                ("$where", window_filter(cutoff)),
                ("$order", "created_date DESC".to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json().await?)
    }
}

/// Static mapping from an external issue category to a task template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueMapping {
    pub archetype: Archetype,
    pub title: String,
    pub reward: u32,
}

/// Immutable category table. Lookup is exact-string and case-sensitive,
/// matching the external taxonomy verbatim; absence is a counted skip for
/// the caller, not an error.
#[derive(Debug, Clone)]
pub struct IssueTaxonomy {
    entries: HashMap<String, IssueMapping>,
}

impl IssueTaxonomy {
    pub fn from_entries(entries: impl IntoIterator<Item = (String, IssueMapping)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn builtin() -> Self {
        let entry = |category: &str, archetype, title: &str, reward| {
            (
                category.to_string(),
                IssueMapping {
                    archetype,
                    title: title.to_string(),
                    reward,
                },
            )
        };
        Self::from_entries([
            entry("Pothole", Archetype::FixBounty, "Fix a Pothole", 50),
            entry("Sidewalk Damage", Archetype::FixBounty, "Sidewalk Repair Watch", 45),
            entry("Graffiti", Archetype::CleanupSweep, "Graffiti Cleanup Sweep", 40),
            entry("Illegal Dumping", Archetype::CleanupSweep, "Illegal Dumping Sweep", 60),
            entry("Street Light Out", Archetype::SafetyPatrol, "Dark Street Night Patrol", 35),
            entry("Abandoned Vehicle", Archetype::SafetyPatrol, "Abandoned Vehicle Patrol", 30),
        ])
    }

    pub fn lookup(&self, raw_category: &str) -> Option<&IssueMapping> {
        self.entries.get(raw_category)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_coord(value: Option<&str>) -> Option<f64> {
    value.and_then(|v| v.trim().parse::<f64>().ok())
}

fn synthesize_location(raw: &RawFeedRecord) -> String {
    match (raw.incident_address.as_deref(), raw.borough.as_deref()) {
        (Some(addr), Some(borough)) => format!("{addr}, {borough}"),
        (Some(addr), None) => addr.to_string(),
        (None, Some(borough)) => borough.to_string(),
        (None, None) => String::new(),
    }
}

fn synthesize_description(raw: &RawFeedRecord, feed: &FeedConfig) -> String {
    let issue = raw
        .descriptor
        .as_deref()
        .unwrap_or(raw.complaint_type.as_str());
    let location = synthesize_location(raw);
    if location.is_empty() {
        format!("{issue} (reported via {})", feed.source_label)
    } else {
        format!("{issue} near {location} (reported via {})", feed.source_label)
    }
}

/// Normalize one mapped raw record into the task the pipeline will stage.
///
/// Missing or unparseable coordinates degrade to `(0, 0)` rather than
/// failing the record. `created_at` is left unset; the store stamps it at
/// commit time.
pub fn build_task(id: String, feed: &FeedConfig, raw: &RawFeedRecord, mapping: &IssueMapping) -> Task {
    let coords = match (
        parse_coord(raw.latitude.as_deref()),
        parse_coord(raw.longitude.as_deref()),
    ) {
        (Some(lat), Some(lng)) => GeoPoint { lat, lng },
        _ => GeoPoint::default(),
    };

    Task {
        id,
        archetype: mapping.archetype,
        title: mapping.title.clone(),
        description: synthesize_description(raw, feed),
        location: synthesize_location(raw),
        coords,
        reward: mapping.reward,
        status: TaskStatus::Open,
        urgency: Urgency::default(),
        source: SourceRef {
            feed: feed.feed_name.clone(),
            external_key: raw.unique_key.clone(),
            label: feed.source_label.clone(),
        },
        detail: mapping.archetype.default_detail(),
        created_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nyc_feed() -> FeedConfig {
        FeedConfig {
            feed_name: "NYC".to_string(),
            source_label: "NYC 311".to_string(),
            endpoint: "https://data.cityofnewyork.us/resource/erm2-nwe9.json".to_string(),
            enabled: true,
            lookback_hours: 24,
            page_limit: 50,
        }
    }

    fn raw(key: &str, category: &str) -> RawFeedRecord {
        RawFeedRecord {
            unique_key: key.to_string(),
            complaint_type: category.to_string(),
            descriptor: Some("Large pothole".to_string()),
            incident_address: Some("123 5th Ave".to_string()),
            borough: Some("BROOKLYN".to_string()),
            latitude: Some("40.6782".to_string()),
            longitude: Some("-73.9442".to_string()),
        }
    }

    #[test]
    fn window_filter_embeds_cutoff_and_open_status() {
        let cutoff = Utc.with_ymd_and_hms(2026, 8, 22, 6, 0, 0).single().unwrap();
        let clause = window_filter(cutoff);
        assert_eq!(
            clause,
            "status = 'Open' AND latitude IS NOT NULL AND longitude IS NOT NULL AND created_date > '2026-08-22T06:00:00'"
        );
    }

    #[test]
    fn taxonomy_lookup_is_exact_and_case_sensitive() {
        let taxonomy = IssueTaxonomy::builtin();
        let mapping = taxonomy.lookup("Pothole").expect("mapped");
        assert_eq!(mapping.archetype, Archetype::FixBounty);
        assert_eq!(mapping.reward, 50);

        assert!(taxonomy.lookup("pothole").is_none());
        assert!(taxonomy.lookup("UnknownThing").is_none());
    }

    #[test]
    fn custom_taxonomy_substitutes_without_touching_pipeline_types() {
        let taxonomy = IssueTaxonomy::from_entries([(
            "Broken Swing".to_string(),
            IssueMapping {
                archetype: Archetype::FixBounty,
                title: "Playground Repair".to_string(),
                reward: 25,
            },
        )]);
        assert_eq!(taxonomy.len(), 1);
        assert!(taxonomy.lookup("Broken Swing").is_some());
        assert!(taxonomy.lookup("Pothole").is_none());
    }

    #[test]
    fn build_task_fills_coords_description_and_provenance() {
        let feed = nyc_feed();
        let record = raw("A1", "Pothole");
        let mapping = IssueTaxonomy::builtin().lookup("Pothole").cloned().unwrap();

        let task = build_task("NYC-A1".to_string(), &feed, &record, &mapping);
        assert_eq!(task.id, "NYC-A1");
        assert_eq!(task.title, "Fix a Pothole");
        assert_eq!(task.reward, 50);
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.urgency, Urgency::Normal);
        assert!((task.coords.lat - 40.6782).abs() < 1e-9);
        assert!((task.coords.lng - -73.9442).abs() < 1e-9);
        assert_eq!(task.location, "123 5th Ave, BROOKLYN");
        assert_eq!(
            task.description,
            "Large pothole near 123 5th Ave, BROOKLYN (reported via NYC 311)"
        );
        assert_eq!(task.source.feed, "NYC");
        assert_eq!(task.source.external_key, "A1");
        assert_eq!(task.source.label, "NYC 311");
        assert!(task.created_at.is_none(), "store stamps created_at");
    }

    #[test]
    fn build_task_degrades_missing_coordinates_to_origin() {
        let feed = nyc_feed();
        let mut record = raw("A3", "Graffiti");
        record.latitude = None;
        record.longitude = None;
        let mapping = IssueTaxonomy::builtin().lookup("Graffiti").cloned().unwrap();

        let task = build_task("NYC-A3".to_string(), &feed, &record, &mapping);
        assert_eq!(task.coords, GeoPoint { lat: 0.0, lng: 0.0 });
    }

    #[test]
    fn build_task_handles_absent_location_fields() {
        let feed = nyc_feed();
        let record = RawFeedRecord {
            unique_key: "A4".to_string(),
            complaint_type: "Pothole".to_string(),
            descriptor: None,
            incident_address: None,
            borough: None,
            latitude: None,
            longitude: None,
        };
        let mapping = IssueTaxonomy::builtin().lookup("Pothole").cloned().unwrap();

        let task = build_task("NYC-A4".to_string(), &feed, &record, &mapping);
        assert_eq!(task.location, "");
        assert_eq!(task.description, "Pothole (reported via NYC 311)");
    }

    #[test]
    fn raw_record_parses_socrata_payload_with_missing_fields() {
        let payload = r#"[
            {
                "unique_key": "63412099",
                "created_date": "2026-08-22T10:15:00.000",
                "complaint_type": "Pothole",
                "descriptor": "Deep pothole",
                "incident_address": "9 MAIN ST",
                "borough": "QUEENS",
                "latitude": "40.7282",
                "longitude": "-73.7949"
            },
            {
                "unique_key": "63412100",
                "complaint_type": "Graffiti"
            }
        ]"#;
        let records: Vec<RawFeedRecord> = serde_json::from_str(payload).expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].unique_key, "63412099");
        assert_eq!(records[1].descriptor, None);
        assert_eq!(records[1].latitude, None);
    }
}
