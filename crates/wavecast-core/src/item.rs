use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the four ordered pipeline phases a job executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discovery,
    Acquisition,
    Transformation,
    Publication,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Discovery,
        Stage::Acquisition,
        Stage::Transformation,
        Stage::Publication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Acquisition => "acquisition",
            Stage::Transformation => "transformation",
            Stage::Publication => "publication",
        }
    }

    /// The stage chained after a successful run of this one.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Discovery => Some(Stage::Acquisition),
            Stage::Acquisition => Some(Stage::Transformation),
            Stage::Transformation => Some(Stage::Publication),
            Stage::Publication => None,
        }
    }

    /// Item stage reached when a job of this stage succeeds.
    pub fn completes_to(&self) -> ItemStage {
        match self {
            Stage::Discovery => ItemStage::Discovered,
            Stage::Acquisition => ItemStage::Acquired,
            Stage::Transformation => ItemStage::Transformed,
            Stage::Publication => ItemStage::Published,
        }
    }

    pub fn requires_channel(&self) -> bool {
        matches!(self, Stage::Publication)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discovery" => Ok(Stage::Discovery),
            "acquisition" => Ok(Stage::Acquisition),
            "transformation" => Ok(Stage::Transformation),
            "publication" => Ok(Stage::Publication),
            _ => Err(format!("Unknown stage: {s}")),
        }
    }
}

/// Where a content item currently sits in the pipeline.
///
/// Ordered: every transition moves forward, except `Failed`, which is
/// reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStage {
    Discovered,
    Acquired,
    Transformed,
    Publishing,
    Published,
    Failed,
}

impl ItemStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStage::Discovered => "discovered",
            ItemStage::Acquired => "acquired",
            ItemStage::Transformed => "transformed",
            ItemStage::Publishing => "publishing",
            ItemStage::Published => "published",
            ItemStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStage::Published | ItemStage::Failed)
    }

    /// Whether moving from `self` to `next` respects stage monotonicity.
    pub fn can_advance_to(&self, next: ItemStage) -> bool {
        match (self, next) {
            (ItemStage::Failed, _) => false,
            (_, ItemStage::Failed) => !self.is_terminal(),
            (current, next) => next > *current,
        }
    }

    /// True once the item has finished Transformation and may be published.
    pub fn ready_for_publication(&self) -> bool {
        matches!(
            self,
            ItemStage::Transformed | ItemStage::Publishing | ItemStage::Published
        )
    }

    /// Column holding the timestamp for entering this stage.
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            ItemStage::Discovered => "discovered_at",
            ItemStage::Acquired => "acquired_at",
            ItemStage::Transformed => "transformed_at",
            ItemStage::Publishing => "publishing_at",
            ItemStage::Published => "published_at",
            ItemStage::Failed => "failed_at",
        }
    }
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discovered" => Ok(ItemStage::Discovered),
            "acquired" => Ok(ItemStage::Acquired),
            "transformed" => Ok(ItemStage::Transformed),
            "publishing" => Ok(ItemStage::Publishing),
            "published" => Ok(ItemStage::Published),
            "failed" => Ok(ItemStage::Failed),
            _ => Err(format!("Unknown item stage: {s}")),
        }
    }
}

/// Per-stage entry timestamps of an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimestamps {
    pub discovered_at: Option<DateTime<Utc>>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub transformed_at: Option<DateTime<Utc>>,
    pub publishing_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl StageTimestamps {
    pub fn set(&mut self, stage: ItemStage, at: DateTime<Utc>) {
        let slot = match stage {
            ItemStage::Discovered => &mut self.discovered_at,
            ItemStage::Acquired => &mut self.acquired_at,
            ItemStage::Transformed => &mut self.transformed_at,
            ItemStage::Publishing => &mut self.publishing_at,
            ItemStage::Published => &mut self.published_at,
            ItemStage::Failed => &mut self.failed_at,
        };
        *slot = Some(at);
    }
}

/// One piece of content moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    /// Opaque reference to where the content was discovered (e.g. a video URL).
    pub source_ref: String,
    pub stage: ItemStage,
    /// Artifact handle per completed stage.
    pub artifacts: BTreeMap<Stage, String>,
    pub channel_ids: Vec<Uuid>,
    pub failure_reason: Option<String>,
    pub timestamps: StageTimestamps,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentItem {
    /// Stage to restore when an operator re-enqueues a failed item.
    ///
    /// Derived from the artifacts the item holds: it resumes right after the
    /// last stage that produced one.
    pub fn last_successful_stage(&self) -> ItemStage {
        if self.artifacts.contains_key(&Stage::Publication) {
            ItemStage::Publishing
        } else if self.artifacts.contains_key(&Stage::Transformation) {
            ItemStage::Transformed
        } else if self.artifacts.contains_key(&Stage::Acquisition) {
            ItemStage::Acquired
        } else {
            ItemStage::Discovered
        }
    }

    pub fn is_assigned_to(&self, channel_id: Uuid) -> bool {
        self.channel_ids.contains(&channel_id)
    }
}

/// Request to register a newly discovered item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub source_ref: String,
    pub channel_ids: Vec<Uuid>,
}

impl NewItem {
    pub fn new(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            channel_ids: Vec::new(),
        }
    }

    pub fn with_channels(mut self, channel_ids: impl IntoIterator<Item = Uuid>) -> Self {
        for id in channel_ids {
            if !self.channel_ids.contains(&id) {
                self.channel_ids.push(id);
            }
        }
        self
    }
}
