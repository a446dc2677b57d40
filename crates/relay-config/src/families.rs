use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Suffix that marks a model id as a family alias.
pub const FAMILY_SUFFIX: &str = "/family";

/// Root of the `families.yaml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FamiliesDocument {
    pub families: HashMap<String, FamilyEntry>,
    pub settings: FamilySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyEntry {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// The model consulted to score task complexity.
    pub evaluation_model_id: String,
    pub evaluation_provider: String,
    pub routing_config: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Ordered, first match wins.
    pub score_ranges: Vec<ScoreRange>,
    pub fallback_model: String,
    pub fallback_provider: String,
    #[serde(default)]
    pub cache_duration_minutes: Option<u64>,
    #[serde(default = "default_eval_timeout_ms")]
    pub evaluation_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min_score: u8,
    pub max_score: u8,
    pub target_model: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilySettings {
    pub max_families_per_user: usize,
    pub default_cache_duration_minutes: u64,
    pub enable_fallback_routing: bool,
}

impl Default for FamilySettings {
    fn default() -> Self {
        Self {
            max_families_per_user: 10,
            default_cache_duration_minutes: 30,
            enable_fallback_routing: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_eval_timeout_ms() -> u64 {
    2000
}

impl FamiliesDocument {
    /// Load and validate a families document from disk.
    pub fn load(path: &Path) -> relay_core::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let doc: FamiliesDocument = serde_yaml::from_str(&raw).map_err(|e| {
            relay_core::RelayError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        doc.validate().map_err(relay_core::RelayError::Config)?;
        info!(families = doc.families.len(), "loaded family routing document");
        Ok(doc)
    }

    /// Structural validation. Targets must be concrete models; a family
    /// routing to another family would recurse.
    pub fn validate(&self) -> Result<(), String> {
        for (id, family) in &self.families {
            let rc = &family.routing_config;
            if rc.score_ranges.is_empty() {
                return Err(format!("family {id}: empty score_ranges"));
            }
            for range in &rc.score_ranges {
                if range.min_score > range.max_score {
                    return Err(format!(
                        "family {id}: inverted range {}..{}",
                        range.min_score, range.max_score
                    ));
                }
                if range.target_model.ends_with(FAMILY_SUFFIX) {
                    return Err(format!(
                        "family {id}: target {} is itself a family",
                        range.target_model
                    ));
                }
            }
            if rc.fallback_model.ends_with(FAMILY_SUFFIX) {
                return Err(format!("family {id}: fallback is itself a family"));
            }
        }
        Ok(())
    }

    /// Look up a family by its alias (`<id>/family`). Inactive families do
    /// not resolve.
    pub fn by_alias<'a>(&self, alias: &'a str) -> Option<(&'a str, &FamilyEntry)> {
        let id = alias.strip_suffix(FAMILY_SUFFIX)?;
        self.families
            .get(id)
            .filter(|f| f.is_active)
            .map(|f| (id, f))
    }
}

impl RoutingConfig {
    /// First range whose `[min, max]` contains the score.
    pub fn target_for_score(&self, score: u8) -> Option<&ScoreRange> {
        self.score_ranges
            .iter()
            .find(|r| r.min_score <= score && score <= r.max_score)
    }
}
