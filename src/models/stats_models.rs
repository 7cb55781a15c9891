// src/models/stats_models.rs
use serde::Serialize;

use crate::models::core::TemplateId;

/// One duplicate group as reported by the normalization job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroupSummary {
    pub normalized_key: String,
    pub member_ids: Vec<TemplateId>,
    pub member_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedGroupSummary {
    pub normalized_key: String,
    pub canonical_id: TemplateId,
    pub canonical_name: String,
    pub deprecated_ids: Vec<TemplateId>,
    pub combined_use_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedMergeSummary {
    pub normalized_key: String,
    pub error: String,
}

/// A template whose derived fields could not be rewritten.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRefreshSummary {
    pub template_id: TemplateId,
    pub error: String,
}

/// Result of `run_normalization`. `merged_groups` is only present when the
/// job ran with merging enabled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizationReport {
    pub updated_count: usize,
    pub duplicate_groups: Vec<DuplicateGroupSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_groups: Option<Vec<MergedGroupSummary>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_groups: Vec<FailedMergeSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_refreshes: Vec<FailedRefreshSummary>,
}
