// src/utils/constants.rs

/// Use count at which a crowd-sourced template becomes approved.
pub const DEFAULT_APPROVAL_THRESHOLD: i32 = 3;

/// Distinct flaggers needed before an unused template loses its approval.
pub const DEFAULT_FLAG_THRESHOLD: i32 = 3;

/// Minimum `similarity` score for a template to be offered as a suggestion.
pub const DEFAULT_SUGGESTION_SIMILARITY: f64 = 0.6;

pub const DEFAULT_SUGGESTION_LIMIT: usize = 5;
