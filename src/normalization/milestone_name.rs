// src/normalization/milestone_name.rs
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::core::Category;
use crate::normalization::string_utils::{collapse_non_word, strip_parentheticals};

/// Verb-tense and synonym groups folded onto one token each.
const TENSE_GROUPS: [(&str, &str); 7] = [
    (r"\b(completion|completed|complete|completes|completing)\b", "completed"),
    (r"\b(required|requested|requirement|requirements|request|requests)\b", "required"),
    (r"\b(submission|submitted|submit|submits|submitting)\b", "submitted"),
    (r"\b(received|receive|receives|receipt|receiving)\b", "received"),
    (r"\b(approval|approve|approves|approved)\b", "approved"),
    (r"\b(issuance|issue|issues|issued)\b", "issued"),
    (r"\b(scheduling|schedule|schedules|scheduled)\b", "scheduled"),
];

/// Category keyword rules, checked in order; the first rule with a keyword
/// contained in the normalized name wins.
const CATEGORY_RULES: [(&[&str], Category); 6] = [
    (&["application", "submit", "aor", "ita"], Category::Application),
    (&["biometric"], Category::Biometrics),
    (&["medical", "exam"], Category::Medical),
    (&["document"], Category::Document),
    (&["decision", "approved", "rejected", "copr"], Category::Decision),
    (&["background", "check"], Category::BackgroundCheck),
];

static TENSE_TABLE: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    TENSE_GROUPS
        .iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(re) => Some((re, *replacement)),
            Err(e) => {
                warn!("Invalid tense pattern '{}': {}", pattern, e);
                None
            }
        })
        .collect()
});

/// Grouping key for duplicate detection: tense-insensitive, underscore-joined.
///
/// "Biometrics Completed (Work Permit)" and "biometrics complete" both map to
/// `biometrics_completed`.
pub fn normalize_milestone_name(name: &str) -> String {
    let stripped = strip_parentheticals(name).to_lowercase();
    let mut normalized = collapse_non_word(&stripped);

    for (re, replacement) in TENSE_TABLE.iter() {
        normalized = re.replace_all(&normalized, *replacement).into_owned();
    }

    normalized.split_whitespace().collect::<Vec<_>>().join("_")
}

pub fn categorize(name: &str) -> Category {
    let normalized = normalize_milestone_name(name);
    CATEGORY_RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| normalized.contains(k)))
        .map(|(_, category)| *category)
        .unwrap_or(Category::Other)
}
