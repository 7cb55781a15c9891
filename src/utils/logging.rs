// src/utils/logging.rs - Phase logging for the template normalization job
use log::{info, warn};
use std::time::Instant;

use crate::models::stats_models::NormalizationReport;

#[derive(Clone)]
pub struct NormalizationLogger {
    job_name: &'static str,
    job_emoji: &'static str,
    start_time: Instant,
}

impl NormalizationLogger {
    pub fn new(merge: bool) -> Self {
        let (job_name, job_emoji) = if merge {
            ("MERGE", "🧬")
        } else {
            ("NORMALIZE", "🔤")
        };
        Self {
            job_name,
            job_emoji,
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, merge: bool) {
        info!(
            "[{}] {} 🚀 Starting template normalization{}",
            self.job_name,
            self.job_emoji,
            if merge { " with duplicate merging" } else { " (report only)" }
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        match details {
            Some(details) => info!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.job_name,
                self.job_emoji,
                phase,
                details,
                elapsed.as_secs_f32()
            ),
            None => info!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.job_name,
                self.job_emoji,
                phase,
                elapsed.as_secs_f32()
            ),
        }
    }

    pub fn log_data_loaded(&self, count: usize) {
        info!(
            "[{}] {} 📊 Loaded {} live milestone templates",
            self.job_name, self.job_emoji, count
        );
    }

    pub fn log_groups_found(&self, groups: usize, members: usize) {
        if groups > 0 {
            info!(
                "[{}] {} 🔍 Found {} duplicate groups covering {} templates",
                self.job_name, self.job_emoji, groups, members
            );
        } else {
            info!(
                "[{}] {} ✨ No duplicate templates found",
                self.job_name, self.job_emoji
            );
        }
    }

    pub fn log_group_failed(&self, key: &str, error: &str) {
        warn!(
            "[{}] {} ⚠️  Merge of group '{}' failed: {}",
            self.job_name, self.job_emoji, key, error
        );
    }

    pub fn log_refresh_failed(&self, template_id: &str, error: &str) {
        warn!(
            "[{}] {} ⚠️  Refresh of template {} failed: {}",
            self.job_name, self.job_emoji, template_id, error
        );
    }

    pub fn log_completion(&self, report: &NormalizationReport) {
        let duration = self.start_time.elapsed();
        info!(
            "[{}] {} 🎉 COMPLETED in {:.2?}: {} derived fields refreshed, {} duplicate groups",
            self.job_name,
            self.job_emoji,
            duration,
            report.updated_count,
            report.duplicate_groups.len()
        );
        if let Some(merged) = &report.merged_groups {
            let deprecated: usize = merged.iter().map(|g| g.deprecated_ids.len()).sum();
            info!(
                "[{}] {} 📊 Results: {} groups merged, {} templates deprecated",
                self.job_name,
                self.job_emoji,
                merged.len(),
                deprecated
            );
        }
        if !report.failed_groups.is_empty() {
            warn!(
                "[{}] {} ⚠️  {} groups could not be merged",
                self.job_name,
                self.job_emoji,
                report.failed_groups.len()
            );
        }
        if !report.failed_refreshes.is_empty() {
            warn!(
                "[{}] {} ⚠️  {} templates kept stale derived fields",
                self.job_name,
                self.job_emoji,
                report.failed_refreshes.len()
            );
        }
    }
}
