// src/dedup/duplicates.rs
//! Duplicate detection and merging of milestone templates, plus the
//! normalization job that drives both.

use anyhow::{bail, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::core::{join_scopes, MilestoneTemplate, ProgramScope, TemplateId};
use crate::models::stats_models::{
    DuplicateGroupSummary, FailedMergeSummary, FailedRefreshSummary, MergedGroupSummary,
    NormalizationReport,
};
use crate::normalization::{categorize, normalize_milestone_name};
use crate::storage::{MergeApplied, MergePlan, MilestoneTemplateRepository};
use crate::utils::logging::NormalizationLogger;

/// Live templates sharing one milestone key.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub normalized_key: String,
    pub members: Vec<MilestoneTemplate>,
}

impl DuplicateGroup {
    pub fn summary(&self) -> DuplicateGroupSummary {
        DuplicateGroupSummary {
            normalized_key: self.normalized_key.clone(),
            member_ids: self.members.iter().map(|t| t.id.clone()).collect(),
            member_names: self.members.iter().map(|t| t.name.clone()).collect(),
        }
    }
}

/// What a successful group merge left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMerge {
    pub canonical: MilestoneTemplate,
    pub deprecated_ids: Vec<TemplateId>,
}

/// Groups live templates by milestone key and keeps groups of two or more.
/// Groups come out in key order, members in input order.
pub fn find_duplicate_groups(templates: &[MilestoneTemplate]) -> Vec<DuplicateGroup> {
    let mut by_key: BTreeMap<String, Vec<MilestoneTemplate>> = BTreeMap::new();
    for template in templates.iter().filter(|t| t.is_live()) {
        let key = normalize_milestone_name(&template.name);
        if key.is_empty() {
            continue;
        }
        by_key.entry(key).or_default().push(template.clone());
    }

    by_key
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(normalized_key, members)| DuplicateGroup {
            normalized_key,
            members,
        })
        .collect()
}

/// Distinct served scopes of all members, first-seen order.
fn union_scopes(members: &[MilestoneTemplate]) -> Vec<ProgramScope> {
    let mut scopes: Vec<ProgramScope> = Vec::new();
    for scope in members.iter().flat_map(|t| t.scopes.iter()) {
        if !scopes.contains(scope) {
            scopes.push(scope.clone());
        }
    }
    scopes
}

/// Most frequent raw name; ties go to the name seen first.
fn most_frequent_name(members: &[MilestoneTemplate]) -> Option<&str> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for member in members {
        let count = counts.entry(member.name.as_str()).or_insert(0);
        if *count == 0 {
            order.push(member.name.as_str());
        }
        *count += 1;
    }

    let mut best: Option<(&str, usize)> = None;
    for name in order {
        let count = counts[name];
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((name, count));
        }
    }
    best.map(|(name, _)| name)
}

pub fn build_merge_plan(group: &DuplicateGroup) -> Result<MergePlan> {
    if group.members.len() < 2 {
        bail!(
            "Group '{}' has {} member(s); nothing to merge",
            group.normalized_key,
            group.members.len()
        );
    }
    let Some(canonical_name) = most_frequent_name(&group.members) else {
        bail!("Group '{}' has no members", group.normalized_key);
    };
    let Some(canonical) = group.members.iter().find(|t| t.name == canonical_name) else {
        bail!("Canonical name '{}' not carried by any member", canonical_name);
    };

    let scopes = union_scopes(&group.members);
    let (program_type, program_sub_type) = join_scopes(&scopes);

    Ok(MergePlan {
        normalized_key: group.normalized_key.clone(),
        canonical_id: canonical.id.clone(),
        canonical_name: canonical.name.clone(),
        category: categorize(&canonical.name),
        use_count: group.members.iter().map(|t| t.use_count).sum(),
        program_type,
        program_sub_type,
        scopes,
        member_ids: group.members.iter().map(|t| t.id.clone()).collect(),
        deprecated_ids: group
            .members
            .iter()
            .filter(|t| t.id != canonical.id)
            .map(|t| t.id.clone())
            .collect(),
    })
}

/// Live templates currently carrying `key`.
async fn reload_group(
    repo: &dyn MilestoneTemplateRepository,
    key: &str,
) -> Result<DuplicateGroup> {
    let members = repo
        .list_live(None)
        .await?
        .into_iter()
        .filter(|t| normalize_milestone_name(&t.name) == key)
        .collect();
    Ok(DuplicateGroup {
        normalized_key: key.to_string(),
        members,
    })
}

/// Collapses one duplicate group onto its canonical template.
///
/// A plan that went stale before it was applied is rebuilt from a fresh read
/// once. If the fresh read finds a single live member, the group was already
/// merged and that member is returned.
pub async fn merge_group(
    repo: &dyn MilestoneTemplateRepository,
    group: &DuplicateGroup,
) -> Result<GroupMerge> {
    let plan = build_merge_plan(group)?;
    if let MergeApplied::Merged(canonical) = repo.apply_merge(&plan).await? {
        return Ok(GroupMerge {
            canonical,
            deprecated_ids: plan.deprecated_ids,
        });
    }

    debug!(
        "Merge plan for '{}' went stale, re-reading group",
        group.normalized_key
    );
    let fresh = reload_group(repo, &group.normalized_key).await?;
    if fresh.members.len() < 2 {
        return match fresh.members.into_iter().next() {
            Some(canonical) => Ok(GroupMerge {
                canonical,
                deprecated_ids: Vec::new(),
            }),
            None => bail!("No live templates left for key '{}'", group.normalized_key),
        };
    }

    let plan = build_merge_plan(&fresh)?;
    match repo.apply_merge(&plan).await? {
        MergeApplied::Merged(canonical) => Ok(GroupMerge {
            canonical,
            deprecated_ids: plan.deprecated_ids,
        }),
        MergeApplied::Stale => bail!(
            "Group '{}' changed concurrently twice; giving up",
            group.normalized_key
        ),
    }
}

fn group_progress_bar(multi_progress: Option<&MultiProgress>, len: usize) -> Option<ProgressBar> {
    let mp = multi_progress?;
    let pb = mp.add(ProgressBar::new(len as u64));
    let style = ProgressStyle::default_bar()
        .template("  🧬 [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")
        .map(|s| s.progress_chars("█▉▊▋▌▍▎▏  "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message("Merging duplicate groups...");
    Some(pb)
}

/// Refreshes derived fields of every live template, reports duplicate groups
/// and, with `merge`, merges each group. A failing refresh or group is
/// reported and the rest of the job still runs.
pub async fn run_normalization(
    repo: &dyn MilestoneTemplateRepository,
    merge: bool,
    multi_progress: Option<&MultiProgress>,
) -> Result<NormalizationReport> {
    let logger = NormalizationLogger::new(merge);
    logger.log_start(merge);

    logger.log_phase("Loading templates", None);
    let templates = repo.list_live(None).await?;
    logger.log_data_loaded(templates.len());

    logger.log_phase("Grouping duplicates", None);
    let groups = find_duplicate_groups(&templates);
    let member_total: usize = groups.iter().map(|g| g.members.len()).sum();
    logger.log_groups_found(groups.len(), member_total);

    // Group members would collide on the live key; their merge writes the
    // refreshed fields instead.
    let grouped: HashSet<&TemplateId> = if merge {
        groups
            .iter()
            .flat_map(|g| g.members.iter().map(|t| &t.id))
            .collect()
    } else {
        HashSet::new()
    };

    logger.log_phase("Refreshing derived fields", None);
    let mut updated_count = 0;
    let mut failed_refreshes = Vec::new();
    for template in templates.iter().filter(|t| !grouped.contains(&t.id)) {
        let key = normalize_milestone_name(&template.name);
        let category = categorize(&template.name);
        if template.normalized_name == key && template.category == category {
            continue;
        }
        debug!(
            "Template {} drifted: '{}'/{} -> '{}'/{}",
            template.id,
            template.normalized_name,
            template.category.as_str(),
            key,
            category.as_str()
        );
        match repo.update_derived(&template.id, &key, category).await {
            Ok(()) => updated_count += 1,
            Err(e) => {
                let error = format!("{:#}", e);
                logger.log_refresh_failed(template.id.as_str(), &error);
                failed_refreshes.push(FailedRefreshSummary {
                    template_id: template.id.clone(),
                    error,
                });
            }
        }
    }

    let mut merged_groups = None;
    let mut failed_groups = Vec::new();
    if merge {
        logger.log_phase("Merging groups", Some(&format!("{} groups", groups.len())));
        let pb = group_progress_bar(multi_progress, groups.len());
        let mut merged = Vec::with_capacity(groups.len());

        for group in &groups {
            match merge_group(repo, group).await {
                Ok(result) => {
                    info!(
                        "Merged '{}' into {} ({} deprecated)",
                        group.normalized_key,
                        result.canonical.id,
                        result.deprecated_ids.len()
                    );
                    merged.push(MergedGroupSummary {
                        normalized_key: group.normalized_key.clone(),
                        canonical_id: result.canonical.id.clone(),
                        canonical_name: result.canonical.name.clone(),
                        deprecated_ids: result.deprecated_ids,
                        combined_use_count: result.canonical.use_count,
                    });
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    logger.log_group_failed(&group.normalized_key, &error);
                    failed_groups.push(FailedMergeSummary {
                        normalized_key: group.normalized_key.clone(),
                        error,
                    });
                }
            }
            if let Some(pb) = &pb {
                pb.inc(1);
            }
        }

        if let Some(pb) = pb {
            pb.finish_with_message(format!(
                "Merged {} groups ({} failed)",
                merged.len(),
                failed_groups.len()
            ));
        }
        merged_groups = Some(merged);
    }

    let report = NormalizationReport {
        updated_count,
        duplicate_groups: groups.iter().map(DuplicateGroup::summary).collect(),
        merged_groups,
        failed_groups,
        failed_refreshes,
    };
    logger.log_completion(&report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{create_or_reuse, list_templates};
    use crate::models::core::Category;
    use crate::storage::memory::MemoryStore;
    use crate::utils::config::LifecycleConfig;
    use crate::storage::MilestoneRepository;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn template(name: &str, program_type: &str, use_count: i32) -> MilestoneTemplate {
        scoped(name, ProgramScope::new(program_type, None), use_count)
    }

    fn scoped(name: &str, scope: ProgramScope, use_count: i32) -> MilestoneTemplate {
        let now = Utc::now();
        MilestoneTemplate {
            id: TemplateId::generate(),
            name: name.to_string(),
            normalized_name: normalize_milestone_name(name),
            category: categorize(name),
            program_type: scope.program_type.clone(),
            program_sub_type: scope.program_sub_type.clone(),
            scopes: vec![scope],
            use_count,
            is_approved: false,
            is_deprecated: false,
            canonical_id: None,
            flag_count: 0,
            flagged_by: BTreeSet::new(),
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_groups_only_keys_with_several_live_members() {
        let mut deprecated = template("Medical Exam", "Visitor Visa", 1);
        deprecated.is_deprecated = true;
        deprecated.canonical_id = Some(TemplateId::from("elsewhere"));
        let templates = vec![
            template("Biometrics completed", "Work Permit", 1),
            template("Medical Exam", "Work Permit", 1),
            template("Biometrics Complete", "Study Permit", 1),
            deprecated,
        ];

        let groups = find_duplicate_groups(&templates);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].normalized_key, "biometrics_completed");
        assert_eq!(groups[0].members[0].name, "Biometrics completed");
        assert_eq!(groups[0].members[1].name, "Biometrics Complete");
    }

    #[test]
    fn test_plan_prefers_most_frequent_name() {
        let group = DuplicateGroup {
            normalized_key: "aor_received".to_string(),
            members: vec![
                template("AOR Received", "Work Permit", 2),
                template("aor received", "Study Permit", 1),
                template("aor received", "Work Permit", 4),
            ],
        };
        let plan = build_merge_plan(&group).unwrap();
        assert_eq!(plan.canonical_name, "aor received");
        assert_eq!(plan.canonical_id, group.members[1].id);
        assert_eq!(plan.use_count, 7);
        assert_eq!(plan.program_type, "Work Permit,Study Permit");
        assert_eq!(plan.program_sub_type, None);
        assert_eq!(plan.deprecated_ids.len(), 2);
        assert!(!plan.deprecated_ids.contains(&plan.canonical_id));
    }

    #[test]
    fn test_plan_tie_goes_to_first_name() {
        let second = scoped(
            "Biometrics completed",
            ProgramScope::new("Study Permit", Some("SDS")),
            3,
        );
        let group = DuplicateGroup {
            normalized_key: "biometrics_completed".to_string(),
            members: vec![
                template("Biometrics Completed (Work Permit)", "Work Permit", 2),
                second,
            ],
        };
        let plan = build_merge_plan(&group).unwrap();
        assert_eq!(plan.canonical_name, "Biometrics Completed (Work Permit)");
        assert_eq!(plan.category, Category::Biometrics);
        assert_eq!(plan.program_sub_type.as_deref(), Some("SDS"));
        assert_eq!(
            plan.scopes,
            vec![
                ProgramScope::new("Work Permit", None),
                ProgramScope::new("Study Permit", Some("SDS")),
            ]
        );
    }

    #[tokio::test]
    async fn test_program_wide_scope_survives_merge_with_sub_typed_member() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let wp = ProgramScope::new("Work Permit", None);
        let sds = ProgramScope::new("Study Permit", Some("SDS"));
        for _ in 0..3 {
            create_or_reuse(&store, &config, "Biometrics completed", &wp, None)
                .await
                .unwrap();
        }
        create_or_reuse(&store, &config, "Biometrics complete (SP)", &sds, None)
            .await
            .unwrap();
        assert_eq!(list_templates(&store, &wp, false).await.unwrap().len(), 1);

        let report = run_normalization(&store, true, None).await.unwrap();
        assert_eq!(report.merged_groups.as_ref().map(Vec::len), Some(1));

        let listed = list_templates(&store, &wp, false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].program_sub_type.as_deref(), Some("SDS"));
        assert_eq!(
            list_templates(&store, &sds, false).await.unwrap()[0].id,
            listed[0].id
        );

        let reused = create_or_reuse(&store, &config, "Biometrics completed", &wp, None)
            .await
            .unwrap();
        assert_eq!(reused.id, listed[0].id);
        assert_eq!(reused.use_count, 5);
        assert!(reused.is_approved);
        assert_eq!(store.list_live(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_biometrics_variants_merge_into_one_canonical() {
        let store = MemoryStore::new();
        let first = template("Biometrics Completed (Work Permit)", "Work Permit", 2);
        let second = template("Biometrics completed", "Study Permit", 3);
        let (first_id, second_id) = (first.id.clone(), second.id.clone());
        store.insert_template_row(first).await;
        store.insert_template_row(second).await;

        let report = run_normalization(&store, true, None).await.unwrap();
        assert_eq!(report.duplicate_groups.len(), 1);
        let merged = report.merged_groups.as_ref().unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].canonical_id, first_id);
        assert_eq!(merged[0].combined_use_count, 5);
        assert_eq!(merged[0].deprecated_ids, vec![second_id.clone()]);
        assert!(report.failed_groups.is_empty());

        let canonical = MilestoneTemplateRepository::get(&store, &first_id).await.unwrap().unwrap();
        assert!(canonical.is_approved);
        assert_eq!(canonical.use_count, 5);
        assert_eq!(canonical.program_type, "Work Permit,Study Permit");
        assert_eq!(canonical.normalized_name, "biometrics_completed");

        let loser = MilestoneTemplateRepository::get(&store, &second_id).await.unwrap().unwrap();
        assert!(loser.is_deprecated);
        assert_eq!(loser.canonical_id, Some(first_id));
    }

    #[tokio::test]
    async fn test_merge_repoints_history_and_milestones() {
        let store = MemoryStore::new();
        let keep = template("Medical exam", "Work Permit", 1);
        let lose = template("medical exam", "Work Permit", 1);
        let lose_again = template("Medical exam", "Study Permit", 1);
        let (keep_id, lose_id) = (keep.id.clone(), lose.id.clone());
        store.insert_template_row(keep).await;
        store.insert_template_row(lose).await;
        store.insert_template_row(lose_again).await;

        store.record_status("app-1", &lose_id).await.unwrap();
        let scope = ProgramScope::new("Work Permit", None);
        let milestone = store.append(&scope, &lose_id, false).await.unwrap();

        run_normalization(&store, true, None).await.unwrap();

        let history = store.status_history_for(&keep_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].application_id, "app-1");
        assert!(store.status_history_for(&lose_id).await.unwrap().is_empty());

        let moved = MilestoneRepository::get(&store, &milestone.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.template_id, keep_id);
    }

    #[tokio::test]
    async fn test_rerunning_merge_is_a_no_op() {
        let store = MemoryStore::new();
        store
            .insert_template_row(template("ITA received", "Express Entry", 1))
            .await;
        store
            .insert_template_row(template("ITA Receive", "Express Entry", 1))
            .await;

        let first = run_normalization(&store, true, None).await.unwrap();
        assert_eq!(first.merged_groups.as_ref().map(Vec::len), Some(1));
        let after_first = store.all_templates().await;

        let second = run_normalization(&store, true, None).await.unwrap();
        assert!(second.duplicate_groups.is_empty());
        assert_eq!(second.merged_groups, Some(Vec::new()));
        assert_eq!(second.updated_count, 0);
        assert_eq!(store.all_templates().await, after_first);
    }

    #[tokio::test]
    async fn test_report_only_run_leaves_templates_live() {
        let store = MemoryStore::new();
        store
            .insert_template_row(template("Passport Request", "Visitor Visa", 1))
            .await;
        store
            .insert_template_row(template("passport request!", "Visitor Visa", 1))
            .await;

        let report = run_normalization(&store, false, None).await.unwrap();
        assert_eq!(report.duplicate_groups.len(), 1);
        assert!(report.merged_groups.is_none());
        assert_eq!(store.list_live(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_drifted_derived_fields_are_counted_once() {
        let store = MemoryStore::new();
        let mut drifted = template("Decision Made", "Work Permit", 1);
        drifted.normalized_name = "decision".to_string();
        drifted.category = Category::Other;
        let id = drifted.id.clone();
        store.insert_template_row(drifted).await;
        store
            .insert_template_row(template("Medical exam", "Work Permit", 1))
            .await;

        let report = run_normalization(&store, false, None).await.unwrap();
        assert_eq!(report.updated_count, 1);
        let refreshed = MilestoneTemplateRepository::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(refreshed.normalized_name, "decision_made");
        assert_eq!(refreshed.category, Category::Decision);

        let again = run_normalization(&store, false, None).await.unwrap();
        assert_eq!(again.updated_count, 0);
    }

    #[tokio::test]
    async fn test_refresh_collision_on_live_key_is_reported() {
        let store = MemoryStore::new();
        let mut request = template("Passport request", "Work Permit", 1);
        request.normalized_name = "passport_request".to_string();
        let mut requested = template("Passport requested", "Work Permit", 1);
        requested.normalized_name = "passport_requested".to_string();
        let (request_id, requested_id) = (request.id.clone(), requested.id.clone());
        store.insert_template_row(request).await;
        store.insert_template_row(requested).await;

        let report = run_normalization(&store, false, None).await.unwrap();
        assert_eq!(report.duplicate_groups.len(), 1);
        assert_eq!(report.updated_count, 1);
        assert_eq!(report.failed_refreshes.len(), 1);
        assert_eq!(report.failed_refreshes[0].template_id, requested_id);

        let report = run_normalization(&store, true, None).await.unwrap();
        assert!(report.failed_refreshes.is_empty());
        assert!(report.failed_groups.is_empty());
        let merged = report.merged_groups.unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].canonical_id, request_id);

        let canonical = MilestoneTemplateRepository::get(&store, &request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canonical.normalized_name, "passport_required");
        assert_eq!(store.list_live(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_group_is_reread_before_merging() {
        let store = MemoryStore::new();
        store
            .insert_template_row(template("AOR received", "Work Permit", 1))
            .await;
        store
            .insert_template_row(template("AOR Receive", "Study Permit", 1))
            .await;

        let groups = find_duplicate_groups(&store.list_live(None).await.unwrap());
        let group = groups[0].clone();
        let first = merge_group(&store, &group).await.unwrap();
        assert_eq!(first.deprecated_ids.len(), 1);

        assert_eq!(
            store
                .apply_merge(&build_merge_plan(&group).unwrap())
                .await
                .unwrap(),
            MergeApplied::Stale
        );

        let again = merge_group(&store, &group).await.unwrap();
        assert_eq!(again.canonical.id, first.canonical.id);
        assert!(again.deprecated_ids.is_empty());
    }
}
