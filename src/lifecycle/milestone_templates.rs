// src/lifecycle/milestone_templates.rs
//! Create-or-reuse, flagging and listing of crowd-sourced milestone templates.

use log::{debug, info};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::errors::{TemplateError, TemplateResult};
use crate::models::core::{
    Category, MilestoneTemplate, NewMilestoneTemplate, ProgramScope, TemplateId, UserId,
    SCOPE_LIST_SEPARATOR,
};
use crate::normalization::{categorize, normalize_milestone_name, similarity};
use crate::storage::{FlagMutation, MilestoneTemplateRepository};
use crate::utils::config::LifecycleConfig;

const ENTITY: &str = "template";

/// True when going from `current - 1` to `current` uses reaches `threshold`.
pub(crate) fn crosses_threshold(current: i32, threshold: i32) -> bool {
    current - 1 < threshold && threshold <= current
}

pub(crate) fn by_popularity(a_count: i32, a_name: &str, b_count: i32, b_name: &str) -> Ordering {
    b_count.cmp(&a_count).then_with(|| a_name.cmp(b_name))
}

fn validate_scope(scope: &ProgramScope) -> TemplateResult<()> {
    if scope.program_type.is_empty() {
        return Err(TemplateError::Validation(
            "program type must not be empty".to_string(),
        ));
    }
    if scope.contains_list_separator() {
        return Err(TemplateError::Validation(format!(
            "program type and sub-type must not contain '{}'",
            SCOPE_LIST_SEPARATOR
        )));
    }
    Ok(())
}

/// Returns the live template for `name` in `scope`, creating it on first use.
///
/// Every call counts as one use. The call that lifts `use_count` onto the
/// approval threshold approves the template.
pub async fn create_or_reuse(
    repo: &dyn MilestoneTemplateRepository,
    config: &LifecycleConfig,
    name: &str,
    scope: &ProgramScope,
    actor: Option<&UserId>,
) -> TemplateResult<MilestoneTemplate> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TemplateError::Validation(
            "template name must not be empty".to_string(),
        ));
    }
    validate_scope(scope)?;

    let normalized_name = normalize_milestone_name(name);
    if normalized_name.is_empty() {
        return Err(TemplateError::Validation(format!(
            "template name '{}' has no usable characters",
            name
        )));
    }

    let new = NewMilestoneTemplate {
        name: name.to_string(),
        normalized_name,
        category: categorize(name),
        scope: scope.clone(),
        created_by: actor.cloned(),
    };
    let (template, created) = repo.insert_or_increment(&new).await?;
    debug!(
        "create_or_reuse '{}' in {}: {} (created: {}, use_count: {})",
        name, scope.program_type, template.id, created, template.use_count
    );

    if !template.is_approved && crosses_threshold(template.use_count, config.approval_threshold)
    {
        info!(
            "✅ Template {} ('{}') reached {} uses, approving",
            template.id, template.name, template.use_count
        );
        let approved = repo.set_approval(&template.id, true).await?;
        return Ok(approved.unwrap_or(template));
    }
    Ok(template)
}

/// Records `user_id`'s flag on a live template. Once the flag threshold is
/// reached, an approved template nobody uses loses its approval.
pub async fn flag(
    repo: &dyn MilestoneTemplateRepository,
    config: &LifecycleConfig,
    template_id: &TemplateId,
    user_id: &UserId,
) -> TemplateResult<MilestoneTemplate> {
    let template = match repo.add_flag(template_id, user_id).await? {
        FlagMutation::Applied(t) => t,
        FlagMutation::Unchanged(_) => {
            return Err(TemplateError::AlreadyFlagged {
                entity: ENTITY,
                id: template_id.to_string(),
                user_id: user_id.to_string(),
            })
        }
        FlagMutation::Missing => return Err(TemplateError::not_found(ENTITY, template_id.as_str())),
    };

    if template.is_approved && template.flag_count >= config.flag_threshold {
        let usages = repo.count_live_usages(&template.id).await?;
        if usages == 0 {
            info!(
                "🚩 Template {} has {} flags and no milestones, revoking approval",
                template.id, template.flag_count
            );
            let demoted = repo.set_approval(&template.id, false).await?;
            return Ok(demoted.unwrap_or(template));
        }
        debug!(
            "Template {} has {} flags but {} milestones, keeping approval",
            template.id, template.flag_count, usages
        );
    }
    Ok(template)
}

/// Withdraws `user_id`'s flag. Approval is never restored here.
pub async fn unflag(
    repo: &dyn MilestoneTemplateRepository,
    template_id: &TemplateId,
    user_id: &UserId,
) -> TemplateResult<MilestoneTemplate> {
    match repo.remove_flag(template_id, user_id).await? {
        FlagMutation::Applied(t) => Ok(t),
        FlagMutation::Unchanged(_) => Err(TemplateError::NotFlagged {
            entity: ENTITY,
            id: template_id.to_string(),
            user_id: user_id.to_string(),
        }),
        FlagMutation::Missing => Err(TemplateError::not_found(ENTITY, template_id.as_str())),
    }
}

fn sort_by_popularity(templates: &mut [MilestoneTemplate]) {
    templates.sort_by(|a, b| by_popularity(a.use_count, &a.name, b.use_count, &b.name));
}

/// Live templates that apply to `scope`, most used first.
pub async fn list_templates(
    repo: &dyn MilestoneTemplateRepository,
    scope: &ProgramScope,
    include_unapproved: bool,
) -> TemplateResult<Vec<MilestoneTemplate>> {
    validate_scope(scope)?;
    let mut templates: Vec<MilestoneTemplate> = repo
        .list_live(Some(&scope.program_type))
        .await?
        .into_iter()
        .filter(|t| t.applies_to(scope))
        .filter(|t| include_unapproved || t.is_approved)
        .collect();
    sort_by_popularity(&mut templates);
    Ok(templates)
}

/// Approved live templates grouped by category. Without a program type every
/// program is included.
pub async fn list_templates_by_category(
    repo: &dyn MilestoneTemplateRepository,
    program_type: Option<&str>,
    program_sub_type: Option<&str>,
) -> TemplateResult<BTreeMap<Category, Vec<MilestoneTemplate>>> {
    let templates = match program_type.map(str::trim).filter(|p| !p.is_empty()) {
        Some(program_type) => {
            list_templates(repo, &ProgramScope::new(program_type, program_sub_type), false)
                .await?
        }
        None => {
            if program_sub_type.map_or(false, |s| !s.trim().is_empty()) {
                return Err(TemplateError::Validation(
                    "program sub-type requires a program type".to_string(),
                ));
            }
            let mut all: Vec<MilestoneTemplate> = repo
                .list_live(None)
                .await?
                .into_iter()
                .filter(|t| t.is_approved)
                .collect();
            sort_by_popularity(&mut all);
            all
        }
    };

    let mut by_category: BTreeMap<Category, Vec<MilestoneTemplate>> = BTreeMap::new();
    for template in templates {
        by_category.entry(template.category).or_default().push(template);
    }
    Ok(by_category)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSuggestion {
    pub template: MilestoneTemplate,
    pub score: f64,
}

/// Live templates in `scope` whose names resemble `name`, best match first.
pub async fn suggest_similar(
    repo: &dyn MilestoneTemplateRepository,
    name: &str,
    scope: &ProgramScope,
    min_similarity: f64,
    limit: usize,
) -> TemplateResult<Vec<TemplateSuggestion>> {
    if name.trim().is_empty() {
        return Err(TemplateError::Validation(
            "query name must not be empty".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&min_similarity) {
        return Err(TemplateError::Validation(format!(
            "minimum similarity must be within [0, 1], got {}",
            min_similarity
        )));
    }
    validate_scope(scope)?;

    let mut suggestions: Vec<TemplateSuggestion> = repo
        .list_live(Some(&scope.program_type))
        .await?
        .into_iter()
        .filter(|t| t.applies_to(scope))
        .filter_map(|t| {
            let score = similarity(name, &t.name);
            (score > 0.0 && score >= min_similarity).then_some(TemplateSuggestion {
                template: t,
                score,
            })
        })
        .collect();

    suggestions.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                by_popularity(
                    a.template.use_count,
                    &a.template.name,
                    b.template.use_count,
                    &b.template.name,
                )
            })
    });
    suggestions.truncate(limit);
    Ok(suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::MilestoneRepository;

    fn wp() -> ProgramScope {
        ProgramScope::new("Work Permit", None)
    }

    fn user(id: &str) -> UserId {
        UserId::from(id)
    }

    async fn approved_template(store: &MemoryStore, name: &str) -> MilestoneTemplate {
        let config = LifecycleConfig::default();
        let mut template = create_or_reuse(store, &config, name, &wp(), None)
            .await
            .unwrap();
        for _ in 1..config.approval_threshold {
            template = create_or_reuse(store, &config, name, &wp(), None)
                .await
                .unwrap();
        }
        assert!(template.is_approved);
        template
    }

    #[test]
    fn test_threshold_crossing() {
        assert!(crosses_threshold(3, 3));
        assert!(!crosses_threshold(2, 3));
        assert!(!crosses_threshold(4, 3));
        assert!(crosses_threshold(1, 1));
    }

    #[tokio::test]
    async fn test_same_normalized_name_reuses_one_template() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let first = create_or_reuse(&store, &config, "Biometrics Completed", &wp(), None)
            .await
            .unwrap();
        let second = create_or_reuse(&store, &config, "  biometrics complete ", &wp(), None)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.use_count, 2);
        assert!(!second.is_approved);
        assert_eq!(store.list_live(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_different_scopes_get_separate_templates() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let wide = create_or_reuse(&store, &config, "Medical exam", &wp(), None)
            .await
            .unwrap();
        let narrow = create_or_reuse(
            &store,
            &config,
            "Medical exam",
            &ProgramScope::new("Work Permit", Some("PGWP")),
            None,
        )
        .await
        .unwrap();
        assert_ne!(wide.id, narrow.id);
    }

    #[tokio::test]
    async fn test_third_use_approves() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let actor = user("u1");
        let mut last = None;
        for expected in 1..=3 {
            let t = create_or_reuse(&store, &config, "AOR received", &wp(), Some(&actor))
                .await
                .unwrap();
            assert_eq!(t.use_count, expected);
            assert_eq!(t.is_approved, expected >= 3);
            last = Some(t);
        }
        assert_eq!(last.unwrap().created_by, Some(actor));
    }

    #[tokio::test]
    async fn test_demoted_template_is_not_reapproved_by_later_uses() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let template = approved_template(&store, "Passport request").await;
        for u in ["a", "b", "c"] {
            flag(&store, &config, &template.id, &user(u)).await.unwrap();
        }
        let reused = create_or_reuse(&store, &config, "Passport request", &wp(), None)
            .await
            .unwrap();
        assert_eq!(reused.use_count, 4);
        assert!(!reused.is_approved);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        for (name, scope) in [
            ("   ", wp()),
            ("Biometrics", ProgramScope::new(" ", None)),
            ("(only a note) !!", wp()),
        ] {
            let err = create_or_reuse(&store, &config, name, &scope, None)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "validation_error");
        }
        assert!(store.list_live(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scope_with_list_separator_is_rejected() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        for scope in [
            ProgramScope::new("Work Permit, Open", None),
            ProgramScope::new("Work Permit", Some("PGWP,SOWP")),
        ] {
            for _ in 0..2 {
                let err = create_or_reuse(&store, &config, "Medical exam", &scope, None)
                    .await
                    .unwrap_err();
                assert_eq!(err.kind(), "validation_error");
            }
            let err = list_templates(&store, &scope, true).await.unwrap_err();
            assert_eq!(err.kind(), "validation_error");
        }
        assert!(store.list_live(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_three_flags_demote_unused_template() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let template = approved_template(&store, "Background check").await;

        let t = flag(&store, &config, &template.id, &user("a")).await.unwrap();
        assert_eq!(t.flag_count, 1);
        flag(&store, &config, &template.id, &user("b")).await.unwrap();
        let t = flag(&store, &config, &template.id, &user("c")).await.unwrap();

        assert_eq!(t.flag_count, 3);
        assert_eq!(t.flagged_by.len(), 3);
        assert!(!t.is_approved);
    }

    #[tokio::test]
    async fn test_flags_keep_approval_while_template_is_used() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let template = approved_template(&store, "Medical exam passed").await;
        store.append(&wp(), &template.id, false).await.unwrap();

        for u in ["a", "b", "c", "d"] {
            flag(&store, &config, &template.id, &user(u)).await.unwrap();
        }
        let t = MilestoneTemplateRepository::get(&store, &template.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.flag_count, 4);
        assert!(t.is_approved);
    }

    #[tokio::test]
    async fn test_double_flag_is_rejected() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let template = create_or_reuse(&store, &config, "ITA received", &wp(), None)
            .await
            .unwrap();
        flag(&store, &config, &template.id, &user("a")).await.unwrap();

        let err = flag(&store, &config, &template.id, &user("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::AlreadyFlagged { .. }));
        let t = MilestoneTemplateRepository::get(&store, &template.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.flag_count, 1);
    }

    #[tokio::test]
    async fn test_unflag_by_non_flagger_leaves_count() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let template = create_or_reuse(&store, &config, "ITA received", &wp(), None)
            .await
            .unwrap();
        flag(&store, &config, &template.id, &user("a")).await.unwrap();

        let err = unflag(&store, &template.id, &user("b")).await.unwrap_err();
        assert!(matches!(err, TemplateError::NotFlagged { .. }));
        let t = MilestoneTemplateRepository::get(&store, &template.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.flag_count, 1);

        let t = unflag(&store, &template.id, &user("a")).await.unwrap();
        assert_eq!(t.flag_count, 0);
        assert!(t.flagged_by.is_empty());
    }

    #[tokio::test]
    async fn test_unflag_does_not_restore_approval() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let template = approved_template(&store, "COPR issued").await;
        for u in ["a", "b", "c"] {
            flag(&store, &config, &template.id, &user(u)).await.unwrap();
        }
        let t = unflag(&store, &template.id, &user("c")).await.unwrap();
        assert_eq!(t.flag_count, 2);
        assert!(!t.is_approved);
    }

    #[tokio::test]
    async fn test_flag_count_tracks_flagged_by() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let template = create_or_reuse(&store, &config, "Decision made", &wp(), None)
            .await
            .unwrap();
        let steps: [(&str, bool); 6] = [
            ("a", true),
            ("b", true),
            ("a", false),
            ("c", true),
            ("b", false),
            ("a", true),
        ];
        for (u, add) in steps {
            let t = if add {
                flag(&store, &config, &template.id, &user(u)).await.unwrap()
            } else {
                unflag(&store, &template.id, &user(u)).await.unwrap()
            };
            assert_eq!(t.flag_count as usize, t.flagged_by.len());
        }
    }

    #[tokio::test]
    async fn test_flagging_missing_or_deprecated_template_is_not_found() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        let err = flag(&store, &config, &TemplateId::from("nope"), &user("a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let err = unflag(&store, &TemplateId::from("nope"), &user("a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_listing_filters_and_orders() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        approved_template(&store, "Medical exam").await;
        let busy = approved_template(&store, "Biometrics completed").await;
        create_or_reuse(&store, &config, "Biometrics completed", &wp(), None)
            .await
            .unwrap();
        create_or_reuse(&store, &config, "AOR received", &wp(), None)
            .await
            .unwrap();
        for _ in 0..3 {
            create_or_reuse(
                &store,
                &config,
                "Open work permit issued",
                &ProgramScope::new("Work Permit", Some("SOWP")),
                None,
            )
            .await
            .unwrap();
        }

        let approved = list_templates(&store, &wp(), false).await.unwrap();
        let names: Vec<&str> = approved.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Biometrics completed", "Medical exam"]);
        assert_eq!(approved[0].id, busy.id);

        let all = list_templates(&store, &wp(), true).await.unwrap();
        assert_eq!(all.len(), 3);

        let sowp = list_templates(&store, &ProgramScope::new("Work Permit", Some("SOWP")), false)
            .await
            .unwrap();
        assert_eq!(sowp.len(), 3);

        let other = list_templates(&store, &ProgramScope::new("Study Permit", None), true)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_grouping_by_category() {
        let store = MemoryStore::new();
        approved_template(&store, "Medical exam").await;
        approved_template(&store, "Biometrics completed").await;
        approved_template(&store, "Biometrics letter received").await;
        create_or_reuse(
            &store,
            &LifecycleConfig::default(),
            "Document uploaded",
            &wp(),
            None,
        )
        .await
        .unwrap();

        let grouped = list_templates_by_category(&store, Some("Work Permit"), None)
            .await
            .unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&Category::Biometrics].len(), 2);
        assert_eq!(grouped[&Category::Medical].len(), 1);
        assert!(!grouped.contains_key(&Category::Document));

        let everywhere = list_templates_by_category(&store, None, None).await.unwrap();
        assert_eq!(everywhere, grouped);

        let err = list_templates_by_category(&store, None, Some("PGWP"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_suggestions_rank_by_similarity() {
        let store = MemoryStore::new();
        let config = LifecycleConfig::default();
        for name in ["Biometrics completed", "Biometrics letter", "Medical exam"] {
            create_or_reuse(&store, &config, name, &wp(), None)
                .await
                .unwrap();
        }

        let suggestions = suggest_similar(&store, "biometrics complete", &wp(), 0.5, 5)
            .await
            .unwrap();
        assert!(!suggestions.is_empty());
        assert_eq!(suggestions[0].template.name, "Biometrics completed");
        assert!(suggestions.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(suggestions.iter().all(|s| s.score >= 0.5));
        assert!(suggestions
            .iter()
            .all(|s| s.template.name != "Medical exam"));

        let limited = suggest_similar(&store, "biometrics", &wp(), 0.0, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let err = suggest_similar(&store, "biometrics", &wp(), 1.5, 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
