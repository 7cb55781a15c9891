// src/lifecycle/milestones.rs
//! Per-program ordered milestone lists.

use log::info;
use std::collections::HashSet;

use crate::errors::{TemplateError, TemplateResult};
use crate::models::core::{
    Milestone, MilestoneId, ProgramScope, TemplateId, SCOPE_LIST_SEPARATOR,
};
use crate::storage::{MilestoneRepository, MilestoneTemplateRepository};

const ENTITY: &str = "milestone";

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

/// Appends a milestone for a live template at the end of the scope's list.
pub async fn add_milestone(
    templates: &dyn MilestoneTemplateRepository,
    milestones: &dyn MilestoneRepository,
    scope: &ProgramScope,
    template_id: &TemplateId,
    is_default: bool,
) -> TemplateResult<Milestone> {
    validate_scope(scope)?;
    match templates.get(template_id).await? {
        Some(t) if t.is_live() => {}
        _ => return Err(TemplateError::not_found("template", template_id.as_str())),
    }
    Ok(milestones.append(scope, template_id, is_default).await?)
}

pub async fn list_milestones(
    milestones: &dyn MilestoneRepository,
    scope: &ProgramScope,
) -> TemplateResult<Vec<Milestone>> {
    validate_scope(scope)?;
    Ok(milestones.list(scope).await?)
}

/// Removes a user-added milestone. Seeded default entries cannot be deleted.
pub async fn delete_milestone(
    milestones: &dyn MilestoneRepository,
    id: &MilestoneId,
) -> TemplateResult<()> {
    let milestone = milestones
        .get(id)
        .await?
        .ok_or_else(|| TemplateError::not_found(ENTITY, id.as_str()))?;
    if milestone.is_default {
        return Err(TemplateError::Forbidden(format!(
            "milestone {} is a default entry and cannot be deleted",
            id
        )));
    }
    if !milestones.delete_and_compact(id).await? {
        return Err(TemplateError::not_found(ENTITY, id.as_str()));
    }
    info!(
        "Deleted milestone {} from {} (position {})",
        id, milestone.program_type, milestone.order
    );
    Ok(())
}

/// Rewrites the scope's order to follow `ordered_ids`, which must name every
/// milestone of the scope exactly once.
pub async fn reorder_milestones(
    milestones: &dyn MilestoneRepository,
    scope: &ProgramScope,
    ordered_ids: &[MilestoneId],
) -> TemplateResult<Vec<Milestone>> {
    validate_scope(scope)?;
    let current = milestones.list(scope).await?;
    let current_ids: HashSet<&MilestoneId> = current.iter().map(|m| &m.id).collect();
    let requested: HashSet<&MilestoneId> = ordered_ids.iter().collect();

    if requested.len() != ordered_ids.len() {
        return Err(TemplateError::Validation(
            "reorder list contains duplicate milestone ids".to_string(),
        ));
    }
    if requested != current_ids {
        return Err(TemplateError::Validation(format!(
            "reorder list must contain exactly the {} milestones of {}",
            current.len(),
            scope.program_type
        )));
    }
    Ok(milestones.reorder(scope, ordered_ids).await?)
}
