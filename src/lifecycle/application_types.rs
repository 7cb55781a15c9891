// src/lifecycle/application_types.rs
//! Application types follow the template rules: reuse by normalized name
//! within a category, promotion to default by use count, flag demotion while
//! no application uses them.

use log::{debug, info};

use crate::errors::{TemplateError, TemplateResult};
use crate::lifecycle::milestone_templates::{by_popularity, crosses_threshold};
use crate::models::core::{ApplicationType, ApplicationTypeId, NewApplicationType, UserId};
use crate::normalization::normalize;
use crate::storage::{ApplicationTypeRepository, FlagMutation};
use crate::utils::config::LifecycleConfig;

const ENTITY: &str = "application type";

pub async fn create_or_reuse_application_type(
    repo: &dyn ApplicationTypeRepository,
    config: &LifecycleConfig,
    name: &str,
    category: &str,
    actor: Option<&UserId>,
) -> TemplateResult<ApplicationType> {
    let name = name.trim();
    let category = category.trim();
    if name.is_empty() {
        return Err(TemplateError::Validation(
            "application type name must not be empty".to_string(),
        ));
    }
    if category.is_empty() {
        return Err(TemplateError::Validation(
            "application type category must not be empty".to_string(),
        ));
    }
    let normalized_name = normalize(name);
    if normalized_name.is_empty() {
        return Err(TemplateError::Validation(format!(
            "application type name '{}' has no usable characters",
            name
        )));
    }

    let new = NewApplicationType {
        name: name.to_string(),
        normalized_name,
        category: category.to_string(),
        created_by: actor.cloned(),
    };
    let (application_type, created) = repo.insert_or_increment(&new).await?;
    debug!(
        "create_or_reuse_application_type '{}' in {}: {} (created: {}, use_count: {})",
        name, category, application_type.id, created, application_type.use_count
    );

    if !application_type.is_default
        && crosses_threshold(application_type.use_count, config.approval_threshold)
    {
        info!(
            "✅ Application type {} ('{}') reached {} uses, promoting to default",
            application_type.id, application_type.name, application_type.use_count
        );
        let promoted = repo.set_default(&application_type.id, true).await?;
        return Ok(promoted.unwrap_or(application_type));
    }
    Ok(application_type)
}

pub async fn flag_application_type(
    repo: &dyn ApplicationTypeRepository,
    config: &LifecycleConfig,
    id: &ApplicationTypeId,
    user_id: &UserId,
) -> TemplateResult<ApplicationType> {
    let application_type = match repo.add_flag(id, user_id).await? {
        FlagMutation::Applied(a) => a,
        FlagMutation::Unchanged(_) => {
            return Err(TemplateError::AlreadyFlagged {
                entity: ENTITY,
                id: id.to_string(),
                user_id: user_id.to_string(),
            })
        }
        FlagMutation::Missing => return Err(TemplateError::not_found(ENTITY, id.as_str())),
    };

    if application_type.is_default && application_type.flag_count >= config.flag_threshold {
        let usages = repo.count_live_usages(&application_type.id).await?;
        if usages == 0 {
            info!(
                "🚩 Application type {} has {} flags and no applications, dropping default",
                application_type.id, application_type.flag_count
            );
            let demoted = repo.set_default(&application_type.id, false).await?;
            return Ok(demoted.unwrap_or(application_type));
        }
    }
    Ok(application_type)
}

pub async fn unflag_application_type(
    repo: &dyn ApplicationTypeRepository,
    id: &ApplicationTypeId,
    user_id: &UserId,
) -> TemplateResult<ApplicationType> {
    match repo.remove_flag(id, user_id).await? {
        FlagMutation::Applied(a) => Ok(a),
        FlagMutation::Unchanged(_) => Err(TemplateError::NotFlagged {
            entity: ENTITY,
            id: id.to_string(),
            user_id: user_id.to_string(),
        }),
        FlagMutation::Missing => Err(TemplateError::not_found(ENTITY, id.as_str())),
    }
}

/// Default application types, plus custom ones when `include_custom` is set.
pub async fn list_application_types(
    repo: &dyn ApplicationTypeRepository,
    category: Option<&str>,
    include_custom: bool,
) -> TemplateResult<Vec<ApplicationType>> {
    let category = category.map(str::trim).filter(|c| !c.is_empty());
    let mut application_types: Vec<ApplicationType> = repo
        .list(category)
        .await?
        .into_iter()
        .filter(|a| include_custom || a.is_default)
        .collect();
    application_types.sort_by(|a, b| by_popularity(a.use_count, &a.name, b.use_count, &b.name));
    Ok(application_types)
}
