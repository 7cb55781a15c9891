// src/storage/mod.rs
//! Persistence seams for the template engine.
//!
//! Lifecycle code only talks to these traits. Each method that changes
//! counters or flag sets is a single atomic unit in the backend, so callers
//! never run a find-then-write sequence of their own.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::core::{
    ApplicationType, ApplicationTypeId, Category, Milestone, MilestoneId, MilestoneTemplate,
    NewApplicationType, NewMilestoneTemplate, ProgramScope, StatusHistoryEntry, TemplateId,
    UserId,
};

/// Outcome of an add-flag / remove-flag call.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagMutation<T> {
    /// The flag set changed; carries the updated row.
    Applied(T),
    /// The user was already in (add) or absent from (remove) the flag set.
    Unchanged(T),
    /// No live row with that id.
    Missing,
}

/// Everything the backend needs to collapse one duplicate group.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub normalized_key: String,
    pub canonical_id: TemplateId,
    pub canonical_name: String,
    pub category: Category,
    pub use_count: i32,
    pub program_type: String,
    pub program_sub_type: Option<String>,
    /// Union of the members' served scopes, first-seen order.
    pub scopes: Vec<ProgramScope>,
    /// Every member of the group, canonical included.
    pub member_ids: Vec<TemplateId>,
    pub deprecated_ids: Vec<TemplateId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeApplied {
    Merged(MilestoneTemplate),
    /// A member was deprecated or removed since the plan was computed.
    /// Nothing was written.
    Stale,
}

#[async_trait]
pub trait MilestoneTemplateRepository: Send + Sync {
    /// Increments the live template matching the normalized name and scope,
    /// or inserts a new one with `use_count = 1`. Returns the row and whether
    /// it was created.
    async fn insert_or_increment(
        &self,
        new: &NewMilestoneTemplate,
    ) -> Result<(MilestoneTemplate, bool)>;

    async fn get(&self, id: &TemplateId) -> Result<Option<MilestoneTemplate>>;

    /// Non-deprecated templates, optionally restricted to those serving some
    /// scope of `program_type`. Ordered by creation.
    async fn list_live(&self, program_type: Option<&str>) -> Result<Vec<MilestoneTemplate>>;

    async fn set_approval(
        &self,
        id: &TemplateId,
        approved: bool,
    ) -> Result<Option<MilestoneTemplate>>;

    /// Rewrites `normalized_name` and `category`. Fails when another live
    /// template already holds the new key in the same scope.
    async fn update_derived(
        &self,
        id: &TemplateId,
        normalized_name: &str,
        category: Category,
    ) -> Result<()>;

    async fn add_flag(
        &self,
        id: &TemplateId,
        user_id: &UserId,
    ) -> Result<FlagMutation<MilestoneTemplate>>;

    async fn remove_flag(
        &self,
        id: &TemplateId,
        user_id: &UserId,
    ) -> Result<FlagMutation<MilestoneTemplate>>;

    /// Milestones currently referencing the template.
    async fn count_live_usages(&self, id: &TemplateId) -> Result<i64>;

    /// Applies a merge as one unit of work, serialized per normalized key.
    async fn apply_merge(&self, plan: &MergePlan) -> Result<MergeApplied>;

    async fn record_status(
        &self,
        application_id: &str,
        template_id: &TemplateId,
    ) -> Result<StatusHistoryEntry>;

    async fn status_history_for(&self, template_id: &TemplateId)
        -> Result<Vec<StatusHistoryEntry>>;
}

#[async_trait]
pub trait ApplicationTypeRepository: Send + Sync {
    async fn insert_or_increment(&self, new: &NewApplicationType)
        -> Result<(ApplicationType, bool)>;

    async fn get(&self, id: &ApplicationTypeId) -> Result<Option<ApplicationType>>;

    async fn list(&self, category: Option<&str>) -> Result<Vec<ApplicationType>>;

    async fn set_default(
        &self,
        id: &ApplicationTypeId,
        is_default: bool,
    ) -> Result<Option<ApplicationType>>;

    async fn add_flag(
        &self,
        id: &ApplicationTypeId,
        user_id: &UserId,
    ) -> Result<FlagMutation<ApplicationType>>;

    async fn remove_flag(
        &self,
        id: &ApplicationTypeId,
        user_id: &UserId,
    ) -> Result<FlagMutation<ApplicationType>>;

    /// Applications created with this type.
    async fn count_live_usages(&self, id: &ApplicationTypeId) -> Result<i64>;
}

#[async_trait]
pub trait MilestoneRepository: Send + Sync {
    /// Appends a milestone at the end of the scope's list.
    async fn append(
        &self,
        scope: &ProgramScope,
        template_id: &TemplateId,
        is_default: bool,
    ) -> Result<Milestone>;

    async fn get(&self, id: &MilestoneId) -> Result<Option<Milestone>>;

    /// Milestones of exactly this scope, by `order`.
    async fn list(&self, scope: &ProgramScope) -> Result<Vec<Milestone>>;

    /// Deletes the milestone and closes the gap in its scope's ordering.
    async fn delete_and_compact(&self, id: &MilestoneId) -> Result<bool>;

    /// Rewrites `order` to the position of each id in `ordered_ids`.
    async fn reorder(
        &self,
        scope: &ProgramScope,
        ordered_ids: &[MilestoneId],
    ) -> Result<Vec<Milestone>>;
}
