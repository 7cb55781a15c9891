// src/storage/memory.rs
//! In-process backend. One mutex guards all tables, which gives every trait
//! method the same all-or-nothing behaviour the PostgreSQL backend gets from
//! single statements and transactions.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::core::{
    ApplicationType, ApplicationTypeId, Category, Milestone, MilestoneId, MilestoneTemplate,
    NewApplicationType, NewMilestoneTemplate, ProgramScope, StatusHistoryEntry, TemplateId,
    UserId,
};
use crate::storage::{
    ApplicationTypeRepository, FlagMutation, MergeApplied, MergePlan, MilestoneRepository,
    MilestoneTemplateRepository,
};

#[derive(Default)]
struct MemoryState {
    templates: Vec<MilestoneTemplate>,
    application_types: Vec<ApplicationType>,
    application_usages: HashMap<ApplicationTypeId, i64>,
    milestones: Vec<Milestone>,
    status_history: Vec<StatusHistoryEntry>,
}

impl MemoryState {
    fn live_template_mut(&mut self, id: &TemplateId) -> Option<&mut MilestoneTemplate> {
        self.templates
            .iter_mut()
            .find(|t| &t.id == id && t.is_live())
    }

    /// Mirrors the `milestone_templates_live_key` unique index: another live
    /// row outside `except` already holds this key and display scope.
    fn live_key_taken(
        &self,
        except: &[&TemplateId],
        normalized_name: &str,
        program_type: &str,
        program_sub_type: Option<&str>,
    ) -> bool {
        self.templates.iter().any(|t| {
            t.is_live()
                && !except.contains(&&t.id)
                && t.normalized_name == normalized_name
                && t.program_type == program_type
                && t.program_sub_type.as_deref() == program_sub_type
        })
    }

    fn application_type_mut(&mut self, id: &ApplicationTypeId) -> Option<&mut ApplicationType> {
        self.application_types.iter_mut().find(|a| &a.id == id)
    }
}

fn same_scope(milestone: &Milestone, scope: &ProgramScope) -> bool {
    milestone.program_type == scope.program_type
        && milestone.program_sub_type == scope.program_sub_type
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a template row verbatim. Used for seeding fixtures and
    /// importing rows whose derived fields predate the current rules.
    pub async fn insert_template_row(&self, template: MilestoneTemplate) {
        self.state.lock().await.templates.push(template);
    }

    /// Records one application created with the given type.
    pub async fn register_application(&self, application_type_id: &ApplicationTypeId) {
        let mut state = self.state.lock().await;
        *state
            .application_usages
            .entry(application_type_id.clone())
            .or_insert(0) += 1;
    }

    /// All template rows, deprecated ones included.
    pub async fn all_templates(&self) -> Vec<MilestoneTemplate> {
        self.state.lock().await.templates.clone()
    }
}

#[async_trait]
impl MilestoneTemplateRepository for MemoryStore {
    async fn insert_or_increment(
        &self,
        new: &NewMilestoneTemplate,
    ) -> Result<(MilestoneTemplate, bool)> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(existing) = state.templates.iter_mut().find(|t| {
            t.is_live() && t.normalized_name == new.normalized_name && t.serves(&new.scope)
        }) {
            existing.use_count += 1;
            existing.updated_at = now;
            return Ok((existing.clone(), false));
        }

        let template = MilestoneTemplate {
            id: TemplateId::generate(),
            name: new.name.clone(),
            normalized_name: new.normalized_name.clone(),
            category: new.category,
            program_type: new.scope.program_type.clone(),
            program_sub_type: new.scope.program_sub_type.clone(),
            scopes: vec![new.scope.clone()],
            use_count: 1,
            is_approved: false,
            is_deprecated: false,
            canonical_id: None,
            flag_count: 0,
            flagged_by: BTreeSet::new(),
            created_by: new.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        state.templates.push(template.clone());
        Ok((template, true))
    }

    async fn get(&self, id: &TemplateId) -> Result<Option<MilestoneTemplate>> {
        let state = self.state.lock().await;
        Ok(state.templates.iter().find(|t| &t.id == id).cloned())
    }

    async fn list_live(&self, program_type: Option<&str>) -> Result<Vec<MilestoneTemplate>> {
        let state = self.state.lock().await;
        Ok(state
            .templates
            .iter()
            .filter(|t| t.is_live())
            .filter(|t| program_type.map_or(true, |p| t.serves_program_type(p)))
            .cloned()
            .collect())
    }

    async fn set_approval(
        &self,
        id: &TemplateId,
        approved: bool,
    ) -> Result<Option<MilestoneTemplate>> {
        let mut state = self.state.lock().await;
        Ok(state.live_template_mut(id).map(|t| {
            t.is_approved = approved;
            t.updated_at = Utc::now();
            t.clone()
        }))
    }

    async fn update_derived(
        &self,
        id: &TemplateId,
        normalized_name: &str,
        category: Category,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let taken = state
            .templates
            .iter()
            .find(|t| &t.id == id && t.is_live())
            .map(|t| {
                state.live_key_taken(
                    &[id],
                    normalized_name,
                    &t.program_type,
                    t.program_sub_type.as_deref(),
                )
            });
        if taken == Some(true) {
            bail!(
                "Template {} cannot take key '{}': another live template holds it in the same scope",
                id,
                normalized_name
            );
        }
        match state.live_template_mut(id) {
            Some(t) => {
                t.normalized_name = normalized_name.to_string();
                t.category = category;
                t.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("Template {} not found for derived-field update", id),
        }
    }

    async fn add_flag(
        &self,
        id: &TemplateId,
        user_id: &UserId,
    ) -> Result<FlagMutation<MilestoneTemplate>> {
        let mut state = self.state.lock().await;
        let Some(t) = state.live_template_mut(id) else {
            return Ok(FlagMutation::Missing);
        };
        if !t.flagged_by.insert(user_id.clone()) {
            return Ok(FlagMutation::Unchanged(t.clone()));
        }
        t.flag_count = t.flagged_by.len() as i32;
        t.updated_at = Utc::now();
        Ok(FlagMutation::Applied(t.clone()))
    }

    async fn remove_flag(
        &self,
        id: &TemplateId,
        user_id: &UserId,
    ) -> Result<FlagMutation<MilestoneTemplate>> {
        let mut state = self.state.lock().await;
        let Some(t) = state.live_template_mut(id) else {
            return Ok(FlagMutation::Missing);
        };
        if !t.flagged_by.remove(user_id) {
            return Ok(FlagMutation::Unchanged(t.clone()));
        }
        t.flag_count = t.flagged_by.len() as i32;
        t.updated_at = Utc::now();
        Ok(FlagMutation::Applied(t.clone()))
    }

    async fn count_live_usages(&self, id: &TemplateId) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .milestones
            .iter()
            .filter(|m| &m.template_id == id)
            .count() as i64)
    }

    async fn apply_merge(&self, plan: &MergePlan) -> Result<MergeApplied> {
        let mut state = self.state.lock().await;

        let all_live = plan.member_ids.iter().all(|id| {
            state
                .templates
                .iter()
                .any(|t| &t.id == id && t.is_live())
        });
        if !all_live {
            debug!("Merge plan for '{}' is stale", plan.normalized_key);
            return Ok(MergeApplied::Stale);
        }

        let members: Vec<&TemplateId> = plan.member_ids.iter().collect();
        if state.live_key_taken(
            &members,
            &plan.normalized_key,
            &plan.program_type,
            plan.program_sub_type.as_deref(),
        ) {
            bail!(
                "Canonical {} cannot take key '{}': another live template holds it in the same scope",
                plan.canonical_id,
                plan.normalized_key
            );
        }

        let losers: HashSet<&TemplateId> = plan.deprecated_ids.iter().collect();
        let now = Utc::now();

        for entry in state.status_history.iter_mut() {
            if losers.contains(&entry.template_id) {
                entry.template_id = plan.canonical_id.clone();
            }
        }
        for milestone in state.milestones.iter_mut() {
            if losers.contains(&milestone.template_id) {
                milestone.template_id = plan.canonical_id.clone();
            }
        }

        let mut canonical = None;
        for t in state.templates.iter_mut() {
            if losers.contains(&t.id) {
                t.is_deprecated = true;
                t.canonical_id = Some(plan.canonical_id.clone());
                t.updated_at = now;
            } else if t.id == plan.canonical_id {
                t.name = plan.canonical_name.clone();
                t.normalized_name = plan.normalized_key.clone();
                t.category = plan.category;
                t.use_count = plan.use_count;
                t.program_type = plan.program_type.clone();
                t.program_sub_type = plan.program_sub_type.clone();
                t.scopes = plan.scopes.clone();
                t.is_approved = true;
                t.updated_at = now;
                canonical = Some(t.clone());
            }
        }

        match canonical {
            Some(t) => Ok(MergeApplied::Merged(t)),
            None => bail!("Canonical template {} vanished during merge", plan.canonical_id),
        }
    }

    async fn record_status(
        &self,
        application_id: &str,
        template_id: &TemplateId,
    ) -> Result<StatusHistoryEntry> {
        let mut state = self.state.lock().await;
        let entry = StatusHistoryEntry {
            id: Uuid::new_v4().to_string(),
            application_id: application_id.to_string(),
            template_id: template_id.clone(),
            recorded_at: Utc::now(),
        };
        state.status_history.push(entry.clone());
        Ok(entry)
    }

    async fn status_history_for(
        &self,
        template_id: &TemplateId,
    ) -> Result<Vec<StatusHistoryEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .status_history
            .iter()
            .filter(|e| &e.template_id == template_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ApplicationTypeRepository for MemoryStore {
    async fn insert_or_increment(
        &self,
        new: &NewApplicationType,
    ) -> Result<(ApplicationType, bool)> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(existing) = state
            .application_types
            .iter_mut()
            .find(|a| a.normalized_name == new.normalized_name && a.category == new.category)
        {
            existing.use_count += 1;
            existing.updated_at = now;
            return Ok((existing.clone(), false));
        }

        let application_type = ApplicationType {
            id: ApplicationTypeId::generate(),
            name: new.name.clone(),
            normalized_name: new.normalized_name.clone(),
            category: new.category.clone(),
            use_count: 1,
            is_default: false,
            flag_count: 0,
            flagged_by: BTreeSet::new(),
            created_by: new.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        state.application_types.push(application_type.clone());
        Ok((application_type, true))
    }

    async fn get(&self, id: &ApplicationTypeId) -> Result<Option<ApplicationType>> {
        let state = self.state.lock().await;
        Ok(state.application_types.iter().find(|a| &a.id == id).cloned())
    }

    async fn list(&self, category: Option<&str>) -> Result<Vec<ApplicationType>> {
        let state = self.state.lock().await;
        Ok(state
            .application_types
            .iter()
            .filter(|a| category.map_or(true, |c| a.category == c))
            .cloned()
            .collect())
    }

    async fn set_default(
        &self,
        id: &ApplicationTypeId,
        is_default: bool,
    ) -> Result<Option<ApplicationType>> {
        let mut state = self.state.lock().await;
        Ok(state.application_type_mut(id).map(|a| {
            a.is_default = is_default;
            a.updated_at = Utc::now();
            a.clone()
        }))
    }

    async fn add_flag(
        &self,
        id: &ApplicationTypeId,
        user_id: &UserId,
    ) -> Result<FlagMutation<ApplicationType>> {
        let mut state = self.state.lock().await;
        let Some(a) = state.application_type_mut(id) else {
            return Ok(FlagMutation::Missing);
        };
        if !a.flagged_by.insert(user_id.clone()) {
            return Ok(FlagMutation::Unchanged(a.clone()));
        }
        a.flag_count = a.flagged_by.len() as i32;
        a.updated_at = Utc::now();
        Ok(FlagMutation::Applied(a.clone()))
    }

    async fn remove_flag(
        &self,
        id: &ApplicationTypeId,
        user_id: &UserId,
    ) -> Result<FlagMutation<ApplicationType>> {
        let mut state = self.state.lock().await;
        let Some(a) = state.application_type_mut(id) else {
            return Ok(FlagMutation::Missing);
        };
        if !a.flagged_by.remove(user_id) {
            return Ok(FlagMutation::Unchanged(a.clone()));
        }
        a.flag_count = a.flagged_by.len() as i32;
        a.updated_at = Utc::now();
        Ok(FlagMutation::Applied(a.clone()))
    }

    async fn count_live_usages(&self, id: &ApplicationTypeId) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.application_usages.get(id).copied().unwrap_or(0))
    }
}

#[async_trait]
impl MilestoneRepository for MemoryStore {
    async fn append(
        &self,
        scope: &ProgramScope,
        template_id: &TemplateId,
        is_default: bool,
    ) -> Result<Milestone> {
        let mut state = self.state.lock().await;
        let next_order = state
            .milestones
            .iter()
            .filter(|m| same_scope(m, scope))
            .map(|m| m.order + 1)
            .max()
            .unwrap_or(0);

        let milestone = Milestone {
            id: MilestoneId::generate(),
            template_id: template_id.clone(),
            program_type: scope.program_type.clone(),
            program_sub_type: scope.program_sub_type.clone(),
            order: next_order,
            is_default,
        };
        state.milestones.push(milestone.clone());
        Ok(milestone)
    }

    async fn get(&self, id: &MilestoneId) -> Result<Option<Milestone>> {
        let state = self.state.lock().await;
        Ok(state.milestones.iter().find(|m| &m.id == id).cloned())
    }

    async fn list(&self, scope: &ProgramScope) -> Result<Vec<Milestone>> {
        let state = self.state.lock().await;
        let mut milestones: Vec<Milestone> = state
            .milestones
            .iter()
            .filter(|m| same_scope(m, scope))
            .cloned()
            .collect();
        milestones.sort_by_key(|m| m.order);
        Ok(milestones)
    }

    async fn delete_and_compact(&self, id: &MilestoneId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(position) = state.milestones.iter().position(|m| &m.id == id) else {
            return Ok(false);
        };
        let removed = state.milestones.remove(position);
        let scope = ProgramScope {
            program_type: removed.program_type.clone(),
            program_sub_type: removed.program_sub_type.clone(),
        };
        for m in state.milestones.iter_mut() {
            if same_scope(m, &scope) && m.order > removed.order {
                m.order -= 1;
            }
        }
        Ok(true)
    }

    async fn reorder(
        &self,
        scope: &ProgramScope,
        ordered_ids: &[MilestoneId],
    ) -> Result<Vec<Milestone>> {
        let mut state = self.state.lock().await;
        let current: HashSet<&MilestoneId> = state
            .milestones
            .iter()
            .filter(|m| same_scope(m, scope))
            .map(|m| &m.id)
            .collect();
        let requested: HashSet<&MilestoneId> = ordered_ids.iter().collect();
        if current != requested || requested.len() != ordered_ids.len() {
            bail!(
                "Reorder ids do not match the milestones of {}",
                scope.program_type
            );
        }

        let positions: HashMap<&MilestoneId, i32> = ordered_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i as i32))
            .collect();
        let mut reordered = Vec::with_capacity(ordered_ids.len());
        for m in state.milestones.iter_mut() {
            if let Some(order) = positions.get(&m.id) {
                m.order = *order;
                reordered.push(m.clone());
            }
        }
        reordered.sort_by_key(|m| m.order);
        Ok(reordered)
    }
}
