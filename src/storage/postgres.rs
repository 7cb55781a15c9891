// src/storage/postgres.rs
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info, warn};
use postgres_types::{accepts, to_sql_checked, FromSql, IsNull, ToSql, Type};
use std::collections::{BTreeSet, HashSet};
use std::error::Error;
use tokio_postgres::{GenericClient, Row};
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
use crate::utils::db_connect::PgPool;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

const TEMPLATE_COLUMNS: &str = "
    t.id, t.name, t.normalized_name, t.category, t.program_type, t.program_sub_type,
    t.use_count, t.is_approved, t.is_deprecated, t.canonical_id, t.flag_count,
    t.created_by, t.created_at, t.updated_at,
    ARRAY(SELECT f.user_id FROM public.template_flags f
          WHERE f.template_id = t.id ORDER BY f.user_id) AS flagged_by,
    ARRAY(SELECT s.program_type FROM public.template_scopes s
          WHERE s.template_id = t.id ORDER BY s.scope_order) AS scope_types,
    ARRAY(SELECT s.program_sub_type FROM public.template_scopes s
          WHERE s.template_id = t.id ORDER BY s.scope_order) AS scope_sub_types";

const APPLICATION_TYPE_COLUMNS: &str = "
    a.id, a.name, a.normalized_name, a.category, a.use_count, a.is_default,
    a.flag_count, a.created_by, a.created_at, a.updated_at,
    ARRAY(SELECT f.user_id FROM public.application_type_flags f
          WHERE f.application_type_id = a.id ORDER BY f.user_id) AS flagged_by";

const MILESTONE_COLUMNS: &str =
    "id, template_id, program_type, program_sub_type, sort_order, is_default";

// Categories live in plain TEXT columns as their snake_case tag.
impl ToSql for Category {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.as_str().to_sql(ty, out)
    }

    accepts!(TEXT, VARCHAR);
    to_sql_checked!();
}

impl<'a> FromSql<'a> for Category {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        let tag = <&str as FromSql>::from_sql(ty, raw)?;
        Ok(Category::from_tag(tag))
    }

    accepts!(TEXT, VARCHAR);
}

fn sub_type_to_db(sub_type: &Option<String>) -> &str {
    sub_type.as_deref().unwrap_or("")
}

fn sub_type_from_db(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn flagged_by_from_db(row: &Row) -> BTreeSet<UserId> {
    row.get::<_, Vec<String>>("flagged_by")
        .into_iter()
        .map(UserId)
        .collect()
}

/// Served scopes; a row without scope rows serves its display scope.
fn scopes_from_row(
    row: &Row,
    program_type: &str,
    program_sub_type: &Option<String>,
) -> Vec<ProgramScope> {
    let types: Vec<String> = row.get("scope_types");
    let sub_types: Vec<String> = row.get("scope_sub_types");
    if types.is_empty() {
        return vec![ProgramScope {
            program_type: program_type.to_string(),
            program_sub_type: program_sub_type.clone(),
        }];
    }
    types
        .into_iter()
        .zip(sub_types)
        .map(|(program_type, sub_type)| ProgramScope {
            program_type,
            program_sub_type: sub_type_from_db(sub_type),
        })
        .collect()
}

fn template_from_row(row: &Row) -> MilestoneTemplate {
    let program_type: String = row.get("program_type");
    let program_sub_type = sub_type_from_db(row.get("program_sub_type"));
    let scopes = scopes_from_row(row, &program_type, &program_sub_type);
    MilestoneTemplate {
        id: TemplateId(row.get("id")),
        name: row.get("name"),
        normalized_name: row.get("normalized_name"),
        category: row.get("category"),
        program_type,
        program_sub_type,
        scopes,
        use_count: row.get("use_count"),
        is_approved: row.get("is_approved"),
        is_deprecated: row.get("is_deprecated"),
        canonical_id: row.get::<_, Option<String>>("canonical_id").map(TemplateId),
        flag_count: row.get("flag_count"),
        flagged_by: flagged_by_from_db(row),
        created_by: row.get::<_, Option<String>>("created_by").map(UserId),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn application_type_from_row(row: &Row) -> ApplicationType {
    ApplicationType {
        id: ApplicationTypeId(row.get("id")),
        name: row.get("name"),
        normalized_name: row.get("normalized_name"),
        category: row.get("category"),
        use_count: row.get("use_count"),
        is_default: row.get("is_default"),
        flag_count: row.get("flag_count"),
        flagged_by: flagged_by_from_db(row),
        created_by: row.get::<_, Option<String>>("created_by").map(UserId),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn milestone_from_row(row: &Row) -> Milestone {
    Milestone {
        id: MilestoneId(row.get("id")),
        template_id: TemplateId(row.get("template_id")),
        program_type: row.get("program_type"),
        program_sub_type: sub_type_from_db(row.get("program_sub_type")),
        order: row.get("sort_order"),
        is_default: row.get("is_default"),
    }
}

fn status_entry_from_row(row: &Row) -> StatusHistoryEntry {
    StatusHistoryEntry {
        id: row.get("id"),
        application_id: row.get("application_id"),
        template_id: TemplateId(row.get("template_id")),
        recorded_at: row.get("recorded_at"),
    }
}

async fn fetch_template(
    conn: &impl GenericClient,
    id: &str,
) -> Result<Option<MilestoneTemplate>> {
    let query = format!(
        "SELECT {} FROM public.milestone_templates t WHERE t.id = $1",
        TEMPLATE_COLUMNS
    );
    let row = conn
        .query_opt(query.as_str(), &[&id])
        .await
        .context(format!("Failed to fetch milestone template {}", id))?;
    Ok(row.as_ref().map(template_from_row))
}

async fn fetch_application_type(
    conn: &impl GenericClient,
    id: &str,
) -> Result<Option<ApplicationType>> {
    let query = format!(
        "SELECT {} FROM public.application_types a WHERE a.id = $1",
        APPLICATION_TYPE_COLUMNS
    );
    let row = conn
        .query_opt(query.as_str(), &[&id])
        .await
        .context(format!("Failed to fetch application type {}", id))?;
    Ok(row.as_ref().map(application_type_from_row))
}

/// Repository backed by the `public.*` tables in `sql/schema.sql`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates any missing tables and indexes.
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for ensure_schema")?;
        conn.batch_execute(SCHEMA_SQL)
            .await
            .context("Failed to apply template schema")?;
        info!("Template schema is in place");
        Ok(())
    }

    async fn change_template_flag(
        &self,
        id: &TemplateId,
        user_id: &UserId,
        add: bool,
    ) -> Result<FlagMutation<MilestoneTemplate>> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for template flag change")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start transaction for template flag change")?;

        let locked = tx
            .query_opt(
                "SELECT id FROM public.milestone_templates
                 WHERE id = $1 AND NOT is_deprecated FOR UPDATE",
                &[&id.as_str()],
            )
            .await
            .context("Failed to lock milestone template")?;
        if locked.is_none() {
            tx.rollback().await.ok();
            return Ok(FlagMutation::Missing);
        }

        let changed = if add {
            tx.execute(
                "INSERT INTO public.template_flags (template_id, user_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&id.as_str(), &user_id.as_str()],
            )
            .await
            .context("Failed to insert template flag")?
        } else {
            tx.execute(
                "DELETE FROM public.template_flags WHERE template_id = $1 AND user_id = $2",
                &[&id.as_str(), &user_id.as_str()],
            )
            .await
            .context("Failed to delete template flag")?
        };

        if changed > 0 {
            tx.execute(
                "UPDATE public.milestone_templates
                 SET flag_count = (SELECT COUNT(*)::int FROM public.template_flags
                                   WHERE template_id = $1),
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1",
                &[&id.as_str()],
            )
            .await
            .context("Failed to refresh template flag count")?;
        }

        let template = fetch_template(&tx, id.as_str())
            .await?
            .context("Locked template disappeared inside its transaction")?;
        tx.commit()
            .await
            .context("Failed to commit template flag change")?;

        Ok(if changed > 0 {
            FlagMutation::Applied(template)
        } else {
            FlagMutation::Unchanged(template)
        })
    }

    async fn change_application_type_flag(
        &self,
        id: &ApplicationTypeId,
        user_id: &UserId,
        add: bool,
    ) -> Result<FlagMutation<ApplicationType>> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for application type flag change")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start transaction for application type flag change")?;

        let locked = tx
            .query_opt(
                "SELECT id FROM public.application_types WHERE id = $1 FOR UPDATE",
                &[&id.as_str()],
            )
            .await
            .context("Failed to lock application type")?;
        if locked.is_none() {
            tx.rollback().await.ok();
            return Ok(FlagMutation::Missing);
        }

        let changed = if add {
            tx.execute(
                "INSERT INTO public.application_type_flags (application_type_id, user_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&id.as_str(), &user_id.as_str()],
            )
            .await
            .context("Failed to insert application type flag")?
        } else {
            tx.execute(
                "DELETE FROM public.application_type_flags
                 WHERE application_type_id = $1 AND user_id = $2",
                &[&id.as_str(), &user_id.as_str()],
            )
            .await
            .context("Failed to delete application type flag")?
        };

        if changed > 0 {
            tx.execute(
                "UPDATE public.application_types
                 SET flag_count = (SELECT COUNT(*)::int FROM public.application_type_flags
                                   WHERE application_type_id = $1),
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1",
                &[&id.as_str()],
            )
            .await
            .context("Failed to refresh application type flag count")?;
        }

        let application_type = fetch_application_type(&tx, id.as_str())
            .await?
            .context("Locked application type disappeared inside its transaction")?;
        tx.commit()
            .await
            .context("Failed to commit application type flag change")?;

        Ok(if changed > 0 {
            FlagMutation::Applied(application_type)
        } else {
            FlagMutation::Unchanged(application_type)
        })
    }
}

#[async_trait]
impl MilestoneTemplateRepository for PgStore {
    async fn insert_or_increment(
        &self,
        new: &NewMilestoneTemplate,
    ) -> Result<(MilestoneTemplate, bool)> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for insert_or_increment")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start insert_or_increment transaction")?;
        let sub_type = sub_type_to_db(&new.scope.program_sub_type);

        // Merged canonicals serve scopes the unique key below cannot see;
        // bump those first.
        let covered = tx
            .query_opt(
                "UPDATE public.milestone_templates
                 SET use_count = use_count + 1, updated_at = CURRENT_TIMESTAMP
                 WHERE id = (
                     SELECT t.id FROM public.milestone_templates t
                     JOIN public.template_scopes s ON s.template_id = t.id
                     WHERE NOT t.is_deprecated
                       AND t.normalized_name = $1
                       AND s.program_type = $2
                       AND s.program_sub_type = $3
                     ORDER BY t.created_at, t.id
                     LIMIT 1
                     FOR UPDATE OF t)
                 RETURNING id",
                &[&new.normalized_name, &new.scope.program_type, &sub_type],
            )
            .await
            .context("Failed to increment covering milestone template")?;

        let (id, created) = match covered {
            Some(row) => (row.get::<_, String>("id"), false),
            None => {
                let proposed_id = TemplateId::generate();
                let created_by = new.created_by.as_ref().map(|u| u.as_str());
                let row = tx
                    .query_one(
                        "INSERT INTO public.milestone_templates
                            (id, name, normalized_name, category, program_type, program_sub_type,
                             use_count, is_approved, is_deprecated, flag_count, created_by,
                             created_at, updated_at)
                         VALUES ($1, $2, $3, $4, $5, $6, 1, FALSE, FALSE, 0, $7,
                                 CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
                         ON CONFLICT (normalized_name, program_type, program_sub_type)
                             WHERE NOT is_deprecated
                         DO UPDATE SET use_count = public.milestone_templates.use_count + 1,
                                       updated_at = CURRENT_TIMESTAMP
                         RETURNING id, (xmax = 0) AS inserted",
                        &[
                            &proposed_id.as_str(),
                            &new.name,
                            &new.normalized_name,
                            &new.category,
                            &new.scope.program_type,
                            &sub_type,
                            &created_by,
                        ],
                    )
                    .await
                    .context("Failed to upsert milestone template")?;
                let id: String = row.get("id");
                tx.execute(
                    "INSERT INTO public.template_scopes
                        (template_id, program_type, program_sub_type, scope_order)
                     VALUES ($1, $2, $3, 0)
                     ON CONFLICT DO NOTHING",
                    &[&id, &new.scope.program_type, &sub_type],
                )
                .await
                .context("Failed to record milestone template scope")?;
                (id, row.get::<_, bool>("inserted"))
            }
        };

        let template = fetch_template(&tx, &id)
            .await?
            .context(format!("Upserted milestone template {} not readable", id))?;
        tx.commit()
            .await
            .context("Failed to commit insert_or_increment")?;
        debug!(
            "insert_or_increment '{}' -> {} (created: {}, use_count: {})",
            new.normalized_name, template.id, created, template.use_count
        );
        Ok((template, created))
    }

    async fn get(&self, id: &TemplateId) -> Result<Option<MilestoneTemplate>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for template get")?;
        fetch_template(&*conn, id.as_str()).await
    }

    async fn list_live(&self, program_type: Option<&str>) -> Result<Vec<MilestoneTemplate>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for list_live")?;
        let query = format!(
            "SELECT {} FROM public.milestone_templates t
             WHERE NOT t.is_deprecated
               AND ($1::text IS NULL OR EXISTS (
                   SELECT 1 FROM public.template_scopes s
                   WHERE s.template_id = t.id AND s.program_type = $1))
             ORDER BY t.created_at, t.id",
            TEMPLATE_COLUMNS
        );
        let rows = conn
            .query(query.as_str(), &[&program_type])
            .await
            .context("Failed to list live milestone templates")?;
        Ok(rows.iter().map(template_from_row).collect())
    }

    async fn set_approval(
        &self,
        id: &TemplateId,
        approved: bool,
    ) -> Result<Option<MilestoneTemplate>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for set_approval")?;
        let updated = conn
            .execute(
                "UPDATE public.milestone_templates
                 SET is_approved = $2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1 AND NOT is_deprecated",
                &[&id.as_str(), &approved],
            )
            .await
            .context(format!("Failed to set approval on template {}", id))?;
        if updated == 0 {
            return Ok(None);
        }
        fetch_template(&*conn, id.as_str()).await
    }

    async fn update_derived(
        &self,
        id: &TemplateId,
        normalized_name: &str,
        category: Category,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for update_derived")?;
        let updated = conn
            .execute(
                "UPDATE public.milestone_templates
                 SET normalized_name = $2, category = $3, updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1 AND NOT is_deprecated",
                &[&id.as_str(), &normalized_name, &category],
            )
            .await
            .context(format!("Failed to refresh derived fields of template {}", id))?;
        if updated == 0 {
            bail!("Template {} not found for derived-field update", id);
        }
        Ok(())
    }

    async fn add_flag(
        &self,
        id: &TemplateId,
        user_id: &UserId,
    ) -> Result<FlagMutation<MilestoneTemplate>> {
        self.change_template_flag(id, user_id, true).await
    }

    async fn remove_flag(
        &self,
        id: &TemplateId,
        user_id: &UserId,
    ) -> Result<FlagMutation<MilestoneTemplate>> {
        self.change_template_flag(id, user_id, false).await
    }

    async fn count_live_usages(&self, id: &TemplateId) -> Result<i64> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for count_live_usages")?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM public.milestones WHERE template_id = $1",
                &[&id.as_str()],
            )
            .await
            .context(format!("Failed to count usages of template {}", id))?;
        Ok(row.get(0))
    }

    async fn apply_merge(&self, plan: &MergePlan) -> Result<MergeApplied> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for apply_merge")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start merge transaction")?;

        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1)::bigint)",
            &[&plan.normalized_key],
        )
        .await
        .context("Failed to take merge lock")?;

        let member_ids: Vec<&str> = plan.member_ids.iter().map(|id| id.as_str()).collect();
        let deprecated_ids: Vec<&str> = plan.deprecated_ids.iter().map(|id| id.as_str()).collect();

        let live_rows = tx
            .query(
                "SELECT id FROM public.milestone_templates
                 WHERE id = ANY($1) AND NOT is_deprecated
                 FOR UPDATE",
                &[&member_ids],
            )
            .await
            .context("Failed to lock merge members")?;
        let live: HashSet<String> = live_rows.iter().map(|r| r.get("id")).collect();
        if member_ids.iter().any(|id| !live.contains(*id)) {
            tx.rollback().await.ok();
            warn!(
                "Merge plan for '{}' is stale ({} of {} members still live)",
                plan.normalized_key,
                live.len(),
                member_ids.len()
            );
            return Ok(MergeApplied::Stale);
        }

        let canonical_id = plan.canonical_id.as_str();
        let repointed_history = tx
            .execute(
                "UPDATE public.status_history SET template_id = $1 WHERE template_id = ANY($2)",
                &[&canonical_id, &deprecated_ids],
            )
            .await
            .context("Failed to repoint status history")?;
        let repointed_milestones = tx
            .execute(
                "UPDATE public.milestones SET template_id = $1 WHERE template_id = ANY($2)",
                &[&canonical_id, &deprecated_ids],
            )
            .await
            .context("Failed to repoint milestones")?;

        // Losers leave the live unique index before the canonical widens its scope.
        tx.execute(
            "UPDATE public.milestone_templates
             SET is_deprecated = TRUE, canonical_id = $1, updated_at = CURRENT_TIMESTAMP
             WHERE id = ANY($2)",
            &[&canonical_id, &deprecated_ids],
        )
        .await
        .context("Failed to deprecate merged templates")?;

        tx.execute(
            "UPDATE public.milestone_templates
             SET name = $2, normalized_name = $3, category = $4, use_count = $5,
                 program_type = $6, program_sub_type = $7, is_approved = TRUE,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
            &[
                &canonical_id,
                &plan.canonical_name,
                &plan.normalized_key,
                &plan.category,
                &plan.use_count,
                &plan.program_type,
                &sub_type_to_db(&plan.program_sub_type),
            ],
        )
        .await
        .context("Failed to update canonical template")?;

        let scope_types: Vec<&str> = plan
            .scopes
            .iter()
            .map(|scope| scope.program_type.as_str())
            .collect();
        let scope_sub_types: Vec<&str> = plan
            .scopes
            .iter()
            .map(|scope| sub_type_to_db(&scope.program_sub_type))
            .collect();
        tx.execute(
            "DELETE FROM public.template_scopes WHERE template_id = $1",
            &[&canonical_id],
        )
        .await
        .context("Failed to clear canonical template scopes")?;
        tx.execute(
            "INSERT INTO public.template_scopes
                (template_id, program_type, program_sub_type, scope_order)
             SELECT $1, v.program_type, v.program_sub_type, (v.ord - 1)::int
             FROM unnest($2::text[], $3::text[]) WITH ORDINALITY
                  AS v(program_type, program_sub_type, ord)",
            &[&canonical_id, &scope_types, &scope_sub_types],
        )
        .await
        .context("Failed to write canonical template scopes")?;

        let canonical = fetch_template(&tx, canonical_id)
            .await?
            .context("Canonical template vanished during merge")?;
        tx.commit().await.context("Failed to commit merge")?;

        debug!(
            "Merged '{}': {} history rows and {} milestones repointed to {}",
            plan.normalized_key, repointed_history, repointed_milestones, canonical_id
        );
        Ok(MergeApplied::Merged(canonical))
    }

    async fn record_status(
        &self,
        application_id: &str,
        template_id: &TemplateId,
    ) -> Result<StatusHistoryEntry> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for record_status")?;
        let id = Uuid::new_v4().to_string();
        let row = conn
            .query_one(
                "INSERT INTO public.status_history (id, application_id, template_id, recorded_at)
                 VALUES ($1, $2, $3, CURRENT_TIMESTAMP)
                 RETURNING id, application_id, template_id, recorded_at",
                &[&id, &application_id, &template_id.as_str()],
            )
            .await
            .context("Failed to insert status history entry")?;
        Ok(status_entry_from_row(&row))
    }

    async fn status_history_for(
        &self,
        template_id: &TemplateId,
    ) -> Result<Vec<StatusHistoryEntry>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for status_history_for")?;
        let rows = conn
            .query(
                "SELECT id, application_id, template_id, recorded_at
                 FROM public.status_history WHERE template_id = $1 ORDER BY recorded_at",
                &[&template_id.as_str()],
            )
            .await
            .context("Failed to query status history")?;
        Ok(rows.iter().map(status_entry_from_row).collect())
    }
}

#[async_trait]
impl ApplicationTypeRepository for PgStore {
    async fn insert_or_increment(
        &self,
        new: &NewApplicationType,
    ) -> Result<(ApplicationType, bool)> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for application type upsert")?;
        let proposed_id = ApplicationTypeId::generate();
        let created_by = new.created_by.as_ref().map(|u| u.as_str());
        let row = conn
            .query_one(
                "INSERT INTO public.application_types
                    (id, name, normalized_name, category, use_count, is_default, flag_count,
                     created_by, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, 1, FALSE, 0, $5, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
                 ON CONFLICT (normalized_name, category)
                 DO UPDATE SET use_count = public.application_types.use_count + 1,
                               updated_at = CURRENT_TIMESTAMP
                 RETURNING id, (xmax = 0) AS inserted",
                &[
                    &proposed_id.as_str(),
                    &new.name,
                    &new.normalized_name,
                    &new.category,
                    &created_by,
                ],
            )
            .await
            .context("Failed to upsert application type")?;
        let id: String = row.get("id");
        let created: bool = row.get("inserted");
        let application_type = fetch_application_type(&*conn, &id)
            .await?
            .context(format!("Upserted application type {} not readable", id))?;
        Ok((application_type, created))
    }

    async fn get(&self, id: &ApplicationTypeId) -> Result<Option<ApplicationType>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for application type get")?;
        fetch_application_type(&*conn, id.as_str()).await
    }

    async fn list(&self, category: Option<&str>) -> Result<Vec<ApplicationType>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for application type list")?;
        let query = format!(
            "SELECT {} FROM public.application_types a
             WHERE ($1::text IS NULL OR a.category = $1)
             ORDER BY a.created_at, a.id",
            APPLICATION_TYPE_COLUMNS
        );
        let rows = conn
            .query(query.as_str(), &[&category])
            .await
            .context("Failed to list application types")?;
        Ok(rows.iter().map(application_type_from_row).collect())
    }

    async fn set_default(
        &self,
        id: &ApplicationTypeId,
        is_default: bool,
    ) -> Result<Option<ApplicationType>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for set_default")?;
        let updated = conn
            .execute(
                "UPDATE public.application_types
                 SET is_default = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
                &[&id.as_str(), &is_default],
            )
            .await
            .context(format!("Failed to set default flag on application type {}", id))?;
        if updated == 0 {
            return Ok(None);
        }
        fetch_application_type(&*conn, id.as_str()).await
    }

    async fn add_flag(
        &self,
        id: &ApplicationTypeId,
        user_id: &UserId,
    ) -> Result<FlagMutation<ApplicationType>> {
        self.change_application_type_flag(id, user_id, true).await
    }

    async fn remove_flag(
        &self,
        id: &ApplicationTypeId,
        user_id: &UserId,
    ) -> Result<FlagMutation<ApplicationType>> {
        self.change_application_type_flag(id, user_id, false).await
    }

    async fn count_live_usages(&self, id: &ApplicationTypeId) -> Result<i64> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for application usage count")?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM public.applications WHERE application_type_id = $1",
                &[&id.as_str()],
            )
            .await
            .context(format!("Failed to count applications of type {}", id))?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl MilestoneRepository for PgStore {
    async fn append(
        &self,
        scope: &ProgramScope,
        template_id: &TemplateId,
        is_default: bool,
    ) -> Result<Milestone> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for milestone append")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start milestone append transaction")?;
        let sub_type = sub_type_to_db(&scope.program_sub_type);
        let scope_key = format!("milestones|{}|{}", scope.program_type, sub_type);

        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1)::bigint)",
            &[&scope_key],
        )
        .await
        .context("Failed to take milestone scope lock")?;

        let id = MilestoneId::generate();
        let query = format!(
            "INSERT INTO public.milestones
                (id, template_id, program_type, program_sub_type, sort_order, is_default)
             SELECT $1, $2, $3, $4, COALESCE(MAX(sort_order) + 1, 0), $5
             FROM public.milestones WHERE program_type = $3 AND program_sub_type = $4
             RETURNING {}",
            MILESTONE_COLUMNS
        );
        let row = tx
            .query_one(
                query.as_str(),
                &[
                    &id.as_str(),
                    &template_id.as_str(),
                    &scope.program_type,
                    &sub_type,
                    &is_default,
                ],
            )
            .await
            .context("Failed to insert milestone")?;
        tx.commit()
            .await
            .context("Failed to commit milestone append")?;
        Ok(milestone_from_row(&row))
    }

    async fn get(&self, id: &MilestoneId) -> Result<Option<Milestone>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for milestone get")?;
        let query = format!("SELECT {} FROM public.milestones WHERE id = $1", MILESTONE_COLUMNS);
        let row = conn
            .query_opt(query.as_str(), &[&id.as_str()])
            .await
            .context(format!("Failed to fetch milestone {}", id))?;
        Ok(row.as_ref().map(milestone_from_row))
    }

    async fn list(&self, scope: &ProgramScope) -> Result<Vec<Milestone>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for milestone list")?;
        let query = format!(
            "SELECT {} FROM public.milestones
             WHERE program_type = $1 AND program_sub_type = $2
             ORDER BY sort_order",
            MILESTONE_COLUMNS
        );
        let rows = conn
            .query(
                query.as_str(),
                &[&scope.program_type, &sub_type_to_db(&scope.program_sub_type)],
            )
            .await
            .context("Failed to list milestones")?;
        Ok(rows.iter().map(milestone_from_row).collect())
    }

    async fn delete_and_compact(&self, id: &MilestoneId) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for milestone delete")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start milestone delete transaction")?;

        let deleted = tx
            .query_opt(
                "DELETE FROM public.milestones WHERE id = $1
                 RETURNING program_type, program_sub_type, sort_order",
                &[&id.as_str()],
            )
            .await
            .context(format!("Failed to delete milestone {}", id))?;
        let Some(row) = deleted else {
            tx.rollback().await.ok();
            return Ok(false);
        };

        let program_type: String = row.get("program_type");
        let program_sub_type: String = row.get("program_sub_type");
        let sort_order: i32 = row.get("sort_order");
        tx.execute(
            "UPDATE public.milestones SET sort_order = sort_order - 1
             WHERE program_type = $1 AND program_sub_type = $2 AND sort_order > $3",
            &[&program_type, &program_sub_type, &sort_order],
        )
        .await
        .context("Failed to compact milestone order")?;
        tx.commit()
            .await
            .context("Failed to commit milestone delete")?;
        Ok(true)
    }

    async fn reorder(
        &self,
        scope: &ProgramScope,
        ordered_ids: &[MilestoneId],
    ) -> Result<Vec<Milestone>> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for milestone reorder")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start milestone reorder transaction")?;
        let sub_type = sub_type_to_db(&scope.program_sub_type);

        let rows = tx
            .query(
                "SELECT id FROM public.milestones
                 WHERE program_type = $1 AND program_sub_type = $2 FOR UPDATE",
                &[&scope.program_type, &sub_type],
            )
            .await
            .context("Failed to lock milestones for reorder")?;
        let current: HashSet<String> = rows.iter().map(|r| r.get("id")).collect();
        let requested: HashSet<String> = ordered_ids.iter().map(|id| id.0.clone()).collect();
        if current != requested || requested.len() != ordered_ids.len() {
            tx.rollback().await.ok();
            bail!(
                "Reorder ids do not match the milestones of {}",
                scope.program_type
            );
        }

        let ids: Vec<&str> = ordered_ids.iter().map(|id| id.as_str()).collect();
        tx.execute(
            "UPDATE public.milestones m SET sort_order = (v.ord - 1)::int
             FROM unnest($1::text[]) WITH ORDINALITY AS v(id, ord)
             WHERE m.id = v.id",
            &[&ids],
        )
        .await
        .context("Failed to rewrite milestone order")?;

        let query = format!(
            "SELECT {} FROM public.milestones
             WHERE program_type = $1 AND program_sub_type = $2
             ORDER BY sort_order",
            MILESTONE_COLUMNS
        );
        let reordered = tx
            .query(query.as_str(), &[&scope.program_type, &sub_type])
            .await
            .context("Failed to read reordered milestones")?;
        tx.commit()
            .await
            .context("Failed to commit milestone reorder")?;
        Ok(reordered.iter().map(milestone_from_row).collect())
    }
}
