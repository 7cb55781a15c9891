// src/models/core.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationTypeId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MilestoneId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

macro_rules! impl_string_id {
    ($($id:ident),+) => {
        $(
            impl $id {
                pub fn generate() -> Self {
                    Self(Uuid::new_v4().to_string())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $id {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $id {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }
        )+
    };
}

impl_string_id!(TemplateId, ApplicationTypeId, MilestoneId, UserId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Application,
    Biometrics,
    Medical,
    Document,
    Decision,
    BackgroundCheck,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Application => "application",
            Category::Biometrics => "biometrics",
            Category::Medical => "medical",
            Category::Document => "document",
            Category::Decision => "decision",
            Category::BackgroundCheck => "background_check",
            Category::Other => "other",
        }
    }

    pub fn from_tag(s: &str) -> Self {
        match s {
            "application" => Category::Application,
            "biometrics" => Category::Biometrics,
            "medical" => Category::Medical,
            "document" => Category::Document,
            "decision" => Category::Decision,
            "background_check" => Category::BackgroundCheck,
            _ => Category::Other,
        }
    }
}

/// Separator of the joined program type / sub-type display columns. Scope
/// values themselves may not contain it.
pub const SCOPE_LIST_SEPARATOR: char = ',';

/// The (program type, program sub-type) pair templates and milestones are
/// scoped by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramScope {
    pub program_type: String,
    pub program_sub_type: Option<String>,
}

impl ProgramScope {
    pub fn new(program_type: &str, program_sub_type: Option<&str>) -> Self {
        Self {
            program_type: program_type.trim().to_string(),
            program_sub_type: program_sub_type
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    pub fn contains_list_separator(&self) -> bool {
        self.program_type.contains(SCOPE_LIST_SEPARATOR)
            || self
                .program_sub_type
                .as_deref()
                .map_or(false, |s| s.contains(SCOPE_LIST_SEPARATOR))
    }

    /// Listing matching: a template serving `served` applies to this scope
    /// when the program types agree and `served` is program-wide or has the
    /// same sub-type.
    pub fn covers(&self, served: &ProgramScope) -> bool {
        if self.program_type != served.program_type {
            return false;
        }
        match (&self.program_sub_type, &served.program_sub_type) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(wanted), Some(stored)) => wanted == stored,
        }
    }
}

/// Joins the distinct program types and sub-types of `scopes`, first-seen
/// order, into the display columns of a template.
pub fn join_scopes(scopes: &[ProgramScope]) -> (String, Option<String>) {
    let mut program_types: Vec<&str> = Vec::new();
    let mut sub_types: Vec<&str> = Vec::new();
    for scope in scopes {
        if !program_types.contains(&scope.program_type.as_str()) {
            program_types.push(&scope.program_type);
        }
        if let Some(sub) = scope.program_sub_type.as_deref() {
            if !sub_types.contains(&sub) {
                sub_types.push(sub);
            }
        }
    }
    let separator = SCOPE_LIST_SEPARATOR.to_string();
    let sub_type = if sub_types.is_empty() {
        None
    } else {
        Some(sub_types.join(&separator))
    };
    (program_types.join(&separator), sub_type)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneTemplate {
    pub id: TemplateId,
    pub name: String,
    pub normalized_name: String,
    pub category: Category,
    /// Display columns. A merged canonical holds the comma-joined union of its
    /// members' values.
    pub program_type: String,
    pub program_sub_type: Option<String>,
    /// The exact scopes this template serves. One entry unless it absorbed
    /// other templates in a merge.
    pub scopes: Vec<ProgramScope>,
    pub use_count: i32,
    pub is_approved: bool,
    pub is_deprecated: bool,
    pub canonical_id: Option<TemplateId>,
    pub flag_count: i32,
    pub flagged_by: BTreeSet<UserId>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MilestoneTemplate {
    pub fn is_live(&self) -> bool {
        !self.is_deprecated
    }

    /// Create-or-reuse matching: `scope` is one of the served pairs, sub-type
    /// absence included.
    pub fn serves(&self, scope: &ProgramScope) -> bool {
        self.scopes.contains(scope)
    }

    /// Listing matching, see [`ProgramScope::covers`].
    pub fn applies_to(&self, scope: &ProgramScope) -> bool {
        self.scopes.iter().any(|served| scope.covers(served))
    }

    pub fn serves_program_type(&self, program_type: &str) -> bool {
        self.scopes.iter().any(|s| s.program_type == program_type)
    }
}

/// Insert payload for the create-or-reuse upsert.
#[derive(Debug, Clone)]
pub struct NewMilestoneTemplate {
    pub name: String,
    pub normalized_name: String,
    pub category: Category,
    pub scope: ProgramScope,
    pub created_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationType {
    pub id: ApplicationTypeId,
    pub name: String,
    pub normalized_name: String,
    pub category: String,
    pub use_count: i32,
    pub is_default: bool,
    pub flag_count: i32,
    pub flagged_by: BTreeSet<UserId>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApplicationType {
    pub name: String,
    pub normalized_name: String,
    pub category: String,
    pub created_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub template_id: TemplateId,
    pub program_type: String,
    pub program_sub_type: Option<String>,
    pub order: i32,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: String,
    pub application_id: String,
    pub template_id: TemplateId,
    pub recorded_at: DateTime<Utc>,
}
