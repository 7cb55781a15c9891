pub mod application_types;
pub mod milestone_templates;
pub mod milestones;

pub use application_types::{
    create_or_reuse_application_type, flag_application_type, list_application_types,
    unflag_application_type,
};
pub use milestone_templates::{
    create_or_reuse, flag, list_templates, list_templates_by_category, suggest_similar, unflag,
    TemplateSuggestion,
};
pub use milestones::{add_milestone, delete_milestone, list_milestones, reorder_milestones};
