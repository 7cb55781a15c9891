pub mod milestone_name;
pub mod string_utils;

pub use milestone_name::{categorize, normalize_milestone_name};
pub use string_utils::{normalize, similarity};
