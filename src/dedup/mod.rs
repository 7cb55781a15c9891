pub mod duplicates;

pub use duplicates::{
    build_merge_plan, find_duplicate_groups, merge_group, run_normalization, DuplicateGroup,
    GroupMerge,
};
