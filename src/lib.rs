pub mod dedup;
pub mod errors;
pub mod lifecycle;
pub mod models;
pub mod normalization;
pub mod storage;
pub mod utils;
