// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod config;
pub mod deduplication;
pub mod sessions;
pub mod utils;

pub use utils::*;
