pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod header;
pub mod hugepage;
pub mod ring;
pub mod verbs;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
