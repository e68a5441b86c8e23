//! Integration tests for the build engine.

mod build_tests;
mod cache_tests;
mod common;
mod walk_tests;
