//! Integration tests for crawl-keeper
//!
//! These drive a full supervisor against a scripted renderer, a mock HTTP
//! server and real SQLite files.

mod common;
mod engine_tests;
mod http_tests;
mod recovery_tests;
