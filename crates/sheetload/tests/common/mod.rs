//! Shared test utilities for sheetload integration tests.

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
