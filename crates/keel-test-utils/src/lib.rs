//! Mock workers, mock tools and catalog fixtures shared by Keel's tests.

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
