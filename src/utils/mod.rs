//! Small shared utilities.

pub mod canonical;
pub mod testing;
