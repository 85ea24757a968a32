//! Failure handling for backend access.

pub mod retry;
