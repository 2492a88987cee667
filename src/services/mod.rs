//! Business logic shared by the HTTP layer and the binaries.
//!
//! Services take a `&RenewalDb` and return `ServiceError`, so callers decide
//! how to lock the connection and how to present failures.

pub mod history;
pub mod renewals;
pub mod seed;
