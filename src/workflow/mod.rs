//! Background workflows.
//!
//! - `reconcile`: merge the source ledger into the CRM working table

pub mod reconcile;
