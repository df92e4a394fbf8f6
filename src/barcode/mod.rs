//! Barcode domain: ownership model, usage limits, transaction ledger, and
//! the issuance engine.

pub mod engine;
pub mod limits;
pub mod models;
pub mod repo;

pub use engine::{IssuanceEngine, IssueError, IssueOutcome};
pub use models::{Barcode, BarcodeType, Gender, PullSetting};
