//! Persistence for the attendance pipeline.
//!
//! SQLite-backed repository (guests, face encodings, attendance), the
//! cooldown-deduplicated attendance ledger, the read-mostly known-faces
//! gallery cache, and typed pending-registration artifacts.

pub mod db;
pub mod gallery;
pub mod ledger;
pub mod pending;

pub use db::{Store, StoreError};
pub use gallery::FaceGallery;
pub use ledger::AttendanceLedger;
pub use pending::{PendingError, PendingRegistration};
