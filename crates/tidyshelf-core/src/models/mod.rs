//! Data models shared by every stage of the migration pipeline.
//!
//! All enums serialize with the upper-case names used in ledger files and
//! reports (`CONFLICT_PENDING`, `HIGH`, `WESTERN`, ...).

mod metadata;
mod record;

pub use metadata::*;
pub use record::*;
