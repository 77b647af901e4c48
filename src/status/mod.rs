//! Durable transfer state.
//!
//! The [`StatusStore`] persists one [`ResumeRecord`] per task id as a single
//! JSON document with a prior-generation backup, written atomically so a
//! crash mid-flush can never leave the next process without a parseable
//! document.

mod record;
mod store;

pub use record::{ResumeRecord, TransferStatus};
pub use store::{StatusStore, StoreError};
