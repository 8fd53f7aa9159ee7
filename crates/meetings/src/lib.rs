//! The meeting registry (single source of truth for meeting rows) and the
//! status machine that owns every status mutation.
//!
//! All writes to a meeting's status go through
//! [`MeetingStore::transition`]; the store's other mutators only touch
//! runtime fields (worker assignment, live config). Each committed
//! transition is handed to the installed [`StatusSink`] in commit order.

mod store;
mod transition;

pub use store::{AdmitError, MeetingStore, NoopSink, StatusSink};
pub use transition::TransitionError;
