// # Session Coordination
//
// Ephemeral multi-agent session documents and ordered event logs backed by
// the external key/value store, a high-level session API, and session
// analytics, built around a two-key-per-session `KeyValueStore` model.

mod analytics;
mod manager;
mod store;

pub use analytics::{SessionAnalytics, TrendReport, TrendWindow};
pub use manager::{EmitEventOpts, SessionEvent, SessionEventType, SessionManager};
pub use store::{SessionDocument, SessionState, SessionStore};
