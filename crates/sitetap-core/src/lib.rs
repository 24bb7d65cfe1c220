//! Core data model for sitetap: the retention filter, the bounded per-tab
//! request ledger, and origin tracking. Pure — no async runtime, no I/O.

pub mod event;
pub mod filter;
pub mod ledger;
pub mod origin;
pub mod record;
pub mod types;

pub use event::{NetworkEvent, TabEvent};
pub use filter::RequestFilter;
pub use ledger::{RequestLedger, UpsertOutcome, DEFAULT_CAPACITY};
pub use origin::{origin_of_url, OriginTracker};
pub use record::{RecordPatch, RequestRecord};
pub use types::{CaptureOrigin, Header, RequestId, TabId};
