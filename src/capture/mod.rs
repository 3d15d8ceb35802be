//! Capture history: the record type and the bounded store that holds it.

pub mod record;
pub mod store;

pub use record::{
    captured_body, header_multimap, request_header_multimap, CaptureRecord, HeaderMultimap,
};
pub use store::{CaptureStore, SubscriberId, Subscription};
