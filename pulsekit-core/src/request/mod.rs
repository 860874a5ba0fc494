//! Request model and codec
//!
//! A [`Request`] is frozen at construction: its GET/POST form, base
//! parameters and checksum never change once it reaches the store.

pub mod builder;
pub mod model;

pub use builder::{RequestBuilder, TimeParts, CHECKSUM_PARAM, SDK_NAME, SDK_VERSION};
pub use model::{Params, Payload, Request, RequestRecord, StoredRequest};
