//! Events: model, batching queues and producers

pub mod event;
pub mod queues;
pub mod service;

pub(crate) use event::truncate;
pub use event::{CustomEvent, Event, SegmentValue, Segmentation, VIEW_EVENT_KEY};
pub use queues::{EventCategory, EventQueues};
pub use service::EventService;
