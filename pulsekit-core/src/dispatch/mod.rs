//! Request delivery
//!
//! - [`RequestQueue`]: producer entry point, builds and persists requests
//! - [`Dispatcher`]: single-flight drain loop with bounded retries
//! - [`Transport`]: the injected single-request HTTP capability

pub mod engine;
pub mod queue;
pub mod transport;

pub use engine::{DispatchPolicy, Dispatcher, DrainReport, DrainState};
pub use queue::RequestQueue;
pub use transport::{HttpTransport, SendFuture, Transport};
