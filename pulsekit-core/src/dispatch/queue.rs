//! Producer entry point: build a request, persist it, trigger delivery

use std::sync::Arc;

use crate::db::RequestStore;
use crate::request::{Params, RequestBuilder};

use super::engine::Dispatcher;

/// Builds requests and hands them to the store
pub struct RequestQueue {
    builder: RequestBuilder,
    store: Arc<RequestStore>,
    dispatcher: Arc<Dispatcher>,
}

impl RequestQueue {
    pub fn new(builder: RequestBuilder, store: Arc<RequestStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            builder,
            store,
            dispatcher,
        }
    }

    /// Build and persist one request, then trigger a drain.
    ///
    /// Returns the stored id, or `None` when persisting failed; storage
    /// failures are logged and the request is lost.
    pub fn enqueue_request(&self, params: Params) -> Option<i64> {
        let request = self.builder.build(&params);
        match self.store.enqueue(&request) {
            Ok(id) => {
                tracing::debug!(id, is_get = request.is_get(), "Request queued");
                self.dispatcher.process_queue();
                Some(id)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist request, dropping it");
                None
            }
        }
    }

    pub fn builder(&self) -> &RequestBuilder {
        &self.builder
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
