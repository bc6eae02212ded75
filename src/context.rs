//! Process context
//!
//! Created once at startup and handed to every component that needs a shared
//! service. There are no process-wide singletons besides the metrics recorder
//! installed by the binary.

use crate::config::HttpConfig;
use crate::error::HttpError;
use crate::events::EventBus;
use crate::http::RequestDispatcher;
use crate::metrics::GatewayMetrics;
use std::sync::Arc;

#[derive(Clone)]
pub struct Context {
    pub http: Arc<RequestDispatcher>,
    pub events: EventBus,
    pub metrics: Arc<GatewayMetrics>,
}

impl Context {
    pub fn new(http_config: HttpConfig, metrics: Arc<GatewayMetrics>) -> Result<Self, HttpError> {
        let http = Arc::new(RequestDispatcher::new(http_config, Arc::clone(&metrics))?);
        Ok(Self {
            http,
            events: EventBus::new(),
            metrics,
        })
    }
}
