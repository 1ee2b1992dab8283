//! Backend handle seam.
//!
//! The manager owns exactly one `Backend` handle per node and is the
//! only component that releases them. Routing decides *which* node; the
//! caller takes the handle and performs the actual inference call
//! through it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use infergrid_core::NodeDescriptor;

use crate::discovery::BoxFuture;

/// Opaque inference request payload, already in the backend's wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub body: serde_json::Value,
}

/// Inference response with the observed round-trip latency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub body: serde_json::Value,
    pub latency_ms: f64,
}

/// Handle to one node's inference endpoint.
pub trait Backend: Send + Sync {
    /// The node this handle belongs to.
    fn node_id(&self) -> &str;

    /// Send one inference request to the node.
    fn invoke(&self, request: InferenceRequest) -> BoxFuture<anyhow::Result<InferenceResponse>>;
}

/// Creates a backend handle per discovered node.
pub trait BackendFactory: Send + Sync {
    fn create(&self, node: &NodeDescriptor) -> anyhow::Result<Arc<dyn Backend>>;
}

/// Path inference requests are posted to.
const INFERENCE_PATH: &str = "/v1/messages";

/// HTTP backend posting JSON inference requests to the node.
pub struct HttpBackend {
    node_id: String,
    url: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(node: &NodeDescriptor, timeout: Duration) -> Self {
        Self {
            node_id: node.id.clone(),
            url: node.url.clone(),
            timeout,
        }
    }
}

impl Backend for HttpBackend {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn invoke(&self, request: InferenceRequest) -> BoxFuture<anyhow::Result<InferenceResponse>> {
        let url = self.url.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let started = std::time::Instant::now();
            let body: serde_json::Value =
                infergrid_cache::http::post_json(&url, INFERENCE_PATH, &request.body, timeout)
                    .await?;
            Ok(InferenceResponse {
                body,
                latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
            })
        })
    }
}

/// Default factory producing [`HttpBackend`] handles.
pub struct HttpBackendFactory {
    timeout: Duration,
}

impl HttpBackendFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl BackendFactory for HttpBackendFactory {
    fn create(&self, node: &NodeDescriptor) -> anyhow::Result<Arc<dyn Backend>> {
        Ok(Arc::new(HttpBackend::new(node, self.timeout)))
    }
}
