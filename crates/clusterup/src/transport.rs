//! Transport abstraction for ClusterUP.
//!
//! The wire layer is a collaborator: the core only needs request/response
//! semantics with cancellation, not a concrete protocol stack.

use async_trait::async_trait;

use crate::membership::ClusterMember;
use crate::proto::{ClusterRequest, ClusterResponse};

/// Trait for the request/response transport between members
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `request` to `member` and wait for its response.
    ///
    /// Implementations must honor the caller's connection timeout and
    /// return an error rather than blocking indefinitely.
    async fn send(
        &self,
        member: &ClusterMember,
        request: ClusterRequest,
    ) -> Result<ClusterResponse, Box<dyn std::error::Error + Send + Sync>>;
}

/// In-process transport routing requests to registered handlers (for testing)
pub mod loopback {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use tokio::sync::RwLock;

    use super::*;
    use crate::membership::RequestHandler;

    /// Routes requests between in-process nodes by endpoint
    #[derive(Default)]
    pub struct LoopbackTransport {
        handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
        sent: AtomicU64,
    }

    impl LoopbackTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register the handler answering for `endpoint`
        pub async fn register(&self, endpoint: impl Into<String>, handler: Arc<dyn RequestHandler>) {
            self.handlers.write().await.insert(endpoint.into(), handler);
        }

        /// Drop the handler for `endpoint`, making it unreachable
        pub async fn disconnect(&self, endpoint: &str) {
            self.handlers.write().await.remove(endpoint);
        }

        /// Number of requests that went through this transport
        pub fn sent_count(&self) -> u64 {
            self.sent.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn send(
            &self,
            member: &ClusterMember,
            request: ClusterRequest,
        ) -> Result<ClusterResponse, Box<dyn std::error::Error + Send + Sync>> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            let handler = self.handlers.read().await.get(&member.endpoint).cloned();
            match handler {
                Some(handler) => Ok(handler.handle_request(request).await),
                None => Err(format!("no route to {}", member.endpoint).into()),
            }
        }
    }
}

pub use loopback::LoopbackTransport;
