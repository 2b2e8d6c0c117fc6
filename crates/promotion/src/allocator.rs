//! The external resource allocator seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sentinel_types::error::PromotionError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AllocationRequest {
    pub artifact_ref: String,
    pub environment: String,
    pub pool: String,
    pub delta: u64,
    /// Correlates the allocation with the promotion's audit trail.
    pub trace_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AllocationResponse {
    pub allocation_id: String,
    #[serde(default)]
    pub pool: String,
}

/// Reserves capacity with the external Resource Allocator.
#[async_trait]
pub trait ResourceAllocator: Send + Sync {
    async fn allocate(
        &self,
        req: &AllocationRequest,
    ) -> Result<AllocationResponse, PromotionError>;
}

/// HTTP client against the allocator service. Every call carries a
/// deadline.
pub struct HttpAllocator {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAllocator {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, PromotionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PromotionError::AllocatorFailed(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ResourceAllocator for HttpAllocator {
    async fn allocate(
        &self,
        req: &AllocationRequest,
    ) -> Result<AllocationResponse, PromotionError> {
        let resp = self
            .client
            .post(format!("{}/allocations", self.endpoint))
            .json(req)
            .send()
            .await
            .map_err(|e| PromotionError::AllocatorFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PromotionError::AllocatorFailed(format!(
                "allocator returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| PromotionError::AllocatorFailed(format!("bad allocator body: {}", e)))
    }
}

/// In-memory allocator double. Records every call so tests can assert the
/// orchestrator never reached it on a denial.
#[derive(Default)]
pub struct StaticAllocator {
    fail: AtomicBool,
    calls: Mutex<Vec<AllocationRequest>>,
}

impl StaticAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let s = Self::default();
        s.fail.store(true, Ordering::SeqCst);
        s
    }

    pub fn calls(&self) -> Vec<AllocationRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ResourceAllocator for StaticAllocator {
    async fn allocate(
        &self,
        req: &AllocationRequest,
    ) -> Result<AllocationResponse, PromotionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(req.clone());
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PromotionError::AllocatorFailed(
                "static allocator configured to fail".into(),
            ));
        }
        Ok(AllocationResponse {
            allocation_id: format!("alloc-{}", req.trace_id),
            pool: req.pool.clone(),
        })
    }
}
