//! # Sentinel Promotion
//!
//! Couples the eval engine's promotion candidates to SentinelNet and the
//! external resource allocator: idempotency by caller key, a sentinel
//! gate, an allocation call with a deadline, and a terminal status with a
//! full audit trail correlated by trace id.

pub mod allocator;
pub mod gate;
pub mod orchestrator;

pub use allocator::{
    AllocationRequest, AllocationResponse, HttpAllocator, ResourceAllocator, StaticAllocator,
};
pub use gate::{CheckServiceGate, GateDecision, PromotionGate, StaticSentinel};
pub use orchestrator::PromotionOrchestrator;
