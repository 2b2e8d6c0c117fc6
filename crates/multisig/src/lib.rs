//! # Sentinel Multisig
//!
//! The N-of-M upgrade state machine shared by policy activations and
//! artifact promotions. A manifest's validity proof is the vector of
//! independent approver signatures over the canonical payload bytes:
//! aggregate signatures, not threshold cryptography.

pub mod controller;

pub use controller::{MultisigController, NoopExecutor, SubmitUpgrade, UpgradeExecutor};
