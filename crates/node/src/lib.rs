//! Wiring for the Sentinel control-plane node.
//!
//! The binary is a thin clap front over [`bootstrap`], which builds every
//! subsystem from a validated `NodeConfig`. Integration tests construct
//! the same components against a scratch database.

pub mod bootstrap;
