//! Hardware collaborators of the engine.
//!
//! `traits` defines the contracts the engine calls through. The AArch64
//! backends implementing them are only built for that target.

pub mod traits;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
