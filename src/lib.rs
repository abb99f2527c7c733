//! FF-A secure partition manager core.
//!
//! The engine ([`spm::Spm`]) mediates between partitions: memory sharing,
//! direct and indirect messaging, notifications and interrupt routing. It
//! is driven by a trap handler that hands it one FF-A call at a time, and
//! talks to the hardware only through the traits in [`arch::traits`].
#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod delay;
pub mod dtb;
pub mod error;
pub mod ffa;
pub mod interrupts;
pub mod logger;
pub mod manifest;
pub mod mem_safe;
pub mod partition_services;
pub mod platform;
pub mod registry;
pub mod spm;
pub mod sync;
pub mod uart;
pub mod vcpu;
pub mod vcpu_interrupt;

pub use error::{Error, FfaError, Result};
pub use spm::{CallOutcome, Spm};
