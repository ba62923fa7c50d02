//! # Kernel Configuration and Boot Interface
//!
//! Boot-ABI structures and memory-layout constants shared between the
//! loader and the kernel's memory subsystem.
//!
//! The [`boot`] module defines the `#[repr(C)]` handoff records the loader
//! fills in right after `ExitBootServices`; the [`memory`] module holds the
//! compile-time constants (frame size, reserved low memory, identity-map
//! span, heap tuning) that every memory crate agrees on.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
