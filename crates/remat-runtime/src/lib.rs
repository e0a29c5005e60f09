#![warn(missing_docs)]

//! Reversible virtual memory management for GPU allocations.
//!
//! This crate decouples the reservation of a device virtual address range
//! from the physical memory backing it. Every managed allocation can be
//! released (physical pages unmapped and freed, content optionally saved to
//! host memory) and materialized again (pages recreated, mapped at the same
//! address, content restored) any number of times, so device pointers held
//! by the embedding runtime stay valid across the cycle. Allocations are
//! grouped by tag, and whole cohorts are swapped in and out together.
//!
//! The crate is driver-agnostic: every device interaction goes through the
//! [`driver::MemoryDriver`] capability trait, and concrete realizations
//! live in their own crates. The heap-backed `BytesDriver` ships here for
//! driverless environments and for the test-suite.

#[macro_use]
extern crate derive_new;

/// Virtual-address allocator adapter for tensor libraries.
pub mod allocator;
/// Process-wide accounting of produced physical memory.
pub mod counters;
/// Driver capability surface and opaque driver tokens.
pub mod driver;
/// Managed allocations, producers, stages and the cohort manager.
pub mod memory;

mod error;
pub use error::MemoryError;
