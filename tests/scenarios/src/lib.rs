//! Scenario harness for the KIVO kernel core.
//!
//! Runs the real scheduler, hand-off protocol and paging paths on a host:
//! memory-side collaborators come from the kernel's in-memory HAL, while
//! context switching is backed by parked OS threads so every kernel flow
//! of control genuinely suspends and resumes. See [`harness`].

pub mod harness;
