//! Kernel synchronization primitives.

mod spinlock;

pub use spinlock::{IntrTable, Spinlock};
