//! Process records, the table arena, and lifecycle management.

pub mod manager;
pub mod table;

pub use table::{Channel, ProcSnapshot, ProcState, ProcessRecord, TrapFrame};
