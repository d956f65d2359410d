//! Incident tracking: the debounce state machine and the processor that
//! applies check results to the store.

mod incident;
mod processor;

pub use incident::*;
pub use processor::*;
