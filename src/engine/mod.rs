// factgraph Engine: I/O-bearing half of the crate.
// Everything here builds on `atoms` (types, config, errors, traits).

pub mod http;
pub mod limiter;
pub mod providers;
pub mod recall;
pub mod session_manager;
pub mod store;
