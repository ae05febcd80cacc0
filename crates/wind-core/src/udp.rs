//! The UDP dispatch engine: a single-socket hub plus the per-flow server
//! that virtualizes it into long-lived sessions. See §4.4/§4.5.

pub mod hub;
pub mod server;
