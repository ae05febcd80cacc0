//! Outbound handlers that live in core rather than a protocol crate. The
//! [`AbstractOutbound`](crate::context::AbstractOutbound) trait itself is
//! defined in [`context`](crate::context) alongside `AppContext`, since
//! both are needed together at every call site that spawns an outbound's
//! drive loop.

pub mod blackhole;
