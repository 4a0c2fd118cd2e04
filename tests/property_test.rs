// tests/property_test.rs

//! Property-based tests for the proxy.
//!
//! These use randomized inputs to verify invariants that should hold
//! regardless of the specific values involved, rather than checking one
//! hand-picked example at a time.

mod property {
    pub mod framing_roundtrip_test;
}
