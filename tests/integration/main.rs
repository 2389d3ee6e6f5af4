//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that drives the full relay stack
//! (client stub → dispatcher → session service → link) against the
//! simulated co-processor. No device node is required.

mod callback_tests;
mod concurrency_tests;
mod harness;
mod lifecycle_tests;
mod negotiation_tests;
mod provisioning_flow_tests;
#[cfg(unix)]
mod socket_tests;
