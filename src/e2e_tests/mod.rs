//! End-to-end tests for the RPC client and server
//!
//! These run a real server on a loopback listener and drive it with the
//! client, over TCP and over the in-process named pipes.

pub mod loopback;
pub mod test_context;

pub use loopback::{LoopbackTransport, TestHarness};
pub use test_context::TestContext;
