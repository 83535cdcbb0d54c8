//! DCE/RPC over SMB named pipes in Rust
//!
//! NDR marshalling, connection-oriented PDUs, bind negotiation and
//! fragmentation, with SRVSVC and WKSSVC served over TCP or in-process
//! named pipes. The client and server halves sit behind the `client`
//! and `server` features.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod dcerpc;
pub mod error;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

#[cfg(all(test, feature = "client", feature = "server"))]
pub mod e2e_tests;

pub use error::{Error, Result};
