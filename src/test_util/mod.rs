//! This module contains utilities that are useful for testing code that talks to NATS: an
//!  in-memory server with a matching transport, and an event handler that records what it
//!  was notified of. They are used for testing the client itself, but they are also exported
//!  for application testing, which is why they are part of the crate's regular
//!  (non-#[cfg(test)]) code.

pub mod event;
pub mod mock_server;
