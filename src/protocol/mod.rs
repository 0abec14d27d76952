//! The NATS text protocol as seen from the client: typed operations received from the server,
//!  the incremental parser producing them, and serialization of the operations the client
//!  sends.

pub mod client_ops;
pub mod connect_info;
pub mod parser;
pub mod protocol_op;
pub mod server_info;
