pub mod error;
pub mod protocol;
pub mod message;
pub mod subscription;
pub mod connection;
pub mod transport;
pub mod test_util;

pub use error::{NatsError, Result};
pub use connection::connection::Connection;
pub use connection::connection_config::ConnectionOptions;
pub use connection::connection_state::ConnectionState;
pub use message::Message;
pub use subscription::subscription::Subscription;
