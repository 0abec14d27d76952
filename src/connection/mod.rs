pub mod connection;
pub mod connection_config;
pub mod connection_events;
pub mod connection_state;
mod handshake;
mod io_tasks;
mod reconnect;
pub mod server_pool;

#[cfg(test)]
mod tests;
