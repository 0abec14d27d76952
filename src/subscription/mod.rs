pub mod message_handler;
pub mod pending_queue;
pub mod subscription;
