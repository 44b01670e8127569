pub mod logging;
pub mod message_log;
pub mod presence;
pub mod relay;
pub mod waiters;
