//! Taskline - task mutation and notification pipeline
//!
//! Transactional task writes with cache-aside reads, and durable
//! create/update/delete notifications through a RabbitMQ direct exchange.

pub mod bus;
pub mod cache;
pub mod config;
pub mod services;
pub mod storage;
pub mod task;
pub mod utils;
