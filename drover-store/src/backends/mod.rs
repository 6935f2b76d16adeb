//! Backend storage implementations for the message store
//!
//! - `memory`: in-memory storage for testing and transient queues
//! - `file`: one bincode record per message for durable queues

pub mod file;
pub mod memory;

pub use file::FileMessageStore;
pub use memory::MemoryMessageStore;
