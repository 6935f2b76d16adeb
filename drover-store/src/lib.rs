#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod backends;
pub mod config;
pub mod error;
pub mod record;
pub mod store;

pub use backends::{FileMessageStore, MemoryMessageStore};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError};
pub use record::{Lease, StoredMessage};
pub use store::{DeferKind, DeferOutcome, MessageStore};
