#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod client;
pub mod error;
pub mod mailgun;
pub mod mandrill;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod registry;
pub mod rewrite;
pub mod workspace;

pub use client::{ProviderClient, SendReceipt};
pub use error::{BuildError, SendError};
pub use mailgun::MailgunClient;
pub use mandrill::MandrillClient;
#[cfg(any(test, feature = "testing"))]
pub use mock::MockProvider;
pub use registry::ProviderRegistry;
pub use rewrite::apply_rewrites;
pub use workspace::WorkspaceClient;
