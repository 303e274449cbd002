//! SMS backend capability
//!
//! The alert manager forwards through whatever backend it was handed at
//! construction; the backend decides transport concerns (gateway limits,
//! encoding, credentials).

use async_trait::async_trait;

/// A gateway capable of delivering a text message
///
/// Implementations must be `Send + Sync` as the alert manager is shared
/// across worker tasks.
#[async_trait]
pub trait SmsBackend: Send + Sync {
    /// Validate configuration and mark the backend usable
    fn setup(&self) -> anyhow::Result<()>;

    /// Disable the backend
    fn teardown(&self);

    /// Deliver a message
    ///
    /// Returns `Ok` iff the gateway accepted the message. Message length
    /// bounds are a backend concern.
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}
