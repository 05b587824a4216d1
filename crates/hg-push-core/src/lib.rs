mod error;
mod message;
mod retry;

pub use error::{CoreError, Result};
pub use message::{MessageKind, PushEvent, PushMessage, RepositoryId};
pub use retry::{Health, RetryDecision, RetryPolicy, RetryState};

/// Discriminator value of push notifications
pub const HG_PUSH: &str = "hg-push";

/// Discriminator value of repository registrations
pub const NEW_HG_REPO: &str = "new-hg-repo";
