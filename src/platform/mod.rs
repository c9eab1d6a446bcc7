//! Transport boundary for the attendance platform.
//!
//! The scheduler and executor only ever talk to these traits; the k8n.cn
//! implementation lives in `k8n.rs` and mocks stand in for it in tests. The
//! wire format of the platform is deliberately kept out of the rest of the
//! crate - only the classification of its answers crosses this boundary.

pub mod k8n;

use crate::config::Task;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform denied the request (expired session, closed sign-in, bad
    /// class id). Retrying cannot help; the user has to act.
    #[error("rejected by platform: {0}")]
    Rejected(String),

    /// Network failure, timeout or server-side error. Worth retrying.
    #[error("transient platform failure: {0}")]
    Transient(String),
}

/// Pluggable transport for check-in submission.
pub trait CheckinPlatform: Send + Sync {
    /// Ids of the currently open check-in sessions for the task's class.
    fn active_checkins(&self, task: &Task) -> Result<Vec<String>, PlatformError>;

    /// Submit one check-in with an already-jittered coordinate. Returns the
    /// platform's confirmation text.
    fn submit_checkin(
        &self,
        task: &Task,
        checkin_id: &str,
        lat: &str,
        lng: &str,
    ) -> Result<String, PlatformError>;
}

/// Completed login: the durable session cookie plus the class it unlocks.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub cookie: String,
    pub class_id: String,
}

/// Starts QR login attempts.
pub trait LoginProvider: Send + Sync {
    fn begin(&self) -> Result<Box<dyn LoginAttempt>, PlatformError>;
}

/// One in-progress QR login. Owns whatever transport state (cookie jar,
/// challenge parameters) the platform needs between polls.
pub trait LoginAttempt: Send + Sync {
    /// URL the user's phone must open; the caller renders it into a QR image.
    fn login_url(&self) -> &str;

    /// One synchronous status check. `Ok(None)` while the QR is unscanned.
    fn poll(&self) -> Result<Option<LoginResult>, PlatformError>;
}
