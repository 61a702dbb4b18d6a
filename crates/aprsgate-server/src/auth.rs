//! Client authentication.

use aprsgate_core::{Directory, DirectoryError};
use aprsgate_protocol::{base_callsign, is_valid_callsign, normalize, verify_passcode};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid callsign: {0}")]
    InvalidCallsign(String),

    #[error("Wrong passcode for {0}")]
    BadPasscode(String),

    #[error("{0} is not served by this gateway")]
    NotServed(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Decides whether a client may act as a callsign.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the credentials and return the normalized callsign.
    ///
    /// # Errors
    ///
    /// Returns an error if the client may not log in as `callsign`.
    async fn authenticate(&self, callsign: &str, passcode: &str) -> Result<String, AuthError>;
}

/// Accepts the APRS-IS passcode of a callsign served by the directory.
pub struct PasscodeAuthenticator {
    directory: Arc<dyn Directory>,
}

impl PasscodeAuthenticator {
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Authenticator for PasscodeAuthenticator {
    async fn authenticate(&self, callsign: &str, passcode: &str) -> Result<String, AuthError> {
        let callsign = normalize(callsign);
        if !is_valid_callsign(&callsign) {
            return Err(AuthError::InvalidCallsign(callsign));
        }
        if !verify_passcode(&callsign, passcode) {
            return Err(AuthError::BadPasscode(callsign));
        }

        let base = base_callsign(&callsign);
        if !self.directory.is_served(&base).await? {
            return Err(AuthError::NotServed(base));
        }
        Ok(callsign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aprsgate_core::MemoryDirectory;

    fn authenticator() -> PasscodeAuthenticator {
        PasscodeAuthenticator::new(Arc::new(MemoryDirectory::new(["K8SDR"])))
    }

    #[tokio::test]
    async fn test_valid_login() {
        let callsign = authenticator()
            .authenticate(" k8sdr-7 ", "14750")
            .await
            .unwrap();
        assert_eq!(callsign, "K8SDR-7");
    }

    #[tokio::test]
    async fn test_rejected_logins() {
        let auth = authenticator();
        assert!(matches!(
            auth.authenticate("K8SDR", "12345").await,
            Err(AuthError::BadPasscode(_))
        ));
        assert!(matches!(
            auth.authenticate("bad call", "1").await,
            Err(AuthError::InvalidCallsign(_))
        ));
        assert!(matches!(
            auth.authenticate("W1ABC", "9873").await,
            Err(AuthError::NotServed(_))
        ));
    }
}
