//! APRS-IS login handshake.

use aprsgate_protocol::{normalize, passcode};
use std::fmt;

/// Software name announced in the login line.
pub const SOFTWARE_NAME: &str = "aprsgate";

/// Software version announced in the login line.
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Login credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    /// Write-capable login.
    Passcode(u16),
    /// Read-only login (`pass -1`).
    ListenOnly,
}

impl Credential {
    /// Derive the passcode for a callsign.
    #[must_use]
    pub fn for_callsign(callsign: &str) -> Self {
        Credential::Passcode(passcode(callsign))
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Passcode(code) => write!(f, "{code}"),
            Credential::ListenOnly => f.write_str("-1"),
        }
    }
}

/// The `user ... pass ... vers ... filter ...` line sent after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginLine {
    pub callsign: String,
    pub credential: Credential,
    pub software: String,
    pub version: String,
    pub filter: Option<String>,
}

impl LoginLine {
    /// Create a login with a derived passcode and no filter.
    #[must_use]
    pub fn new(callsign: &str) -> Self {
        Self {
            callsign: normalize(callsign),
            credential: Credential::for_callsign(callsign),
            software: SOFTWARE_NAME.to_string(),
            version: SOFTWARE_VERSION.to_string(),
            filter: None,
        }
    }

    /// Set the credential.
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    /// Set the server-side filter expression.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.filter = (!filter.trim().is_empty()).then_some(filter);
        self
    }
}

impl fmt::Display for LoginLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user {} pass {} vers {} {}",
            self.callsign, self.credential, self.software, self.version
        )?;
        if let Some(filter) = &self.filter {
            write!(f, " filter {filter}")?;
        }
        Ok(())
    }
}

/// Server answer to a login, sent as a `# logresp` comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub callsign: String,
    pub verified: bool,
    pub server: Option<String>,
}

/// Parse `# logresp CALL verified, server NAME`.
#[must_use]
pub fn parse_logresp(line: &str) -> Option<LoginResponse> {
    let rest = line.strip_prefix('#')?.trim_start().strip_prefix("logresp")?;
    let mut words = rest.split_whitespace();

    let callsign = words.next()?.to_string();
    let verified = match words.next()?.trim_end_matches(',') {
        "verified" => true,
        "unverified" => false,
        _ => return None,
    };
    let server = match words.next() {
        Some("server") => words.next().map(str::to_string),
        _ => None,
    };

    Some(LoginResponse {
        callsign,
        verified,
        server,
    })
}
