//! Callsign helpers.
//!
//! A callsign is a station identity, optionally suffixed with `-<SSID>` to
//! denote a sub-station. Most of the gateway keys its state on the *base*
//! callsign, which is the uppercased text before the first `-`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed width of the addressee field in an APRS message.
pub const ADDRESSEE_WIDTH: usize = 9;

/// Maximum length of the callsign part (without SSID).
const MAX_BASE_LENGTH: usize = 6;

/// Maximum number of SSID digits.
const MAX_SSID_DIGITS: usize = 2;

/// Trim and uppercase a callsign.
#[must_use]
pub fn normalize(callsign: &str) -> String {
    callsign.trim().to_ascii_uppercase()
}

/// Strip any `-<SSID>` suffix and uppercase the result.
///
/// `base_callsign("k8sdr-10") == "K8SDR"`.
#[must_use]
pub fn base_callsign(callsign: &str) -> String {
    let normalized = normalize(callsign);
    match normalized.find('-') {
        Some(idx) => normalized[..idx].to_string(),
        None => normalized,
    }
}

/// Check whether two callsigns refer to the same base station.
#[must_use]
pub fn same_station(a: &str, b: &str) -> bool {
    base_callsign(a) == base_callsign(b)
}

/// Validate a callsign of the form `ABC123` or `ABC123-NN`.
///
/// Input is trimmed and uppercased before checking.
#[must_use]
pub fn is_valid_callsign(callsign: &str) -> bool {
    let normalized = normalize(callsign);
    let (base, ssid) = match normalized.split_once('-') {
        Some((base, ssid)) => (base, Some(ssid)),
        None => (normalized.as_str(), None),
    };

    let base_ok = (1..=MAX_BASE_LENGTH).contains(&base.len())
        && base.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());

    let ssid_ok = match ssid {
        Some(ssid) => {
            (1..=MAX_SSID_DIGITS).contains(&ssid.len()) && ssid.bytes().all(|b| b.is_ascii_digit())
        }
        None => true,
    };

    base_ok && ssid_ok
}

/// Format a callsign as a 9-character, space-padded addressee field.
///
/// Longer input is cut to the field width.
#[must_use]
pub fn pad_addressee(callsign: &str) -> String {
    let normalized = normalize(callsign);
    let truncated: String = normalized.chars().take(ADDRESSEE_WIDTH).collect();
    format!("{truncated:<width$}", width = ADDRESSEE_WIDTH)
}

/// Identifies one conversation: a locally served station talking to a remote one.
///
/// Both sides are stored as base callsigns, so every SSID of a station shares
/// the same conversation state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Base callsign of the locally served station.
    pub local: String,
    /// Base callsign of the remote station.
    pub remote: String,
}

impl ConversationKey {
    /// Build a key, reducing both callsigns to their base form.
    #[must_use]
    pub fn new(local: &str, remote: &str) -> Self {
        Self {
            local: base_callsign(local),
            remote: base_callsign(remote),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.remote)
    }
}
