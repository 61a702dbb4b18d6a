//! APRS-IS passcode computation.
//!
//! APRS-IS servers accept a write-capable login only when the passcode matches
//! a 15-bit hash of the base callsign. A passcode of `-1` logs in read-only.

use crate::callsign::base_callsign;

const PASSCODE_SEED: u16 = 0x73e2;
const PASSCODE_MASK: u16 = 0x7fff;

/// Compute the passcode for a callsign. Any SSID is ignored.
#[must_use]
pub fn passcode(callsign: &str) -> u16 {
    let base = base_callsign(callsign);
    let mut hash = PASSCODE_SEED;

    for pair in base.as_bytes().chunks(2) {
        hash ^= u16::from(pair[0]) << 8;
        if let Some(&low) = pair.get(1) {
            hash ^= u16::from(low);
        }
    }

    hash & PASSCODE_MASK
}

/// Check a client-supplied passcode string against a callsign.
#[must_use]
pub fn verify_passcode(callsign: &str, candidate: &str) -> bool {
    candidate
        .trim()
        .parse::<u16>()
        .map(|code| code == passcode(callsign))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_passcodes() {
        assert_eq!(passcode("K8SDR"), 14750);
        assert_eq!(passcode("N0CALL"), 13023);
    }

    #[test]
    fn test_passcode_ignores_ssid_and_case() {
        assert_eq!(passcode("k8sdr-10"), passcode("K8SDR"));
    }

    #[test]
    fn test_verify_passcode() {
        assert!(verify_passcode("K8SDR-10", "14750"));
        assert!(verify_passcode("K8SDR", " 14750 "));
        assert!(!verify_passcode("K8SDR", "14751"));
        assert!(!verify_passcode("K8SDR", "-1"));
        assert!(!verify_passcode("K8SDR", "abc"));
    }
}
