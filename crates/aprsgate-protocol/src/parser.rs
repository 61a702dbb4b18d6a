//! APRS-IS line parser.
//!
//! The message grammars overlap, so matching is done by an ordered list of
//! matchers and the first one that accepts the information field wins:
//!
//! 1. user message: `:` + 9-char addressee + `:` + body
//! 2. bulletin: `BLN` + digit + 5-char group + `:` + text
//! 3. announcement: `BLN` + uppercase letter + 5-char group + `:` + text
//! 4. addressed body: 9-char addressee (wider character set) + `:` + body
//!
//! Bodies behind either addressee form (1 or 4) are then classified as
//! telemetry definitions, bare acks/rejects, or messages with an optional
//! trailing id. A user-message body that is exactly `ackNN` or `rejNN` is
//! therefore a response, never message text.

use crate::packet::{
    MessageBody, Packet, PacketBody, ParseError, ResponseBody, ResponseKind, TelemetryTag,
};

/// Maximum bulletin text length.
const MAX_BULLETIN_TEXT: usize = 67;

/// Width of a new-format (reply-ack capable) message id.
const NEW_ID_LENGTH: usize = 2;

/// Maximum width of a legacy message id.
const MAX_LEGACY_ID_LENGTH: usize = 5;

type Matcher = fn(&str) -> Option<PacketBody>;

/// Matchers in precedence order.
const MATCHERS: [(&str, Matcher); 4] = [
    ("user-message", match_user_message),
    ("bulletin", match_bulletin),
    ("announcement", match_announcement),
    ("addressed", match_addressed),
];

/// Parse one upstream line.
///
/// Trailing CR/LF is ignored. Never panics on malformed input.
///
/// # Errors
///
/// Returns [`ParseError::Unrecognized`] if the line has no information field
/// or matches none of the grammars.
pub fn parse(line: &str) -> Result<Packet, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (header, info) = line.split_once(':').ok_or(ParseError::Unrecognized)?;

    let body = MATCHERS
        .iter()
        .find_map(|(_, matcher)| matcher(info))
        .ok_or(ParseError::Unrecognized)?;

    let (source, destination, path) = split_header(header);

    Ok(Packet {
        source,
        destination,
        path,
        body,
        raw: line.to_string(),
    })
}

/// Split `SRC>DEST,HOP1,HOP2` into its parts.
fn split_header(header: &str) -> (String, String, Vec<String>) {
    let Some((source, rest)) = header.split_once('>') else {
        return (String::new(), String::new(), Vec::new());
    };

    let mut fields = rest.split(',');
    let destination = fields.next().unwrap_or_default().to_string();
    let path = fields
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
        .collect();

    (source.to_string(), destination, path)
}

fn match_user_message(info: &str) -> Option<PacketBody> {
    let rest = info.strip_prefix(':')?;
    let (addressee, body) = split_addressee(rest, is_strict_addressee_char)?;
    Some(classify_body(addressee, body))
}

fn match_bulletin(info: &str) -> Option<PacketBody> {
    let (slot, group, text) = split_bulletin(info, |c| c.is_ascii_digit(), |c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | ' ' | '-')
    })?;

    if group.is_empty() {
        Some(PacketBody::Bulletin { slot, text })
    } else {
        Some(PacketBody::GroupBulletin { slot, group, text })
    }
}

fn match_announcement(info: &str) -> Option<PacketBody> {
    let (slot, group, text) =
        split_bulletin(info, |c| c.is_ascii_uppercase(), is_broad_addressee_char)?;
    Some(PacketBody::Announcement { slot, group, text })
}

fn match_addressed(info: &str) -> Option<PacketBody> {
    let (addressee, body) = split_addressee(info, is_broad_addressee_char)?;
    Some(classify_body(addressee, body))
}

fn is_strict_addressee_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '-')
}

fn is_broad_addressee_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '-')
}

/// Split a 9-character addressee field followed by `:` from its body.
fn split_addressee(s: &str, allowed: fn(char) -> bool) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    if bytes.len() <= crate::ADDRESSEE_WIDTH || bytes[crate::ADDRESSEE_WIDTH] != b':' {
        return None;
    }

    let field = &bytes[..crate::ADDRESSEE_WIDTH];
    if !field.iter().all(|&b| allowed(char::from(b))) {
        return None;
    }

    // Field bytes are ASCII, so these are char boundaries.
    let addressee = s[..crate::ADDRESSEE_WIDTH].trim_end_matches(' ');
    let body = &s[crate::ADDRESSEE_WIDTH + 1..];
    Some((addressee, body))
}

/// Split `BLN<slot><group:5>:<text>`.
fn split_bulletin(
    info: &str,
    slot_ok: fn(char) -> bool,
    group_ok: fn(char) -> bool,
) -> Option<(char, String, String)> {
    let rest = info.strip_prefix(crate::BULLETIN_PREFIX)?;
    let bytes = rest.as_bytes();
    if bytes.len() < 7 || bytes[6] != b':' {
        return None;
    }

    let slot = char::from(bytes[0]);
    if !slot_ok(slot) || !bytes[1..6].iter().all(|&b| group_ok(char::from(b))) {
        return None;
    }

    let group = rest[1..6].trim_end_matches(' ').to_string();
    let text: String = rest[7..].chars().take(MAX_BULLETIN_TEXT).collect();
    Some((slot, group, text.trim().to_string()))
}

/// Classify the body behind an addressee field.
fn classify_body(addressee: &str, body: &str) -> PacketBody {
    let addressee = addressee.to_string();

    if let Some(tag) = TelemetryTag::ALL
        .into_iter()
        .find(|tag| body.starts_with(tag.prefix()))
    {
        return PacketBody::Telemetry {
            addressee,
            tag,
            payload: body[tag.prefix().len()..].to_string(),
        };
    }

    if let Some((kind, id, ack_id)) = split_response(body) {
        return PacketBody::Response(ResponseBody {
            addressee,
            kind,
            id: id.to_string(),
            ack_id: ack_id.map(str::to_string),
        });
    }

    let (text, id, ack_id) = match split_message_id(body) {
        Some((text, id, ack_id)) => (text, Some(id.to_string()), ack_id.map(str::to_string)),
        None => (body, None, None),
    };

    PacketBody::Message(MessageBody {
        addressee,
        text: text.trim().to_string(),
        id,
        ack_id,
    })
}

fn is_id(s: &str, len: std::ops::RangeInclusive<usize>) -> bool {
    len.contains(&s.len()) && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Match `MM}` + optional `AA` (new format) and return `(id, ack_id)`.
fn split_new_format(tail: &str) -> Option<(&str, Option<&str>)> {
    let (id, ack) = tail.split_once('}')?;
    if !is_id(id, NEW_ID_LENGTH..=NEW_ID_LENGTH) {
        return None;
    }
    if ack.is_empty() {
        Some((id, None))
    } else if is_id(ack, NEW_ID_LENGTH..=NEW_ID_LENGTH) {
        Some((id, Some(ack)))
    } else {
        None
    }
}

/// Match `ackMM}AA`, `ackMM}` or legacy `ackNNNNN` (and the `rej` forms).
fn split_response(body: &str) -> Option<(ResponseKind, &str, Option<&str>)> {
    let (kind, rest) = if let Some(rest) = body.strip_prefix("ack") {
        (ResponseKind::Ack, rest)
    } else if let Some(rest) = body.strip_prefix("rej") {
        (ResponseKind::Rej, rest)
    } else {
        return None;
    };

    if rest.contains('}') {
        let (id, ack_id) = split_new_format(rest)?;
        return Some((kind, id, ack_id));
    }

    is_id(rest, 1..=MAX_LEGACY_ID_LENGTH).then_some((kind, rest, None))
}

/// Match `text{MM}AA`, `text{MM}` or legacy `text{NNNNN` and return
/// `(text, id, ack_id)`.
///
/// Ids never contain `{`, so only the last brace can start a valid suffix.
fn split_message_id(body: &str) -> Option<(&str, &str, Option<&str>)> {
    let open = body.rfind('{')?;
    let (text, tail) = (&body[..open], &body[open + 1..]);

    if tail.contains('}') {
        let (id, ack_id) = split_new_format(tail)?;
        return Some((text, id, ack_id));
    }

    is_id(tail, 1..=MAX_LEGACY_ID_LENGTH).then_some((text, tail, None))
}
