//! Line Classifier
//!
//! Maps one line of engine output to the events it carries. The engine's
//! phrasing is not under our control, so every detector is a plain
//! case-sensitive substring test and account details go through a
//! three-tier cascade:
//!
//! 1. **Primary**: the indexed account record `*[<n>] sip:<user>@<host>`
//! 2. **Fallback**: `Account <n>: sip:<user>@<host>` anywhere in the line
//! 3. **Heuristic**: any `Account ... sip:<user>@<host>` token, cut at
//!    whitespace with trailing punctuation trimmed
//!
//! Only the first tier that matches contributes an `AccountInfo`. Everything
//! here is pure: the same line always yields the same events.

use std::sync::LazyLock;

use regex::Regex;

use crate::event::{AckKind, Event};

/// Registration success phrasings. Every fragment of an entry must appear.
const REGISTRATION_PHRASES: &[&[&str]] = &[
    &["registration success", "status=200"],
    &["registration success", "OK"],
    &["REGISTER", "200 OK"],
    &["Registration success"],
];

/// Seen in status dumps once the account is online; only trusted when
/// re-checking history, since the dump is requested by us.
const ONLINE_STATUS_PHRASE: &str = "Online status: Online";

const INCOMING_CALL_PATTERNS: &[&str] = &["Incoming INVITE", "incoming call"];

/// "CONFIRMED" is the engine's name for an established dialog
const ESTABLISHED_PATTERNS: &[&str] = &[
    "Call established",
    "call connected",
    "Media active",
    "state changed to CONFIRMED",
    "Call state: CONFIRMED",
];

const DISCONNECTED_PATTERNS: &[&str] = &[
    "Call disconnected",
    "call disconnected",
    "Call state: DISCONNECTED",
];

const RINGING_PATTERNS: &[&str] = &["180 Ringing"];

/// Final response to our INVITE
const REMOTE_ANSWER_FRAGMENTS: &[&str] = &["200 OK", "INVITE"];

const DIAL_FAILURE_PATTERNS: &[&str] = &["Unable to make call"];

const ACK_PATTERNS: &[(&str, AckKind)] = &[
    ("Making call", AckKind::MakingCall),
    ("Sending INVITE", AckKind::InviteSent),
    ("BYE sent", AckKind::ByeSent),
    ("Media will be active soon", AckKind::MediaPending),
];

static PRIMARY_ACCOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\[\s*(\d+)\]\s+<?(sip:([^@\s<>]+)@([^:;>\s]+))")
        .expect("PRIMARY_ACCOUNT_RE should compile")
});

static FALLBACK_ACCOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Account\s+\d+:\s+<?sip:([^@\s<>]+)@([^:;>\s]+)")
        .expect("FALLBACK_ACCOUNT_RE should compile")
});

/// Which tier of the account cascade produced a match
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountTier {
    Primary,
    Fallback,
    Heuristic,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountMatch {
    pub tier: AccountTier,
    pub username: String,
    pub server: String,
    pub raw_uri: String,
}

/// Classify one line. Never empty: unmatched lines become `UnclassifiedLine`.
pub fn classify(line: &str) -> Vec<Event> {
    let mut events = Vec::new();

    if let Some(account) = extract_account(line) {
        events.push(Event::AccountInfo {
            username: account.username,
            server: account.server,
            raw_uri: account.raw_uri,
        });
    }

    if is_registration_success(line) {
        events.push(Event::RegistrationSucceeded);
    }
    if contains_any(line, INCOMING_CALL_PATTERNS) {
        events.push(Event::IncomingCall);
    }
    if contains_any(line, RINGING_PATTERNS) {
        events.push(Event::Ringing);
    }
    if contains_all(line, REMOTE_ANSWER_FRAGMENTS) {
        events.push(Event::RemoteAnswered);
    }
    if contains_any(line, ESTABLISHED_PATTERNS) {
        events.push(Event::CallEstablished);
    }
    if contains_any(line, DISCONNECTED_PATTERNS) {
        events.push(Event::CallDisconnected);
    }
    if contains_any(line, DIAL_FAILURE_PATTERNS) {
        events.push(Event::DialFailed {
            detail: line.trim().to_string(),
        });
    }
    for (pattern, kind) in ACK_PATTERNS {
        if line.contains(pattern) {
            events.push(Event::CommandAck { kind: *kind });
        }
    }

    if events.is_empty() {
        events.push(Event::UnclassifiedLine {
            text: line.to_string(),
        });
    }

    events
}

/// Run the account cascade; at most one tier answers
pub fn extract_account(line: &str) -> Option<AccountMatch> {
    if let Some(caps) = PRIMARY_ACCOUNT_RE.captures(line) {
        return Some(AccountMatch {
            tier: AccountTier::Primary,
            username: caps[3].to_string(),
            server: caps[4].to_string(),
            raw_uri: caps[2].to_string(),
        });
    }

    if let Some(caps) = FALLBACK_ACCOUNT_RE.captures(line) {
        let username = caps[1].to_string();
        let server = caps[2].to_string();
        return Some(AccountMatch {
            tier: AccountTier::Fallback,
            raw_uri: format!("sip:{}@{}", username, server),
            username,
            server,
        });
    }

    if line.contains("Account") && line.contains("sip:") {
        return extract_account_heuristic(line);
    }

    None
}

fn extract_account_heuristic(line: &str) -> Option<AccountMatch> {
    let start = line.find("sip:")?;
    let token = line[start..]
        .split_whitespace()
        .next()?
        .trim_end_matches([',', '.', ';', ':', '>']);

    let (username, host) = token.strip_prefix("sip:")?.split_once('@')?;
    let server = host.split([';', '>']).next().unwrap_or(host);
    if username.is_empty() || server.is_empty() {
        return None;
    }

    Some(AccountMatch {
        tier: AccountTier::Heuristic,
        username: username.to_string(),
        server: server.to_string(),
        raw_uri: format!("sip:{}@{}", username, server),
    })
}

pub fn is_registration_success(line: &str) -> bool {
    REGISTRATION_PHRASES
        .iter()
        .any(|fragments| contains_all(line, fragments))
}

/// Re-check a window of recent output for a registration that the per-line
/// detector missed, e.g. because the engine split the phrase over two lines.
pub fn history_indicates_registration<'a>(lines: impl IntoIterator<Item = &'a str>) -> bool {
    let joined = lines.into_iter().collect::<Vec<_>>().join("\n");
    is_registration_success(&joined) || joined.contains(ONLINE_STATUS_PHRASE)
}

fn contains_any(line: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| line.contains(p))
}

fn contains_all(line: &str, fragments: &[&str]) -> bool {
    fragments.iter().all(|f| line.contains(f))
}
