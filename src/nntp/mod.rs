//! NNTP sessions
//!
//! The wire protocol is spoken by [`nntp_rs::NntpClient`]; this module owns the
//! session state machine around it ([`Connection`]) and turns client errors
//! into [`FetchError`]s.

mod connection;

pub use connection::{Connection, ConnectionState};

use crate::error::FetchError;
use nntp_rs::NntpError;

/// Substrings that mark an article as removed by the host
pub const REMOVAL_MARKERS: [&str; 4] = ["dmca", "removed", "cancel", "blocked"];

/// First removal marker found in `text` (expected lowercase)
pub fn contains_removal_marker(text: &str) -> Option<&'static str> {
    REMOVAL_MARKERS.iter().copied().find(|m| text.contains(m))
}

/// Wire form of a message id: angle brackets added when missing
pub(crate) fn bracketed(message_id: &str) -> String {
    if message_id.starts_with('<') {
        message_id.to_string()
    } else {
        format!("<{message_id}>")
    }
}

fn is_missing_text(lower: &str) -> bool {
    lower.contains("no such article")
}

/// Map a client error raised by an article command
pub fn fetch_error(err: &NntpError) -> FetchError {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    match err {
        NntpError::Protocol {
            code: 480..=482 | 502,
            ..
        } => FetchError::AuthRejected(text),
        NntpError::NoSuchArticle(_)
        | NntpError::Protocol {
            code: 411 | 423 | 430,
            ..
        } => match contains_removal_marker(&lower) {
            Some(_) => FetchError::Removed(text),
            None => FetchError::NotFoundHere,
        },
        _ => match contains_removal_marker(&lower) {
            Some(marker) => FetchError::Removed(format!("{text} ({marker})")),
            None if is_missing_text(&lower) => FetchError::NotFoundHere,
            None => FetchError::TransportFailure(text),
        },
    }
}

/// Map a client error raised while authenticating
pub fn auth_error(err: &NntpError) -> FetchError {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    match err {
        NntpError::Protocol {
            code: 480..=482 | 502,
            ..
        } => FetchError::AuthRejected(text),
        _ if lower.contains("auth") && !lower.contains("timed out") => {
            FetchError::AuthRejected(text)
        }
        _ => FetchError::TransportFailure(format!("authentication: {text}")),
    }
}
