//! Log redaction helpers.
//!
//! Control commands carry cookies, passwords and onion service keys. Every
//! command line passes through [`sanitize_command`] before it is logged, and
//! addresses and key material are wrapped in the `Redacted*` types when they
//! appear as tracing fields.

use std::fmt;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact an onion address, showing only the first 4 characters and the suffix.
pub struct RedactedOnion<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedOnion<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        match (s.get(..4), s.strip_suffix(".onion")) {
            (Some(head), Some(id)) if id.len() > 8 => write!(f, "{}...onion", head),
            (Some(head), None) if s.len() > 8 => write!(f, "{}...", head),
            _ => write!(f, "[REDACTED ONION]"),
        }
    }
}

impl<'a> fmt::Debug for RedactedOnion<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Mask secrets in a control command line.
///
/// `AUTHENTICATE <secret>` keeps only the verb. `ADD_ONION <key> ...` masks
/// the key blob but keeps `NEW:` requests and the port mappings. Any
/// `PrivateKey=` or `ClientAuth=` argument is masked.
pub fn sanitize_command(line: &str) -> String {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut words = line.split(' ');
    let verb = words.next().unwrap_or("");

    if verb.eq_ignore_ascii_case("AUTHENTICATE") {
        return if line.len() > verb.len() {
            format!("{} [REDACTED]", verb)
        } else {
            verb.to_string()
        };
    }

    let mut out = vec![verb.to_string()];
    for (i, word) in words.enumerate() {
        let masked = if i == 0
            && verb.eq_ignore_ascii_case("ADD_ONION")
            && !word.to_ascii_uppercase().starts_with("NEW:")
        {
            match word.split_once(':') {
                Some((kind, _)) => format!("{}:[REDACTED]", kind),
                None => "[REDACTED]".to_string(),
            }
        } else {
            match word.split_once('=') {
                Some((key, _))
                    if key.eq_ignore_ascii_case("PrivateKey")
                        || key.eq_ignore_ascii_case("ClientAuth")
                        || key.eq_ignore_ascii_case("ClientAuthV3") =>
                {
                    format!("{}=[REDACTED]", key)
                }
                _ => word.to_string(),
            }
        };
        out.push(masked);
    }
    out.join(" ")
}

/// Mask secrets in a reply line before it is logged.
pub fn sanitize_reply_line(line: &str) -> String {
    match line.split_once('=') {
        Some((key, _)) if key.ends_with("PrivateKey") => format!("{}=[REDACTED]", key),
        _ => line.to_string(),
    }
}
