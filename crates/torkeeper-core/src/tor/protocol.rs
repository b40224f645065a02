//! Control protocol reply and event parsing.
//!
//! Replies are sequences of `NNN-text` mid lines, `NNN+text` data lines
//! followed by a dot-terminated block, and a final `NNN text` line.
//! Status `650` marks an asynchronous event.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// Status code of asynchronous event notifications.
pub const ASYNC_EVENT_CODE: u16 = 650;

/// One line of a reply, with its data block if it was a `+` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Three-digit status.
    pub code: u16,
    /// Text after the separator.
    pub text: String,
    /// Dot-unstuffed data block lines.
    pub data: Option<Vec<String>>,
}

/// A complete reply to one command, or one async event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status of the final line.
    pub code: u16,
    /// All lines in order, final line last.
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// 2xx status.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// `650` event notification.
    pub fn is_async(&self) -> bool {
        self.code == ASYNC_EVENT_CODE
    }

    /// Text of the final line.
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// Value of a `key=value` line, or the joined data block of `key=`.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lines.iter().find_map(|line| {
            let rest = line.text.strip_prefix(key)?.strip_prefix('=')?;
            match &line.data {
                Some(data) => Some(data.join("\n")),
                None => Some(rest.to_string()),
            }
        })
    }

    /// All values for a repeated key, e.g. several `ServiceID=` lines.
    pub fn values(&self, key: &str) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|line| line.text.strip_prefix(key)?.strip_prefix('='))
            .map(str::to_string)
            .collect()
    }

    /// Turn error statuses into [`Error::Protocol`].
    pub fn into_result(self) -> Result<Reply> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::Protocol {
                code: self.code,
                message: self.message().to_string(),
            })
        }
    }
}

/// Incremental reply assembler fed one line at a time.
#[derive(Debug, Default)]
pub struct ReplyParser {
    lines: Vec<ReplyLine>,
    data: Option<ReplyLine>,
}

impl ReplyParser {
    /// Feed a line without its CRLF. Returns a reply once the final line
    /// arrives.
    pub fn feed(&mut self, raw: &str) -> Result<Option<Reply>> {
        let raw = raw.trim_end_matches(['\r', '\n']);

        if let Some(mut pending) = self.data.take() {
            if raw == "." {
                self.lines.push(pending);
            } else {
                let unstuffed = raw.strip_prefix('.').unwrap_or(raw);
                if let Some(data) = pending.data.as_mut() {
                    data.push(unstuffed.to_string());
                }
                self.data = Some(pending);
            }
            return Ok(None);
        }

        if raw.is_empty() {
            return Ok(None);
        }

        let code = raw
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| malformed(raw))?;
        let separator = raw.as_bytes().get(3).copied().unwrap_or(b' ');
        let text = raw.get(4..).unwrap_or("").to_string();

        match separator {
            b'-' => {
                self.lines.push(ReplyLine { code, text, data: None });
                Ok(None)
            }
            b'+' => {
                self.data = Some(ReplyLine {
                    code,
                    text,
                    data: Some(Vec::new()),
                });
                Ok(None)
            }
            b' ' => {
                self.lines.push(ReplyLine { code, text, data: None });
                Ok(Some(Reply {
                    code,
                    lines: std::mem::take(&mut self.lines),
                }))
            }
            _ => Err(malformed(raw)),
        }
    }
}

fn malformed(line: &str) -> Error {
    Error::Protocol {
        code: 0,
        message: format!("malformed reply line: {:?}", line),
    }
}

/// Parse `KEY=value KEY="quoted \"value\""` arguments.
///
/// Positional words without `=` are skipped. Later keys win.
pub fn parse_keywords(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| !c.is_whitespace() && *c != '=') {
            key.push(c);
        }
        if chars.next_if_eq(&'=').is_none() {
            continue;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }
        out.insert(key, value);
    }

    out
}

/// Quote a string for use as a control protocol argument.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Event types this crate subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// `STATUS_CLIENT`, which carries bootstrap progress.
    StatusClient,
    /// `STATUS_GENERAL`.
    StatusGeneral,
    /// Any other event keyword.
    Other(String),
}

impl EventKind {
    /// Keyword used in `SETEVENTS` and `650` lines.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::StatusClient => "STATUS_CLIENT",
            EventKind::StatusGeneral => "STATUS_GENERAL",
            EventKind::Other(name) => name,
        }
    }

    fn from_keyword(s: &str) -> Self {
        match s {
            "STATUS_CLIENT" => EventKind::StatusClient,
            "STATUS_GENERAL" => EventKind::StatusGeneral,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// `NOTICE`
    Notice,
    /// `WARN`
    Warn,
    /// `ERR`
    Err,
}

impl Severity {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "NOTICE" => Some(Severity::Notice),
            "WARN" => Some(Severity::Warn),
            "ERR" => Some(Severity::Err),
            _ => None,
        }
    }
}

/// An asynchronous `650` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    /// Event keyword.
    pub kind: EventKind,
    /// Everything after the keyword on the first line.
    pub body: String,
    /// Data block lines, if the event had any.
    pub data: Vec<String>,
}

impl ControlEvent {
    /// Build from an async reply. `None` if the reply is not an event.
    pub fn from_reply(reply: &Reply) -> Option<Self> {
        if !reply.is_async() {
            return None;
        }
        let first = reply.lines.first()?;
        let (keyword, body) = first
            .text
            .split_once(' ')
            .unwrap_or((first.text.as_str(), ""));
        Some(Self {
            kind: EventKind::from_keyword(keyword),
            body: body.to_string(),
            data: reply
                .lines
                .iter()
                .filter_map(|l| l.data.clone())
                .flatten()
                .collect(),
        })
    }
}

/// A bootstrap progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStatus {
    /// Severity of the report.
    pub severity: Severity,
    /// Percentage 0..=100.
    pub progress: u8,
    /// Machine-readable phase tag.
    pub tag: String,
    /// Human-readable phase summary.
    pub summary: String,
    /// Problem description on WARN/ERR reports.
    pub warning: Option<String>,
    /// Daemon's advice on whether to surface the problem (`ignore` or `warn`).
    pub recommendation: Option<String>,
}

impl BootstrapStatus {
    /// Parse a `STATUS_CLIENT ... BOOTSTRAP` event.
    pub fn from_event(event: &ControlEvent) -> Option<Self> {
        if event.kind != EventKind::StatusClient {
            return None;
        }
        Self::parse(&event.body)
    }

    /// Parse `<SEVERITY> BOOTSTRAP PROGRESS=n ...`, the form shared by
    /// events and `GETINFO status/bootstrap-phase`.
    pub fn parse(body: &str) -> Option<Self> {
        let mut words = body.splitn(3, ' ');
        let severity = Severity::parse(words.next()?)?;
        if words.next()? != "BOOTSTRAP" {
            return None;
        }
        let args = parse_keywords(words.next().unwrap_or(""));
        let progress = args.get("PROGRESS")?.parse::<u8>().ok()?.min(100);

        Some(Self {
            severity,
            progress,
            tag: args.get("TAG").cloned().unwrap_or_default(),
            summary: args.get("SUMMARY").cloned().unwrap_or_default(),
            warning: args.get("WARNING").cloned(),
            recommendation: args.get("RECOMMENDATION").cloned(),
        })
    }

    /// Whether bootstrapping finished.
    pub fn is_done(&self) -> bool {
        self.progress >= super::BOOTSTRAP_DONE
    }

    /// Whether this report ends the attempt as failed.
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Err
    }
}
