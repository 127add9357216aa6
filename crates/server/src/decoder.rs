//! Conversation log decoder
//!
//! Turns the full contents of one `<user>.log` file into its ordered message list.
//! Records are separated by boundary marker lines; files written before the marker
//! existed are decoded line-by-line, each header line starting a new record.
//! Decoding is pure: the same bytes always produce the same messages.

use chatwatch_protocol::{Message, Sender};
use chrono::{DateTime, NaiveDateTime};
use thiserror::Error;

/// Line written by the bot processes before every record.
pub const BOUNDARY_MARKER: &str = "#=====< MESSAGE BOUNDARY >=====#";

const ENTRY_SUFFIX: &str = " has entered the chat*";

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed log: {0}")]
    MalformedLog(String),
}

/// Result of decoding one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedLog {
    pub messages: Vec<Message>,
    /// Non-blank records whose first line is not a valid header
    pub skipped_records: usize,
}

/// Decode raw file bytes. Fails as a whole only when the bytes are not UTF-8.
pub fn decode(bytes: &[u8]) -> Result<DecodedLog, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|err| {
        DecodeError::MalformedLog(format!("invalid utf-8 at byte {}", err.valid_up_to()))
    })?;
    Ok(decode_str(text))
}

pub fn decode_str(text: &str) -> DecodedLog {
    let lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();

    let records = if lines.iter().any(|line| is_boundary(line)) {
        split_on_boundaries(&lines)
    } else {
        split_on_headers(&lines)
    };

    let mut decoded = DecodedLog::default();
    for record in records {
        if record.iter().all(|line| line.trim().is_empty()) {
            continue;
        }
        match decode_record(&record) {
            Some(message) => decoded.messages.push(message),
            None => decoded.skipped_records += 1,
        }
    }
    decoded
}

fn is_boundary(line: &str) -> bool {
    line.trim() == BOUNDARY_MARKER
}

fn split_on_boundaries<'a>(lines: &[&'a str]) -> Vec<Vec<&'a str>> {
    let mut records = Vec::new();
    let mut current = Vec::new();
    for line in lines {
        if is_boundary(line) {
            records.push(std::mem::take(&mut current));
        } else {
            current.push(*line);
        }
    }
    records.push(current);
    records
}

fn split_on_headers<'a>(lines: &[&'a str]) -> Vec<Vec<&'a str>> {
    let mut records = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in lines {
        if parse_header(line).is_some() && !current.is_empty() {
            records.push(std::mem::take(&mut current));
        }
        current.push(*line);
    }
    records.push(current);
    records
}

fn decode_record(lines: &[&str]) -> Option<Message> {
    let mut lines = lines.iter().skip_while(|line| line.trim().is_empty());
    let header = parse_header(lines.next()?)?;

    let mut content = header.body.to_string();
    for line in lines {
        content.push('\n');
        content.push_str(line);
    }
    let content = content.trim_end().to_string();

    let is_entry = is_entry_announcement(header.body);
    let sender = if is_entry {
        Sender::Bot
    } else {
        Sender::from_label(header.sender)
    };

    Some(Message {
        timestamp: header.timestamp.to_string(),
        parsed_at: parse_timestamp(header.timestamp),
        sender,
        content,
        is_entry,
    })
}

struct Header<'a> {
    timestamp: &'a str,
    sender: &'a str,
    body: &'a str,
}

/// `[<timestamp>] <sender>: <body>`; the sender ends at the first colon followed by whitespace.
fn parse_header(line: &str) -> Option<Header<'_>> {
    let rest = line.strip_prefix('[')?;
    let (timestamp, rest) = rest.split_once(']')?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();

    let (colon, _) = rest.match_indices(':').find(|(idx, _)| {
        rest[idx + 1..]
            .chars()
            .next()
            .is_some_and(char::is_whitespace)
    })?;
    let sender = rest[..colon].trim();
    if sender.is_empty() {
        return None;
    }

    Some(Header {
        timestamp: timestamp.trim(),
        sender,
        body: rest[colon + 1..].trim_start(),
    })
}

fn is_entry_announcement(body: &str) -> bool {
    let body = body.trim();
    body.len() > 1 + ENTRY_SUFFIX.len() && body.starts_with('*') && body.ends_with(ENTRY_SUFFIX)
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_utc())
        })
}
