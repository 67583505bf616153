//! AT command/response parsing and formatting for the HFP/HSP service level connection.
//!
//! One OS read fills a fixed buffer; [parse] then walks it sequentially, splitting on `\r\n`
//! and classifying each line into a `{type, command, value}` tuple. A malformed line returns
//! `EBADMSG` and preserves the unparsed remainder so the caller can retry once more input
//! arrives.

use std::io::{Error, ErrorKind, Result};

/// The syntactic shape of one parsed AT line, per the HFP/HSP AT command grammar.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AtType {
    /// `AT+CMD=?` — test whether a command is supported and its value range.
    Test,
    /// `AT+CMD?` — read the command's current value.
    Get,
    /// `AT+CMD=value` — set the command's value.
    Set,
    /// `AT+CMD` — execute a command with no value.
    Cmd,
    /// A bare numeric response code (e.g. `0`, `4`) with no `+` command name.
    Raw,
    /// `+CMD: value` — an unsolicited result code or command response.
    Resp,
}

/// One parsed AT message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AtMessage {
    pub kind: AtType,
    pub command: String,
    pub value: String,
}

impl AtMessage {
    fn new(kind: AtType, command: &str, value: &str) -> Self {
        Self { kind, command: command.to_uppercase(), value: value.to_string() }
    }
}

/// Parses every complete `\r\n`-terminated line out of `buf`, returning the parsed messages and
/// the byte offset of the first unconsumed (incomplete or malformed) line.
pub fn parse(buf: &[u8]) -> Result<(Vec<AtMessage>, usize)> {
    let text = std::str::from_utf8(buf).map_err(|_| Error::new(ErrorKind::InvalidData, "AT message is not valid UTF-8"))?;
    let mut messages = Vec::new();
    let mut consumed = 0;
    let mut rest = text;
    while let Some(idx) = rest.find("\r\n") {
        let line = &rest[..idx];
        consumed += idx + 2;
        rest = &rest[idx + 2..];
        if line.is_empty() {
            continue;
        }
        messages.push(parse_line(line)?);
    }
    Ok((messages, consumed))
}

fn parse_line(line: &str) -> Result<AtMessage> {
    let line = line.trim();
    let bad = || Error::new(ErrorKind::InvalidData, format!("malformed AT line: {line:?}"));

    if let Some(body) = line.strip_prefix("AT+").or_else(|| line.strip_prefix("at+")) {
        if let Some(cmd) = body.strip_suffix("=?") {
            return Ok(AtMessage::new(AtType::Test, cmd, ""));
        }
        if let Some(cmd) = body.strip_suffix('?') {
            return Ok(AtMessage::new(AtType::Get, cmd, ""));
        }
        if let Some((cmd, value)) = body.split_once('=') {
            return Ok(AtMessage::new(AtType::Set, cmd, value));
        }
        if !body.is_empty() {
            return Ok(AtMessage::new(AtType::Cmd, body, ""));
        }
        return Err(bad());
    }
    if let Some(body) = line.strip_prefix('+') {
        let (cmd, value) = body.split_once(':').map(|(c, v)| (c, v.trim())).unwrap_or((body, ""));
        return Ok(AtMessage::new(AtType::Resp, cmd, value));
    }
    if line.chars().all(|c| c.is_ascii_digit()) {
        return Ok(AtMessage::new(AtType::Raw, "", line));
    }
    Err(bad())
}

/// Formats a command/response line for transmission, adding the `\r\n` framing every AT message
/// needs.
pub fn format_line(line: &str) -> String {
    format!("\r\n{line}\r\n")
}

/// The standard "ERROR" response sent when a command has no dispatch table entry.
pub fn error_response() -> String {
    format_line("ERROR")
}

/// The standard "OK" response sent after a command completes successfully.
pub fn ok_response() -> String {
    format_line("OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_test_get_set_and_cmd_forms() {
        let (messages, consumed) = parse(b"AT+BRSF=?\r\nAT+BRSF?\r\nAT+BRSF=756\r\nAT+CLCC\r\n").unwrap();
        assert_eq!(consumed, b"AT+BRSF=?\r\nAT+BRSF?\r\nAT+BRSF=756\r\nAT+CLCC\r\n".len());
        assert_eq!(messages[0], AtMessage::new(AtType::Test, "BRSF", ""));
        assert_eq!(messages[1], AtMessage::new(AtType::Get, "BRSF", ""));
        assert_eq!(messages[2], AtMessage::new(AtType::Set, "BRSF", "756"));
        assert_eq!(messages[3], AtMessage::new(AtType::Cmd, "CLCC", ""));
    }

    #[test]
    fn parses_unsolicited_response_and_raw_code() {
        let (messages, _) = parse(b"+CIEV: 1,1\r\n0\r\n").unwrap();
        assert_eq!(messages[0], AtMessage::new(AtType::Resp, "CIEV", "1,1"));
        assert_eq!(messages[1], AtMessage::new(AtType::Raw, "", "0"));
    }

    #[test]
    fn leaves_an_incomplete_trailing_line_unconsumed() {
        let (messages, consumed) = parse(b"AT+BRSF=756\r\nAT+CI").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(consumed, b"AT+BRSF=756\r\n".len());
    }

    #[test]
    fn rejects_a_malformed_line() {
        assert!(parse(b"garbage\r\n").is_err());
    }
}
