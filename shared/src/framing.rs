//! Message framing on the raw TCP byte stream.
//!
//! The legacy wire format has no length prefix or delimiter: a message is the
//! first `{ ... }` span found in a single read. That framing is lossy. A
//! message split across two reads is dropped, two messages merged into one
//! read lose everything after the first, and a `}` inside a string value ends
//! the frame early. [`Framing::Brace`] keeps that behaviour for compatibility;
//! [`Framing::Newline`] is an opt-in mode with explicit boundaries.

use crate::MSG_SIZE;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Result of scanning one read for a brace-delimited message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// The inclusive span from the first `{` to the first `}` after it.
    Complete(&'a [u8]),
    /// No `{`, or no `}` after it.
    NoFrame,
}

/// Why a framed span was not accepted as a message.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Finds the first brace-delimited span in one read.
///
/// Nesting is not tracked, so the span ends at the first `}` after the `{`.
pub fn extract_frame(data: &[u8]) -> Frame<'_> {
    let Some(start) = data.iter().position(|&b| b == b'{') else {
        return Frame::NoFrame;
    };

    match data[start..].iter().position(|&b| b == b'}') {
        Some(offset) => Frame::Complete(&data[start..=start + offset]),
        None => Frame::NoFrame,
    }
}

/// Decodes a framed span into a JSON object.
pub fn parse_frame(frame: &[u8]) -> Result<Map<String, Value>, FrameError> {
    let text = std::str::from_utf8(frame)?;
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(FrameError::NotAnObject),
    }
}

/// How message boundaries are found on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// First `{...}` span per read; everything else in the read is discarded.
    #[default]
    Brace,
    /// One message per `\n`-terminated line, buffered across reads.
    Newline,
}

impl Framing {
    /// Terminates an outgoing message according to this framing.
    pub fn seal(self, mut payload: Vec<u8>) -> Vec<u8> {
        if self == Framing::Newline {
            payload.push(b'\n');
        }
        payload
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "brace" => Ok(Framing::Brace),
            "newline" | "lines" => Ok(Framing::Newline),
            other => Err(format!(
                "unknown framing '{other}', expected 'brace' or 'newline'"
            )),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Brace => write!(f, "brace"),
            Framing::Newline => write!(f, "newline"),
        }
    }
}

/// Turns raw reads into candidate message frames.
#[derive(Debug)]
pub struct Framer {
    mode: Framing,
    pending: Vec<u8>,
    /// Set after an overlong line was dropped; bytes are skipped up to and
    /// including the next `\n`.
    discarding: bool,
}

impl Framer {
    /// Creates a framer with nothing buffered.
    pub fn new(mode: Framing) -> Self {
        Self {
            mode,
            pending: Vec::new(),
            discarding: false,
        }
    }

    /// Framing this framer applies, also used to seal outgoing payloads.
    pub fn mode(&self) -> Framing {
        self.mode
    }

    /// Feeds one read and returns the frames it completed.
    ///
    /// Never waits for more data: a partial message yields no frame. In
    /// newline mode the partial tail is kept for the next read. A line longer
    /// than `MSG_SIZE` is dropped in full, including the part that arrives
    /// in later reads.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        match self.mode {
            Framing::Brace => match extract_frame(chunk) {
                Frame::Complete(span) => vec![span.to_vec()],
                Frame::NoFrame => Vec::new(),
            },
            Framing::Newline => {
                let mut chunk = chunk;
                if self.discarding {
                    match chunk.iter().position(|&b| b == b'\n') {
                        Some(end) => {
                            self.discarding = false;
                            chunk = &chunk[end + 1..];
                        }
                        None => return Vec::new(),
                    }
                }
                self.pending.extend_from_slice(chunk);

                let mut frames = Vec::new();
                while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = self.pending.drain(..=end).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if !line.is_empty() && line.len() <= MSG_SIZE {
                        frames.push(line);
                    }
                }

                if self.pending.len() > MSG_SIZE {
                    self.pending.clear();
                    self.discarding = true;
                }
                frames
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_simple_message() {
        let data = br#"{"object":"player","rotation":1}"#;
        assert_eq!(extract_frame(data), Frame::Complete(&data[..]));
    }

    #[test]
    fn test_extract_skips_leading_and_trailing_noise() {
        let data = br#"garbage{"a":1}tail"#;
        assert_eq!(extract_frame(data), Frame::Complete(&br#"{"a":1}"#[..]));
    }

    #[test]
    fn test_extract_without_braces() {
        assert_eq!(extract_frame(b"hello there"), Frame::NoFrame);
        assert_eq!(extract_frame(b""), Frame::NoFrame);
    }

    #[test]
    fn test_extract_unterminated_message() {
        assert_eq!(extract_frame(br#"{"object":"pla"#), Frame::NoFrame);
    }

    #[test]
    fn test_extract_ignores_closing_brace_before_opening() {
        assert_eq!(extract_frame(b"}{}"), Frame::Complete(&b"{}"[..]));
        assert_eq!(extract_frame(b"} {"), Frame::NoFrame);
    }

    #[test]
    fn test_extract_stops_at_first_closing_brace() {
        // Nested objects are cut short; the known limitation of brace framing.
        let data = br#"{"a":{"b":1}}"#;
        let Frame::Complete(span) = extract_frame(data) else {
            panic!("expected a frame");
        };
        assert_eq!(span, br#"{"a":{"b":1}"#);
        assert!(parse_frame(span).is_err());
    }

    #[test]
    fn test_extract_takes_only_first_of_merged_messages() {
        let data = br#"{"n":1}{"n":2}"#;
        assert_eq!(extract_frame(data), Frame::Complete(&br#"{"n":1}"#[..]));
    }

    #[test]
    fn test_parse_valid_object() {
        let map = parse_frame(br#"{"object":"player","health":50}"#).unwrap();
        assert_eq!(map.get("object").and_then(Value::as_str), Some("player"));
        assert_eq!(map.get("health").and_then(Value::as_i64), Some(50));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(matches!(
            parse_frame(b"{not json}"),
            Err(FrameError::Json(_))
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_utf8() {
        assert!(matches!(
            parse_frame(&[b'{', 0xff, 0xfe, b'}']),
            Err(FrameError::NotUtf8(_))
        ));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(matches!(parse_frame(b"[1,2]"), Err(FrameError::NotAnObject)));
    }

    #[test]
    fn test_brace_framer_is_stateless_between_reads() {
        let mut framer = Framer::new(Framing::Brace);

        assert!(framer.push(br#"{"object":"pla"#).is_empty());
        // The tail of a split message does not combine with the head.
        assert!(framer.push(br#"yer"}"#).is_empty());
        assert_eq!(framer.push(br#"{"ok":true}"#), vec![br#"{"ok":true}"#.to_vec()]);
    }

    #[test]
    fn test_newline_framer_reassembles_split_lines() {
        let mut framer = Framer::new(Framing::Newline);

        assert!(framer.push(br#"{"object":"pla"#).is_empty());
        assert_eq!(
            framer.push(b"yer\"}\r\n{\"n\":2}\n{\"n\""),
            vec![br#"{"object":"player"}"#.to_vec(), br#"{"n":2}"#.to_vec()]
        );
        assert_eq!(framer.push(b":3}\n"), vec![br#"{"n":3}"#.to_vec()]);
    }

    #[test]
    fn test_newline_framer_drops_oversized_tail() {
        let mut framer = Framer::new(Framing::Newline);

        assert!(framer.push(&[b'x'; MSG_SIZE + 1]).is_empty());
        assert_eq!(framer.push(b"xx\n{}\n"), vec![b"{}".to_vec()]);
    }

    #[test]
    fn test_newline_framer_discards_rest_of_overlong_line() {
        let mut framer = Framer::new(Framing::Newline);

        assert!(framer.push(&[b'x'; MSG_SIZE + 1]).is_empty());
        // Still the same line: neither a brace span nor a later read revives it.
        assert!(framer.push(br#"{"object":"player","health":1}"#).is_empty());
        assert!(framer.push(b"{\"n\":1}\n").is_empty());
        assert_eq!(framer.push(b"{\"n\":2}\n"), vec![br#"{"n":2}"#.to_vec()]);
    }

    #[test]
    fn test_newline_framer_drops_overlong_complete_line() {
        let mut framer = Framer::new(Framing::Newline);

        // Fits the buffer on its own, but the line runs on past `MSG_SIZE`.
        assert!(framer.push(&[b'x'; MSG_SIZE]).is_empty());
        assert_eq!(
            framer.push(b"yy\n{\"n\":3}\n"),
            vec![br#"{"n":3}"#.to_vec()]
        );
    }

    #[test]
    fn test_framing_seal_and_parse() {
        assert_eq!(Framing::Brace.seal(b"{}".to_vec()), b"{}".to_vec());
        assert_eq!(Framing::Newline.seal(b"{}".to_vec()), b"{}\n".to_vec());
        assert_eq!("newline".parse::<Framing>(), Ok(Framing::Newline));
        assert_eq!("BRACE".parse::<Framing>(), Ok(Framing::Brace));
        assert!("json".parse::<Framing>().is_err());
        assert_eq!(Framing::default().to_string(), "brace");
    }
}
