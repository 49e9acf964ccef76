//! Incremental parser of `text/event-stream` bodies.

use log::warn;

/// Longer lines are dropped.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// One server-sent event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Event {
    /// Event type. Empty when the server did not send an `event:` field.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Skipping the rest of an overlong line.
    overlong: bool,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser::default()
    }

    /// Feed a body chunk and return the events completed by it.
    ///
    /// Chunks may split lines and UTF-8 sequences anywhere. A line longer than
    /// [`MAX_LINE_LEN`] bytes is dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Event> {
        const FN_NAME: &'static str = "SseParser::push";

        self.buffer.extend_from_slice(chunk);

        let mut events = vec![];
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            if self.overlong {
                self.overlong = false;
                continue;
            }
            let line = String::from_utf8_lossy(&line[..line_end]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.feed_line(line) {
                events.push(event);
            }
        }
        if self.buffer.len() > MAX_LINE_LEN {
            if !self.overlong {
                warn!("[{}] line longer than {} bytes, drop", FN_NAME, MAX_LINE_LEN);
            }
            self.overlong = true;
            self.buffer.clear();
        }
        events
    }

    fn feed_line(&mut self, line: &str) -> Option<Event> {
        if line.len() == 0 {
            if self.event.len() == 0 && self.data.len() == 0 {
                return None;
            }
            let event = Event {
                event: std::mem::take(&mut self.event),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            None => (line, ""),
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        };
        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            _ => (),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event: &str, data: &str) -> Event {
        Event {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn parse_events() {
        let mut parser = SseParser::new();
        let body = b"event: put\ndata: {\"path\":\"/\",\"data\":\"TURNOFFALL\"}\n\nevent: keep-alive\ndata: null\n\n";
        assert_eq!(
            parser.push(body),
            vec![
                event("put", "{\"path\":\"/\",\"data\":\"TURNOFFALL\"}"),
                event("keep-alive", "null"),
            ]
        );
    }

    #[test]
    fn parse_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: pu").is_empty());
        assert!(parser.push(b"t\r\ndata: \"TOG").is_empty());
        assert!(parser.push(b"GLE:1:ON\"\r\n").is_empty());
        assert_eq!(
            parser.push(b"\r\n"),
            vec![event("put", "\"TOGGLE:1:ON\"")]
        );
    }

    #[test]
    fn parse_split_utf8() {
        let mut parser = SseParser::new();
        let body = "data: \u{00e9}\n\n".as_bytes();
        assert!(parser.push(&body[..7]).is_empty());
        assert_eq!(parser.push(&body[7..]), vec![event("", "\u{00e9}")]);
    }

    #[test]
    fn parse_multi_line_data_and_comments() {
        let mut parser = SseParser::new();
        let body = b": comment\n\ndata: a\ndata:b\nid: 3\n\n";
        assert_eq!(parser.push(body), vec![event("", "a\nb")]);
    }

    #[test]
    fn drop_overlong_line() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: ").is_empty());
        for _ in 0..4 {
            assert!(parser.push(&vec![b'x'; MAX_LINE_LEN]).is_empty());
            assert!(parser.buffer.len() <= MAX_LINE_LEN);
        }
        assert!(parser.push(b"xx\n\n").is_empty());
        assert_eq!(
            parser.push(b"event: put\ndata: \"TURNOFFALL\"\n\n"),
            vec![event("put", "\"TURNOFFALL\"")]
        );
    }
}
