//! Incremental Server-Sent Events parser.
//!
//! Bytes are buffered until a full line is available, so events and UTF-8
//! sequences split across socket reads are reassembled before dispatch.

use bytes::BytesMut;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if the server named the event.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(self.scanned + offset + 1);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                out.push(event);
            }
        }
        self.scanned = self.buf.len();
        out
    }

    /// Flush at end of input: a trailing line without a newline and any
    /// event not yet terminated by a blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.scanned = 0;
        if !self.buf.is_empty() {
            let rest = self.buf.split();
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                out.push(event);
            }
        }
        if let Some(event) = self.dispatch() {
            out.push(event);
        }
        out
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id / retry carry nothing the decoders use.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events() {
        let mut dec = SseDecoder::new();
        let events = dec.feed(b"event: ping\ndata: {}\n\nevent: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[1].data, r#"{"type":"message_stop"}"#);
    }

    #[test]
    fn reassembles_split_event_and_utf8() {
        let payload = "event: delta\ndata: {\"text\":\"héllo\"}\n\n".as_bytes();
        // Split in the middle of the two-byte 'é'.
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut dec = SseDecoder::new();
        assert!(dec.feed(&payload[..split]).is_empty());
        let events = dec.feed(&payload[split..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"héllo\"}");
    }

    #[test]
    fn byte_at_a_time() {
        let payload = b"data: one\r\ndata: two\r\n\r\n: comment\n\n";
        let mut dec = SseDecoder::new();
        let mut events = Vec::new();
        for b in payload.iter() {
            events.extend(dec.feed(std::slice::from_ref(b)));
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn long_data_line_in_small_reads() {
        let text = "y".repeat(10_000);
        let payload = format!("data: {text}\n\n");
        let mut dec = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in payload.as_bytes().chunks(5) {
            events.extend(dec.feed(chunk));
            assert_eq!(dec.scanned, dec.buf.len());
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, text);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b"event: message_stop\ndata: {}").is_empty());
        let events = dec.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_stop"));
        assert_eq!(events[0].data, "{}");
    }
}
