// Incremental text/event-stream decoder
//
// Chunks arrive split at arbitrary byte boundaries; complete lines are
// folded into frames and a blank line dispatches the pending event.

/// One dispatched event block
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// `event:` field, "message" when absent
    pub event: String,
    /// `data:` lines joined with '\n'
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Event(RawEvent),
    /// `:` line, used by servers as a heartbeat
    Comment(String),
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseFrame::Comment(comment.trim_start().to_string()));
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => self.retry = value.trim().parse().ok(),
            _ => {} // unknown fields are ignored
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        let id = self.id.take();
        let retry = self.retry.take();

        if event.is_none() && data.is_empty() {
            return None;
        }
        Some(SseFrame::Event(RawEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
            id,
            retry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(frames: Vec<SseFrame>) -> Vec<RawEvent> {
        frames
            .into_iter()
            .filter_map(|f| match f {
                SseFrame::Event(e) => Some(e),
                SseFrame::Comment(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_default_event_name_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let got = events(decoder.feed(b"data: {\"a\":\ndata: 1}\n\n"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event, "message");
        assert_eq!(got[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn test_chunks_split_mid_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: deliv").is_empty());
        assert!(decoder.feed(b"ery\r\ndata: {\"messageId\":\"m1\"}\r\n").is_empty());
        let got = events(decoder.feed(b"\r\n"));
        assert_eq!(got[0].event, "delivery");
        assert_eq!(got[0].data, "{\"messageId\":\"m1\"}");
    }

    #[test]
    fn test_comment_heartbeat() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b": heartbeat\n\n");
        assert_eq!(frames, vec![SseFrame::Comment("heartbeat".to_string())]);
    }

    #[test]
    fn test_named_event_without_data_still_dispatches() {
        let mut decoder = SseDecoder::new();
        let got = events(decoder.feed(b"event: ping\n\n"));
        assert_eq!(got[0].event, "ping");
        assert_eq!(got[0].data, "");
    }

    #[test]
    fn test_id_and_retry_fields() {
        let mut decoder = SseDecoder::new();
        let got = events(decoder.feed(b"id: 7\nretry: 3000\ndata: x\n\n"));
        assert_eq!(got[0].id.as_deref(), Some("7"));
        assert_eq!(got[0].retry, Some(3000));
    }

    #[test]
    fn test_blank_lines_alone_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\n\n\n").is_empty());
    }
}
