//! Server-Sent Events decoding.
//!
//! Reads a `reqwest::Response` as a byte stream, splits it on blank-line
//! event boundaries, and yields one [`SseEvent`] per event. Both the `sse`
//! transport (long-lived GET) and the streamable-HTTP transport (SSE-framed
//! POST replies) use this.

use futures::stream::{self, Stream, StreamExt};

/// One decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

/// Incremental decoder. Feed it raw body chunks; it returns every event
/// completed by that chunk.
///
/// Bytes are buffered until a blank line closes an event, and only the
/// complete block is decoded as UTF-8, so a character split across chunks
/// survives intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// A `\r` ended the previous chunk; its `\n` may start the next one.
    pending_cr: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and drain all complete events.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<SseEvent> {
        // Line endings (`\r\n`, `\r`, `\n`) are normalized to `\n`.
        for &byte in chunk.as_ref() {
            if std::mem::take(&mut self.pending_cr) {
                self.buffer.push(b'\n');
                if byte == b'\n' {
                    continue;
                }
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                self.buffer.push(byte);
            }
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|pair| pair == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.pending_cr = false;
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        if rest.trim().is_empty() {
            return None;
        }
        parse_block(&rest)
    }
}

/// Parse one event block. Comment-only and empty blocks (keep-alives)
/// yield `None`.
fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => event.event = Some(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            _ => {} // retry and unknown fields
        }
    }

    if data_lines.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

/// Decode an HTTP response body as a stream of events.
///
/// The stream ends when the body ends; a read error is yielded once as
/// `Err(reason)` and then the stream ends.
pub fn event_stream(response: reqwest::Response) -> impl Stream<Item = Result<SseEvent, String>> {
    let byte_stream = response.bytes_stream().boxed();
    let queue: std::collections::VecDeque<SseEvent> = std::collections::VecDeque::new();

    stream::unfold(
        (Some(byte_stream), SseDecoder::new(), queue),
        |(mut byte_stream, mut decoder, mut queue)| async move {
            loop {
                if let Some(event) = queue.pop_front() {
                    return Some((Ok(event), (byte_stream, decoder, queue)));
                }

                let next = match byte_stream.as_mut() {
                    Some(body) => body.next().await,
                    None => return None,
                };
                match next {
                    Some(Ok(bytes)) => queue.extend(decoder.push(&bytes)),
                    Some(Err(e)) => {
                        return Some((
                            Err(format!("stream read error: {e}")),
                            (None, decoder, queue),
                        ));
                    }
                    None => {
                        // Body ended; emit any unterminated trailing event.
                        byte_stream = None;
                        if let Some(event) = decoder.finish() {
                            return Some((Ok(event), (byte_stream, decoder, queue)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("data: {\"id\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"id\":1}");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("event: endpoint\nda").is_empty());
        assert!(decoder.push("ta: /messages?sessionId=abc\n").is_empty());
        let events = decoder.push("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?sessionId=abc");
    }

    #[test]
    fn test_keep_alive_comments_ignored() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(": ping\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_multiline_data_and_crlf() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("id: 9\r\ndata: a\r\ndata:b\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].id.as_deref(), Some("9"));
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: tail").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let payload = "data: {\"text\":\"café\"}\n\n".as_bytes();
        // Split inside the two-byte encoding of 'é' (0xC3 0xA9).
        let split = payload.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&payload[..split]).is_empty());
        let events = decoder.push(&payload[split..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"café\"}");
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: a\r").is_empty());
        assert!(decoder.push("\n\r").is_empty());
        let events = decoder.push("\ndata: b\r\n\r\n");
        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b"]);
    }

    #[test]
    fn test_multiple_events_one_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("data: 1\n\ndata: 2\n\nevent: message\ndata: 3\n\n");
        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["1", "2", "3"]);
    }
}
