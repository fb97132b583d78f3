/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes may split UTF-8 sequences and events arbitrarily; complete events are
/// returned as the concatenated `data:` payload of each event.
#[derive(Default)]
pub(crate) struct SseDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.byte_buf.extend_from_slice(bytes);
        self.decode_available();
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut payloads = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let event_text: String = self.buffer.drain(..event_end + 2).collect();

            let mut data = String::new();
            for line in event_text.lines() {
                if let Some(payload) = line.strip_prefix("data: ") {
                    data.push_str(payload);
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data.push_str(payload);
                }
            }

            if !data.is_empty() {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Move decoded text from `byte_buf` to `buffer`. A sequence cut off at the
    /// end waits for more bytes; an invalid byte becomes U+FFFD.
    fn decode_available(&mut self) {
        loop {
            match std::str::from_utf8(&self.byte_buf) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.byte_buf.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.byte_buf[..valid]));
                    match e.error_len() {
                        None => {
                            self.byte_buf.drain(..valid);
                            return;
                        }
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.byte_buf.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_event_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: x\ndata: {\"a\"").is_empty());
        let out = decoder.push(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_invalid_byte_does_not_stall_later_events() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(b"data: a\xffb\n\n"), vec!["a\u{FFFD}b".to_string()]);
        assert_eq!(decoder.push(b"data: ok\n\n"), vec!["ok".to_string()]);
        assert_eq!(decoder.push(b"data: [DONE]\n\n"), vec!["[DONE]".to_string()]);
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: x\r\n\r").is_empty());
        assert_eq!(decoder.push(b"\n"), vec!["x".to_string()]);
    }

    #[test]
    fn test_split_utf8_sequence() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: héllo\r\n\r\n".as_bytes();
        // 'é' is two bytes; split in the middle of it
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec!["héllo".to_string()]);
    }
}
