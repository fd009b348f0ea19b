pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 500_000;

/// Bounded text buffer for one subprocess stream.
///
/// The budget is counted in `char`s. Once the budget is exceeded the buffer
/// holds exactly `max_chars` characters and `truncated()` stays true for the
/// rest of the invocation.
#[derive(Debug, Clone)]
pub struct OutputAccumulator {
    text: String,
    chars: usize,
    max_chars: usize,
    truncated: bool,
}

impl OutputAccumulator {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            max_chars,
            truncated: false,
        }
    }

    pub fn append(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        if self.truncated {
            return;
        }
        let room = self.max_chars.saturating_sub(self.chars);
        let incoming = chunk.chars().count();
        if incoming <= room {
            self.text.push_str(chunk);
            self.chars += incoming;
            return;
        }
        let cut = nth_char_boundary(chunk, room);
        self.text.push_str(&chunk[..cut]);
        self.chars += room;
        self.truncated = true;
    }

    #[allow(dead_code)]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[allow(dead_code)]
    pub fn char_len(&self) -> usize {
        self.chars
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_parts(self) -> (String, bool) {
        (self.text, self.truncated)
    }
}

impl Default for OutputAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_CHARS)
    }
}

/// Incremental UTF-8 decoder for pipe reads.
///
/// A multi-byte sequence split across two reads is held back until the next
/// read completes it; bytes that can never form valid UTF-8 are replaced.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + bad);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            return out;
                        }
                    }
                }
            }
        }
    }

    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

fn nth_char_boundary(value: &str, nth: usize) -> usize {
    value
        .char_indices()
        .nth(nth)
        .map(|(idx, _)| idx)
        .unwrap_or(value.len())
}
