use crate::pool::{Recycle, Recycler};

pub const REPLACEMENT_CHAR: char = '\u{FFFD}';

pub type DecoderPool = Recycler<DecodeBuffer>;

/// Streaming byte-to-text state for one request.
///
/// Tokens do not have to end on character boundaries (emoji, CJK, ...), so
/// bytes are accumulated until every started character is complete. Text
/// decoded in the meantime is withheld so a chunk never ends mid-character.
#[derive(Debug, Default)]
pub struct DecodeBuffer {
    pending: Vec<u8>,
    text: String,
}

impl DecodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the bytes of one token. Returns the withheld text once no
    /// partial character remains, `None` while one is still incomplete.
    /// Invalid byte sequences come out as U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        self.drain_complete();
        if self.pending.is_empty() {
            Some(std::mem::take(&mut self.text))
        } else {
            None
        }
    }

    fn drain_complete(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.text.push(REPLACEMENT_CHAR);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // truncated character at the end; wait for more bytes
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Flush everything, marking a dangling partial character with U+FFFD.
    pub fn finish(&mut self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut out = std::mem::take(&mut self.text);
        if !self.pending.is_empty() {
            out.push(REPLACEMENT_CHAR);
            self.pending.clear();
        }
        Some(out)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.text.is_empty()
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Recycle for DecodeBuffer {
    fn recycle(&mut self) {
        self.pending.clear();
        self.text.clear();
    }
}

pub fn new_decoder_pool() -> DecoderPool {
    Recycler::new(DecodeBuffer::new)
}
