//! Incremental UTF-8 decoding for byte streams.
//!
//! Network reads split the body at arbitrary byte offsets, so a multi-byte
//! character can straddle two reads. The decoder holds back an incomplete
//! trailing sequence until the next read completes it, and only treats it as
//! invalid on [`Utf8StreamDecoder::finish`].

use thiserror::Error;

const REPLACEMENT: char = '\u{FFFD}';

/// Invalid UTF-8 in fatal mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid UTF-8 at byte {offset} of the response stream")]
pub struct DecodeError {
    /// Offset of the first offending byte from the start of the stream.
    pub offset: u64,
}

/// Stateful UTF-8 decoder.
///
/// In the default (lossy) mode every maximal invalid subsequence becomes one
/// U+FFFD, which matches `String::from_utf8_lossy` on the concatenated input
/// no matter how the input was split.
///
/// ```
/// use promptrelay::client::Utf8StreamDecoder;
///
/// let bytes = "héllo".as_bytes();
/// let mut decoder = Utf8StreamDecoder::new();
/// let mut text = decoder.decode(&bytes[..2]).unwrap(); // "h" + half of 'é'
/// assert_eq!(text, "h");
/// text += &decoder.decode(&bytes[2..]).unwrap();
/// text += &decoder.finish().unwrap();
/// assert_eq!(text, "héllo");
/// ```
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
    position: u64,
    fatal: bool,
}

impl Utf8StreamDecoder {
    /// A lossy decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that reports invalid input instead of replacing it.
    pub fn fatal() -> Self {
        Self {
            fatal: true,
            ..Self::default()
        }
    }

    /// Decodes the next piece of the stream, holding back any incomplete
    /// trailing sequence.
    pub fn decode(&mut self, input: &[u8]) -> Result<String, DecodeError> {
        self.run(input, false)
    }

    /// Flushes held-back bytes at end of stream. The decoder is reset and can
    /// be reused afterwards.
    pub fn finish(&mut self) -> Result<String, DecodeError> {
        let out = self.run(&[], true);
        self.position = 0;
        out
    }

    /// Number of bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn run(&mut self, input: &[u8], flush: bool) -> Result<String, DecodeError> {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(input);
        let base = self.position;

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;

        loop {
            let error = match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(error) => error,
            };

            let (valid, after) = rest.split_at(error.valid_up_to());
            // The prefix up to `valid_up_to` is well-formed by definition.
            if let Ok(valid) = std::str::from_utf8(valid) {
                out.push_str(valid);
            }
            let offset = base + (bytes.len() - after.len()) as u64;

            match error.error_len() {
                Some(len) => {
                    self.reject(offset)?;
                    out.push(REPLACEMENT);
                    rest = &after[len..];
                }
                None if flush => {
                    self.reject(offset)?;
                    out.push(REPLACEMENT);
                    break;
                }
                None => {
                    self.pending = after.to_vec();
                    break;
                }
            }
        }

        self.position = base + (bytes.len() - self.pending.len()) as u64;
        Ok(out)
    }

    fn reject(&mut self, offset: u64) -> Result<(), DecodeError> {
        if self.fatal {
            self.pending.clear();
            return Err(DecodeError { offset });
        }
        Ok(())
    }
}
