//! Length-prefixed JSON framing
//!
//! A frame is `<decimal byte length>:<UTF-8 JSON payload>\n`. The length
//! counts payload bytes, not characters, so multi-byte text and delimiter
//! characters inside JSON strings never confuse the receiver.
//!
//! BLE notifications may split one frame across several deliveries or pack
//! several frames into one, and some firmware prints bare JSON or boot noise
//! on the same characteristic. [`FrameDecoder`] buffers deliveries and yields
//! every complete message it can recover. Input it cannot make sense of is
//! logged and dropped; decoding never fails.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Largest payload accepted from a length prefix
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Longest digit run treated as a length prefix (enough for `MAX_FRAME_LEN`)
const MAX_PREFIX_DIGITS: usize = 6;

/// Encode a message as a single frame
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(message)?;
    let prefix = format!("{}:", payload.len());

    let mut buf = Vec::with_capacity(prefix.len() + payload.len() + 1);
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(&payload);
    buf.push(b'\n');
    Ok(buf)
}

/// Decode everything complete in `bytes`, returning the messages and the
/// trailing bytes that do not form a complete message yet
pub fn decode_stream(bytes: &[u8]) -> (Vec<Value>, Vec<u8>) {
    let mut decoder = FrameDecoder::new();
    let messages = decoder.feed(bytes).collect();
    (messages, decoder.into_remainder())
}

/// Incremental frame decoder
///
/// Bytes are consumed as messages are produced, so feeding the same delivery
/// twice yields its messages twice.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

/// Lazy iterator over the messages currently decodable, see [`FrameDecoder::feed`]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.decoder.next_message()
    }
}

enum Prefix {
    /// `header` bytes of `<len>:` followed by a `len` byte payload
    Complete { header: usize, len: usize },
    /// Digits so far, more bytes needed to decide
    Partial,
    /// Not a length prefix
    Invalid,
}

enum Step {
    Message(Value),
    Skip,
    Incomplete,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one transport delivery to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append a delivery and iterate over the messages it completes
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        self.push(data);
        Frames { decoder: self }
    }

    /// Bytes buffered but not yet part of a complete message
    pub fn remainder(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_remainder(self) -> Vec<u8> {
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extract the next complete message, if any
    pub fn next_message(&mut self) -> Option<Value> {
        loop {
            match self.step() {
                Step::Message(value) => return Some(value),
                Step::Skip => continue,
                Step::Incomplete => return None,
            }
        }
    }

    fn step(&mut self) -> Step {
        // Frames end with '\n' and firmware likes to add "\r\n"
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return Step::Incomplete;
        };
        self.buf.drain(..start);

        match parse_prefix(&self.buf) {
            Prefix::Complete { header, len } => self.take_frame(header, len),
            Prefix::Partial => Step::Incomplete,
            Prefix::Invalid => self.take_bare_object(),
        }
    }

    fn take_frame(&mut self, header: usize, len: usize) -> Step {
        let end = header + len;
        let fits = len <= MAX_FRAME_LEN;
        let terminated = match self.buf.get(end) {
            Some(b) => b.is_ascii_whitespace(),
            None => self.buf.len() == end,
        };

        if fits && terminated {
            if let Ok(value) = serde_json::from_slice::<Value>(&self.buf[header..end]) {
                self.buf.drain(..end);
                debug!(len, "decoded frame");
                return Step::Message(value);
            }
        }

        // Noise ending in a digit fuses with the real prefix ("1" + "28:")
        if let Some(noise) = self.noise_digits(header) {
            warn!(dropped = noise, "discarding digits fused with a frame prefix");
            self.buf.drain(..noise);
            return Step::Skip;
        }

        if !fits {
            warn!(len, "dropping frame prefix over the size limit");
        } else if self.buf.len() < end {
            return Step::Incomplete;
        } else {
            // Only the prefix is dropped: if it was noise, the payload
            // bytes may still hold a real frame.
            warn!(len, "dropping frame with invalid payload");
        }
        self.buf.drain(..header);
        Step::Skip
    }

    /// How many leading prefix digits to drop so the rest forms a complete,
    /// `\n`-terminated frame. Compact JSON never holds a raw newline, so a
    /// genuine prefix can not be mistaken for one of these.
    fn noise_digits(&self, header: usize) -> Option<usize> {
        let digits = header - 1;
        (1..digits).find(|&skip| {
            let Some(len) = std::str::from_utf8(&self.buf[skip..digits])
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
            else {
                return false;
            };
            let end = header + len;
            self.buf.get(end) == Some(&b'\n')
                && serde_json::from_slice::<Value>(&self.buf[header..end]).is_ok()
        })
    }

    /// Fallback for input without a usable length prefix: recover a balanced
    /// `{...}` object, discarding whatever precedes it.
    fn take_bare_object(&mut self) -> Step {
        let Some(open) = self.buf.iter().position(|&b| b == b'{') else {
            // A trailing digit run may be the start of a prefix split across
            // deliveries, everything before it is noise.
            let keep = trailing_digits(&self.buf).min(MAX_PREFIX_DIGITS);
            let dropped = self.buf.len() - keep;
            if dropped > 0 {
                warn!(dropped, "discarding non-protocol bytes");
                self.buf.drain(..dropped);
            }
            return Step::Incomplete;
        };

        if open > 0 {
            warn!(dropped = open, "discarding non-protocol bytes before JSON object");
            self.buf.drain(..open);
        }

        match object_end(&self.buf) {
            Some(end) => {
                let parsed = serde_json::from_slice::<Value>(&self.buf[..=end]);
                self.buf.drain(..=end);
                match parsed {
                    Ok(value) => {
                        debug!(len = end + 1, "decoded unframed JSON object");
                        Step::Message(value)
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping unparseable JSON object");
                        Step::Skip
                    }
                }
            }
            None => match next_frame_start(&self.buf[1..]) {
                // The opening brace was noise: a proper frame follows it
                Some(pos) => {
                    warn!(dropped = pos + 1, "discarding unterminated JSON object");
                    self.buf.drain(..pos + 1);
                    Step::Skip
                }
                None if self.buf.len() > MAX_FRAME_LEN => {
                    warn!("discarding unterminated JSON object over the size limit");
                    self.buf.drain(..1);
                    Step::Skip
                }
                None => Step::Incomplete,
            },
        }
    }
}

fn parse_prefix(buf: &[u8]) -> Prefix {
    let digits = leading_digits(buf);
    if digits == 0 || digits > MAX_PREFIX_DIGITS {
        return Prefix::Invalid;
    }

    match buf.get(digits) {
        None => Prefix::Partial,
        Some(b':') => {
            let len = std::str::from_utf8(&buf[..digits])
                .ok()
                .and_then(|s| s.parse::<usize>().ok());
            let header = digits + 1;
            match (len, buf.get(header)) {
                // Every payload is a JSON object
                (Some(len), None | Some(b'{')) => Prefix::Complete { header, len },
                _ => Prefix::Invalid,
            }
        }
        Some(_) => Prefix::Invalid,
    }
}

fn trailing_digits(buf: &[u8]) -> usize {
    buf.iter().rev().take_while(|b| b.is_ascii_digit()).count()
}

/// Index of the `}` closing the object that starts at `buf[0]`, ignoring
/// braces inside JSON strings
fn object_end(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in buf.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Offset of the first `<digits>:{` sequence in `buf`
fn next_frame_start(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&i| {
        let starts_run = i == 0 || !buf[i - 1].is_ascii_digit();
        let digits = leading_digits(&buf[i..]);
        starts_run
            && (1..=MAX_PREFIX_DIGITS).contains(&digits)
            && buf.get(i + digits) == Some(&b':')
            && buf.get(i + digits + 1) == Some(&b'{')
    })
}

fn leading_digits(buf: &[u8]) -> usize {
    buf.iter().take_while(|b| b.is_ascii_digit()).count()
}
