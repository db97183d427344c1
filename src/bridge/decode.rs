/// Streaming lossy UTF-8 decoder for PTY output.
///
/// PTY reads can split a multi-byte sequence across chunks. Up to three
/// trailing bytes of an incomplete sequence are carried into the next
/// chunk; genuinely invalid bytes become U+FFFD. Output order always
/// matches byte order.
pub struct Utf8Stream {
    carry: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self { carry: Vec::new() }
    }

    /// Decode the next chunk, prepending any carried bytes.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, invalid) = rest.split_at(e.valid_up_to());
                    // valid_up_to bytes are known-good UTF-8
                    out.push_str(unsafe { std::str::from_utf8_unchecked(valid) });

                    match e.error_len() {
                        Some(len) => {
                            out.push('\u{FFFD}');
                            rest = &invalid[len..];
                        }
                        None => {
                            // Incomplete sequence at the tail; hold it for
                            // the next chunk
                            self.carry = invalid.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush a dangling incomplete sequence as a replacement character.
    /// Call when the stream ends.
    pub fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            String::new()
        } else {
            self.carry.clear();
            "\u{FFFD}".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut d = Utf8Stream::new();
        assert_eq!(d.push(b"echo hi\r\n"), "echo hi\r\n");
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        // "é" = 0xC3 0xA9, split between reads
        let mut d = Utf8Stream::new();
        assert_eq!(d.push(&[b'a', 0xC3]), "a");
        assert_eq!(d.push(&[0xA9, b'b']), "éb");
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn test_four_byte_sequence_split() {
        // U+1F600 = F0 9F 98 80, one byte per read
        let mut d = Utf8Stream::new();
        assert_eq!(d.push(&[0xF0]), "");
        assert_eq!(d.push(&[0x9F]), "");
        assert_eq!(d.push(&[0x98]), "");
        assert_eq!(d.push(&[0x80]), "\u{1F600}");
    }

    #[test]
    fn test_invalid_byte_replaced() {
        let mut d = Utf8Stream::new();
        assert_eq!(d.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn test_truncated_sequence_followed_by_ascii() {
        // 0xC3 starts a two-byte sequence but 'x' cannot continue it
        let mut d = Utf8Stream::new();
        assert_eq!(d.push(&[0xC3, b'x']), "\u{FFFD}x");
    }

    #[test]
    fn test_finish_flushes_dangling_carry() {
        let mut d = Utf8Stream::new();
        assert_eq!(d.push(&[0xE2, 0x82]), "");
        assert_eq!(d.finish(), "\u{FFFD}");
        assert_eq!(d.finish(), "");
    }
}
