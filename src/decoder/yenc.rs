//! Streaming yEnc decoder with CRC32 accumulation
//!
//! yEnc encodes each byte as `(byte + 42) % 256`; the escape character `=`
//! precedes bytes that would collide with protocol characters, stored as
//! `(byte + 64) % 256`. A body looks like:
//!
//! ```text
//! =ybegin part=1 line=128 size=30000 name=archive.part01.rar
//! =ypart begin=10001 end=20000
//! <encoded data lines>
//! =yend size=10000 part=1 pcrc32=ABCD1234
//! ```
//!
//! `=ypart` is present only for multi-part articles; `begin`/`end` are
//! 1-based inclusive byte offsets within the whole file.

use super::DecodeStatus;

/// Streaming yEnc decoder for one article body
pub struct YencDecoder {
    saw_begin: bool,
    saw_part: bool,
    saw_end: bool,
    crc_check: bool,
    hasher: crc32fast::Hasher,
    expected_crc: Option<u32>,
    /// 1-based inclusive part offsets within the target file
    begin: u64,
    end: u64,
    /// Total file size from `=ybegin size=`
    size: u64,
    /// Part (or file) size from `=yend size=`
    end_size: Option<u64>,
    /// Decoded byte count
    out_size: u64,
    filename: Option<String>,
    /// An `=` escape seen as the last byte of the previous line
    pending_escape: bool,
}

impl YencDecoder {
    /// Create a fresh decoder. `crc_check` controls whether [`check`] compares
    /// the accumulated CRC against the trailer.
    ///
    /// [`check`]: YencDecoder::check
    pub fn new(crc_check: bool) -> Self {
        Self {
            saw_begin: false,
            saw_part: false,
            saw_end: false,
            crc_check,
            hasher: crc32fast::Hasher::new(),
            expected_crc: None,
            begin: 0,
            end: 0,
            size: 0,
            end_size: None,
            out_size: 0,
            filename: None,
            pending_escape: false,
        }
    }

    /// Decode one body line, appending decoded bytes to `out`.
    ///
    /// Header (`=ybegin`, `=ypart`) and trailer (`=yend`) lines are consumed
    /// as metadata and produce no output. Returns the number of bytes
    /// appended.
    pub fn decode_line(&mut self, line: &[u8], out: &mut Vec<u8>) -> usize {
        let line = strip_crlf(line);

        if line.starts_with(b"=ybegin ") {
            self.saw_begin = true;
            self.parse_ybegin(line);
            return 0;
        }
        if line.starts_with(b"=ypart ") {
            self.saw_part = true;
            self.parse_ypart(line);
            return 0;
        }
        if line.starts_with(b"=yend") {
            self.saw_end = true;
            self.parse_yend(line);
            return 0;
        }
        if !self.saw_begin || self.saw_end {
            return 0;
        }

        let before = out.len();
        let mut escape = self.pending_escape;
        for &byte in line {
            if escape {
                out.push(byte.wrapping_sub(64).wrapping_sub(42));
                escape = false;
            } else if byte == b'=' {
                escape = true;
            } else {
                out.push(byte.wrapping_sub(42));
            }
        }
        self.pending_escape = escape;

        let decoded = &out[before..];
        self.hasher.update(decoded);
        self.out_size += decoded.len() as u64;
        decoded.len()
    }

    /// Classify the result after the body terminator
    pub fn check(&self) -> DecodeStatus {
        if !self.saw_begin {
            return DecodeStatus::NoBinaryData;
        }
        if !self.saw_end {
            return DecodeStatus::ArticleIncomplete;
        }
        if self.crc_check
            && let Some(expected) = self.expected_crc
            && expected != self.calculated_crc()
        {
            return DecodeStatus::CrcError;
        }
        if let Some(end_size) = self.end_size
            && end_size != self.out_size
        {
            return DecodeStatus::InvalidSize;
        }
        if self.saw_part && self.begin > 0 && self.end >= self.begin {
            let part_len = self.end - self.begin + 1;
            if part_len != self.out_size {
                return DecodeStatus::InvalidSize;
            }
        }
        DecodeStatus::Finished
    }

    /// Filename from `=ybegin name=`, if present
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// 1-based begin offset from `=ypart` (0 when single-part)
    pub fn begin(&self) -> u64 {
        self.begin
    }

    /// 1-based end offset from `=ypart` (0 when single-part)
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Total file size from `=ybegin size=`
    pub fn size(&self) -> u64 {
        self.size
    }

    /// CRC32 accumulated over the decoded bytes
    pub fn calculated_crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// CRC32 declared by the trailer (`pcrc32=` for parts, else `crc32=`)
    pub fn expected_crc(&self) -> Option<u32> {
        self.expected_crc
    }

    fn parse_ybegin(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        // `name=` runs to end of line and may contain spaces, so it is
        // extracted before token-splitting the rest.
        if let Some(idx) = text.find(" name=") {
            let name = text[idx + 6..].trim();
            if !name.is_empty() {
                self.filename = Some(name.to_string());
            }
        }
        for token in text.split_whitespace().skip(1) {
            if let Some((key, value)) = token.split_once('=')
                && key == "size"
            {
                self.size = value.parse().unwrap_or(0);
            }
        }
    }

    fn parse_ypart(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        for token in text.split_whitespace().skip(1) {
            if let Some((key, value)) = token.split_once('=') {
                match key {
                    "begin" => self.begin = value.parse().unwrap_or(0),
                    "end" => self.end = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
        }
    }

    fn parse_yend(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let mut crc32 = None;
        let mut pcrc32 = None;
        for token in text.split_whitespace().skip(1) {
            if let Some((key, value)) = token.split_once('=') {
                match key {
                    "size" => self.end_size = value.parse().ok(),
                    "crc32" => crc32 = u32::from_str_radix(value.trim(), 16).ok(),
                    "pcrc32" => pcrc32 = u32::from_str_radix(value.trim(), 16).ok(),
                    _ => {}
                }
            }
        }
        // Multi-part trailers carry the part CRC in pcrc32; crc32 there is
        // the whole-file checksum and must not be compared against one part.
        self.expected_crc = if self.saw_part {
            pcrc32
        } else {
            crc32.or(pcrc32)
        };
    }
}

fn strip_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Encode data in yEnc format (single-part).
///
/// Exists for tests: `encode(decode(x)) = x` is one of the decoder's laws.
#[cfg(test)]
pub(crate) fn encode_yenc(data: &[u8], filename: &str, line_length: usize) -> Vec<u8> {
    let mut result = Vec::new();
    let header = format!(
        "=ybegin line={} size={} name={}\r\n",
        line_length,
        data.len(),
        filename
    );
    result.extend_from_slice(header.as_bytes());

    let mut line_pos = 0;
    for &byte in data {
        let encoded = byte.wrapping_add(42);
        let needs_escape = matches!(encoded, 0x00 | 0x0A | 0x0D | 0x3D);
        if needs_escape {
            result.push(b'=');
            result.push(encoded.wrapping_add(64));
            line_pos += 2;
        } else {
            result.push(encoded);
            line_pos += 1;
        }
        if line_pos >= line_length {
            result.extend_from_slice(b"\r\n");
            line_pos = 0;
        }
    }
    if line_pos > 0 {
        result.extend_from_slice(b"\r\n");
    }

    let crc = crc32fast::hash(data);
    let trailer = format!("=yend size={} crc32={:08x}\r\n", data.len(), crc);
    result.extend_from_slice(trailer.as_bytes());
    result
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(body: &[u8], crc_check: bool) -> (YencDecoder, Vec<u8>) {
        let mut decoder = YencDecoder::new(crc_check);
        let mut out = Vec::new();
        for line in body.split_inclusive(|&b| b == b'\n') {
            decoder.decode_line(line, &mut out);
        }
        (decoder, out)
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let original: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let encoded = encode_yenc(&original, "roundtrip.bin", 128);
        let (decoder, out) = decode_all(&encoded, true);

        assert_eq!(out, original, "decode(encode(x)) must reproduce x");
        assert_eq!(decoder.check(), DecodeStatus::Finished);
        assert_eq!(decoder.filename(), Some("roundtrip.bin"));
    }

    #[test]
    fn escape_bytes_round_trip() {
        // Bytes that force escaping when encoded: NUL, LF, CR, '='
        let original: Vec<u8> = vec![0x00, 0x0A, 0x0D, 0x3D - 42, 0x13, 0xD3];
        let encoded = encode_yenc(&original, "special.bin", 128);
        let (decoder, out) = decode_all(&encoded, true);

        assert_eq!(out, original);
        assert_eq!(decoder.check(), DecodeStatus::Finished);
    }

    #[test]
    fn multi_part_body_reports_offsets() {
        let body = b"=ybegin part=2 line=128 size=30000 name=a.rar\r\n\
                     =ypart begin=10001 end=10004\r\n\
                     MNOP\r\n\
                     =yend size=4 part=2 pcrc32=00000000\r\n";
        let (decoder, out) = decode_all(body, false);

        assert_eq!(decoder.begin(), 10001);
        assert_eq!(decoder.end(), 10004);
        assert_eq!(decoder.size(), 30000);
        assert_eq!(out, vec![b'M' - 42, b'N' - 42, b'O' - 42, b'P' - 42]);
        // crc_check off: the bogus pcrc32 must not fail the check
        assert_eq!(decoder.check(), DecodeStatus::Finished);
    }

    #[test]
    fn crc_mismatch_is_reported_when_check_enabled() {
        let original = b"payload bytes".to_vec();
        let mut encoded = encode_yenc(&original, "x.bin", 128);
        // Corrupt the trailer CRC
        let text = String::from_utf8(encoded.clone()).unwrap();
        let corrupted = text.replace(
            &format!("crc32={:08x}", crc32fast::hash(&original)),
            "crc32=deadbeef",
        );
        encoded = corrupted.into_bytes();

        let (decoder, _) = decode_all(&encoded, true);
        assert_eq!(decoder.check(), DecodeStatus::CrcError);

        // With crc_check disabled the same body passes
        let (decoder, _) = decode_all(&encoded, false);
        assert_eq!(decoder.check(), DecodeStatus::Finished);
    }

    #[test]
    fn missing_trailer_is_article_incomplete() {
        let body = b"=ybegin line=128 size=4 name=t.bin\r\nMNOP\r\n";
        let (decoder, _) = decode_all(body, true);
        assert_eq!(decoder.check(), DecodeStatus::ArticleIncomplete);
    }

    #[test]
    fn body_without_ybegin_is_no_binary_data() {
        let body = b"just some text\r\nmore text\r\n";
        let (decoder, out) = decode_all(body, true);
        assert_eq!(decoder.check(), DecodeStatus::NoBinaryData);
        assert!(out.is_empty(), "no bytes may be emitted outside =ybegin");
    }

    #[test]
    fn size_mismatch_is_invalid_size() {
        // Trailer claims 10 bytes but only 4 are encoded
        let body = b"=ybegin line=128 size=10 name=t.bin\r\nMNOP\r\n=yend size=10\r\n";
        let (decoder, _) = decode_all(body, false);
        assert_eq!(decoder.check(), DecodeStatus::InvalidSize);
    }

    #[test]
    fn escape_at_line_boundary_carries_over() {
        // '=' as the last byte of a data line escapes the first byte of the
        // next line; the decoder must carry the state across decode_line calls.
        let mut decoder = YencDecoder::new(false);
        let mut out = Vec::new();
        decoder.decode_line(b"=ybegin line=128 size=2 name=t.bin\r\n", &mut out);
        decoder.decode_line(b"M=\r\n", &mut out);
        decoder.decode_line(b"}\r\n", &mut out);
        decoder.decode_line(b"=yend size=2\r\n", &mut out);

        assert_eq!(out, vec![b'M' - 42, b'}' - 64 - 42]);
        assert_eq!(decoder.check(), DecodeStatus::Finished);
    }

    #[test]
    fn filename_with_spaces_is_preserved() {
        let body = b"=ybegin line=128 size=1 name=my file (1).bin\r\nM\r\n=yend size=1\r\n";
        let (decoder, _) = decode_all(body, false);
        assert_eq!(decoder.filename(), Some("my file (1).bin"));
    }

    #[test]
    fn calculated_crc_matches_crc32fast_over_payload() {
        let original = b"deterministic payload".to_vec();
        let encoded = encode_yenc(&original, "p.bin", 64);
        let (decoder, _) = decode_all(&encoded, true);
        assert_eq!(decoder.calculated_crc(), crc32fast::hash(&original));
    }
}
