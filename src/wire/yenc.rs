//! yEnc codec
//!
//! Single-part and multi-part encoding with a CRC32 per part and a whole-
//! message CRC across parts. Line length defaults to 128 encoded bytes.
//! Encoded bodies are raw 8-bit lines, never text. Decode verifies every
//! CRC it sees; a mismatch is an integrity error.

use crc32fast::Hasher;

use crate::{Error, Result};

pub const LINE_LEN: usize = 128;

const ESCAPE: u8 = b'=';

/// Metadata describing one encoded part.
#[derive(Debug, Clone)]
pub struct PartInfo {
    /// 1-based part number; 0 when single-part.
    pub part: u32,
    pub total: u32,
    /// Offset of this part's first byte within the whole payload.
    pub begin: u64,
    /// Offset one past this part's last byte.
    pub end: u64,
}

fn needs_escape(byte: u8, at_line_start: bool) -> bool {
    matches!(byte, 0x00 | 0x0A | 0x0D | 0x3D) || (at_line_start && byte == b'.')
}

fn encode_payload(data: &[u8], line_len: usize) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut line: Vec<u8> = Vec::with_capacity(line_len + 2);
    for &raw in data {
        let byte = raw.wrapping_add(42);
        if needs_escape(byte, line.is_empty()) {
            line.push(ESCAPE);
            line.push(byte.wrapping_add(64));
        } else {
            line.push(byte);
        }
        if line.len() >= line_len {
            lines.push(std::mem::take(&mut line));
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encode a complete payload as one single-part yEnc body.
pub fn encode_single(name: &str, data: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = vec![format!(
        "=ybegin line={} size={} name={}",
        LINE_LEN,
        data.len(),
        name
    )
    .into_bytes()];
    lines.extend(encode_payload(data, LINE_LEN));
    lines.push(format!("=yend size={} crc32={:08x}", data.len(), crc32(data)).into_bytes());
    lines
}

/// Encode one part of a multi-part payload. `whole_crc` is attached on the
/// final part only.
pub fn encode_part(
    name: &str,
    total_size: u64,
    info: &PartInfo,
    data: &[u8],
    whole_crc: Option<u32>,
) -> Vec<Vec<u8>> {
    let mut lines = vec![format!(
        "=ybegin part={} total={} line={} size={} name={}",
        info.part, info.total, LINE_LEN, total_size, name
    )
    .into_bytes()];
    // yEnc part offsets are 1-based inclusive.
    lines.push(format!("=ypart begin={} end={}", info.begin + 1, info.end).into_bytes());
    lines.extend(encode_payload(data, LINE_LEN));
    let mut yend = format!(
        "=yend size={} part={} pcrc32={:08x}",
        data.len(),
        info.part,
        crc32(data)
    );
    if let Some(whole) = whole_crc {
        yend.push_str(&format!(" crc32={:08x}", whole));
    }
    lines.push(yend.into_bytes());
    lines
}

/// A decoded part: raw bytes plus the trailer attributes that were present.
#[derive(Debug)]
pub struct Decoded {
    pub data: Vec<u8>,
    pub part: Option<u32>,
    pub whole_crc: Option<u32>,
}

/// Control lines (=ybegin/=ypart/=yend) are plain ASCII.
fn control_line(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line).map_err(|_| Error::integrity("non-ASCII yEnc control line"))
}

fn header_attr(line: &str, key: &str) -> Option<String> {
    // `name=` may contain spaces and must be last; everything else is
    // space-delimited key=value.
    if key == "name" {
        return line
            .split_once("name=")
            .map(|(_, value)| value.to_string());
    }
    line.split_whitespace()
        .find_map(|token| token.strip_prefix(&format!("{}=", key)))
        .map(str::to_string)
}

/// Decode a yEnc body and verify its CRCs.
pub fn decode(lines: &[Vec<u8>]) -> Result<Decoded> {
    let begin = lines
        .iter()
        .position(|l| l.starts_with(b"=ybegin "))
        .ok_or_else(|| Error::integrity("missing =ybegin header"))?;
    let end = lines
        .iter()
        .position(|l| l.starts_with(b"=yend "))
        .ok_or_else(|| Error::integrity("missing =yend trailer"))?;
    if end <= begin {
        return Err(Error::integrity("=yend precedes =ybegin"));
    }

    let part = header_attr(control_line(&lines[begin])?, "part")
        .map(|v| v.parse::<u32>())
        .transpose()
        .map_err(|e| Error::integrity(format!("bad part number: {}", e)))?;

    let mut body_start = begin + 1;
    if lines
        .get(body_start)
        .map(|l| l.starts_with(b"=ypart "))
        .unwrap_or(false)
    {
        body_start += 1;
    }

    let mut data = Vec::new();
    for line in &lines[body_start..end] {
        let mut i = 0;
        while i < line.len() {
            let byte = line[i];
            if byte == ESCAPE {
                i += 1;
                let escaped = *line
                    .get(i)
                    .ok_or_else(|| Error::integrity("dangling escape at line end"))?;
                data.push(escaped.wrapping_sub(64).wrapping_sub(42));
            } else {
                data.push(byte.wrapping_sub(42));
            }
            i += 1;
        }
    }

    let trailer = control_line(&lines[end])?;
    if let Some(size) = header_attr(trailer, "size") {
        let size: usize = size
            .parse()
            .map_err(|e| Error::integrity(format!("bad trailer size: {}", e)))?;
        if size != data.len() {
            return Err(Error::integrity(format!(
                "yEnc size mismatch: trailer says {}, decoded {}",
                size,
                data.len()
            )));
        }
    }

    let part_crc_key = if part.is_some() { "pcrc32" } else { "crc32" };
    if let Some(expected) = header_attr(trailer, part_crc_key) {
        let expected = u32::from_str_radix(&expected, 16)
            .map_err(|e| Error::integrity(format!("bad crc: {}", e)))?;
        let actual = crc32(&data);
        if expected != actual {
            return Err(Error::integrity(format!(
                "yEnc CRC mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }
    }

    let whole_crc = if part.is_some() {
        header_attr(trailer, "crc32")
            .map(|v| u32::from_str_radix(&v, 16))
            .transpose()
            .map_err(|e| Error::integrity(format!("bad whole crc: {}", e)))?
    } else {
        None
    };

    Ok(Decoded {
        data,
        part,
        whole_crc,
    })
}

/// Verify the whole-message CRC after stitching multi-part data.
pub fn verify_whole(data: &[u8], expected: u32) -> Result<()> {
    let actual = crc32(data);
    if actual != expected {
        return Err(Error::integrity(format!(
            "multi-part CRC mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }
    Ok(())
}

pub fn whole_crc(data: &[u8]) -> u32 {
    crc32(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_round_trip() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let lines = encode_single("payload.bin", &data);
        assert!(lines[0].starts_with(b"=ybegin line=128 size=5000"));
        let decoded = decode(&lines).unwrap();
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.part, None);
    }

    #[test]
    fn test_escape_dense_payload() {
        // Bytes that map onto every escape-critical output value.
        let data = vec![0xD6u8, 0xE0, 0xE3, 0x13, 0x04, b'.', 0x00, 0xFF];
        let repeated: Vec<u8> = data.iter().cycle().take(2000).copied().collect();
        let lines = encode_single("x", &repeated);
        let decoded = decode(&lines).unwrap();
        assert_eq!(decoded.data, repeated);
    }

    #[test]
    fn test_empty_payload() {
        let lines = encode_single("empty", &[]);
        let decoded = decode(&lines).unwrap();
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_corruption_detected() {
        let data = vec![7u8; 1000];
        let mut lines = encode_single("x", &data);
        // Flip a body byte.
        lines[1][0] = lines[1][0].wrapping_add(1);
        assert!(matches!(decode(&lines), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_multi_part_round_trip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let whole = whole_crc(&data);
        let half = data.len() / 2;

        let part1 = encode_part(
            "x",
            data.len() as u64,
            &PartInfo {
                part: 1,
                total: 2,
                begin: 0,
                end: half as u64,
            },
            &data[..half],
            None,
        );
        let part2 = encode_part(
            "x",
            data.len() as u64,
            &PartInfo {
                part: 2,
                total: 2,
                begin: half as u64,
                end: data.len() as u64,
            },
            &data[half..],
            Some(whole),
        );

        let d1 = decode(&part1).unwrap();
        let d2 = decode(&part2).unwrap();
        assert_eq!(d1.part, Some(1));
        assert_eq!(d2.part, Some(2));
        assert_eq!(d2.whole_crc, Some(whole));

        let mut stitched = d1.data;
        stitched.extend_from_slice(&d2.data);
        assert_eq!(stitched, data);
        verify_whole(&stitched, whole).unwrap();
    }

    #[test]
    fn test_line_length_respected() {
        let data = vec![1u8; 10_000];
        let lines = encode_single("x", &data);
        for line in &lines[1..lines.len() - 1] {
            // Escapes may push one byte past the nominal length.
            assert!(line.len() <= LINE_LEN + 1);
        }
    }

    #[test]
    fn test_binary_lines_survive_non_utf8() {
        // Encoded output regularly contains invalid UTF-8; the byte-line
        // representation must carry it unchanged.
        let data = vec![0xB6u8; 600];
        let lines = encode_single("x", &data);
        assert!(lines[1..lines.len() - 1]
            .iter()
            .any(|l| std::str::from_utf8(l).is_err()));
        assert_eq!(decode(&lines).unwrap().data, data);
    }
}
