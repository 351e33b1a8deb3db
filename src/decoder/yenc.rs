//! yEnc framing: `=ybegin`, optional `=ypart`, data lines, `=yend`
//!
//! The data lines go through [`nntp_rs::yenc_decode`]. The trailer keywords
//! are read here so a CRC mismatch still yields the decoded bytes.

use super::lines;
use crate::error::DecodeError;

/// Decoded yEnc part before CRC checking
#[derive(Debug)]
pub(crate) struct YencPart {
    pub data: Vec<u8>,
    pub name: Option<String>,
    pub part: Option<u32>,
    pub total_size: Option<u64>,
    /// Zero-based offset of the part in the file (from `=ypart begin`)
    pub begin: Option<u64>,
    /// Size declared by `=yend size`
    pub end_size: Option<u64>,
    /// `pcrc32` for multi-part posts, else `crc32`
    pub declared_crc: Option<u32>,
}

/// True when the body carries a `=ybegin` line
pub(crate) fn looks_like_yenc(raw: &[u8]) -> bool {
    lines(raw).any(|l| l.starts_with(b"=ybegin "))
}

/// Value of `key=` in a yEnc keyword line. `name` runs to the end of the line.
fn keyword<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!(" {key}=");
    let start = line.find(&needle)? + needle.len();
    let rest = &line[start..];
    if key == "name" {
        return Some(rest.trim_end());
    }
    Some(rest.split_whitespace().next().unwrap_or(""))
}

fn keyword_u64(line: &str, key: &str) -> Option<u64> {
    keyword(line, key).and_then(|v| v.parse().ok())
}

fn keyword_crc(line: &str, key: &str) -> Option<u32> {
    keyword(line, key).and_then(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16).ok())
}

/// Decode one yEnc part. Lines before `=ybegin` are skipped.
///
/// The body handed to `yenc_decode` starts at `=ybegin` and ends with a
/// `=yend` line carrying only `size` and `part`; the CRC is compared by the
/// caller against [`YencPart::declared_crc`].
pub(crate) fn decode(raw: &[u8], size_hint: usize) -> Result<YencPart, DecodeError> {
    let mut body = Vec::new();
    body.try_reserve(raw.len())
        .map_err(|_| DecodeError::OutOfMemory)?;

    let mut header: Option<String> = None;
    let mut trailer: Option<String> = None;
    for line in lines(raw) {
        if header.is_none() {
            if !line.starts_with(b"=ybegin ") {
                continue;
            }
            header = Some(String::from_utf8_lossy(line).into_owned());
        } else if line.starts_with(b"=yend") {
            let text = String::from_utf8_lossy(line).into_owned();
            body.extend_from_slice(b"=yend");
            for key in ["size", "part"] {
                if let Some(value) = keyword(&text, key) {
                    body.extend_from_slice(format!(" {key}={value}").as_bytes());
                }
            }
            body.extend_from_slice(b"\r\n");
            trailer = Some(text);
            break;
        }
        body.extend_from_slice(line);
        body.extend_from_slice(b"\r\n");
    }

    let header = header.ok_or_else(|| DecodeError::MalformedPayload("no =ybegin line".into()))?;
    let trailer =
        trailer.ok_or_else(|| DecodeError::MalformedPayload("no =yend line (truncated)".into()))?;

    let decoded = nntp_rs::yenc_decode(&body)
        .map_err(|e| DecodeError::MalformedPayload(format!("yEnc: {e}")))?;

    let mut data = Vec::new();
    data.try_reserve(size_hint.max(decoded.data.len()))
        .map_err(|_| DecodeError::OutOfMemory)?;
    data.extend_from_slice(&decoded.data);

    let part = keyword_u64(&header, "part").map(|p| p as u32);
    let begin = match decoded.part.as_ref() {
        Some(p) => Some(p.begin.saturating_sub(1)),
        None if part.is_none() => Some(0),
        None => None,
    };
    let declared_crc = if part.is_some() {
        keyword_crc(&trailer, "pcrc32")
    } else {
        keyword_crc(&trailer, "crc32").or_else(|| keyword_crc(&trailer, "pcrc32"))
    };

    Ok(YencPart {
        data,
        name: keyword(&header, "name")
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        part,
        total_size: Some(decoded.header.size),
        begin,
        end_size: keyword_u64(&trailer, "size"),
        declared_crc,
    })
}

#[cfg(test)]
/// Encode `data` as one yEnc part of a file of `total_size` bytes starting at
/// zero-based `begin`. Output lines end in `\r\n` and are not dot-stuffed.
pub fn encode_part(
    data: &[u8],
    name: &str,
    part: u32,
    total_size: u64,
    begin: u64,
    line_len: usize,
) -> Vec<u8> {
    let crc = crc32fast::hash(data);
    let mut out = Vec::with_capacity(data.len() + data.len() / 32 + 256);
    out.extend_from_slice(
        format!("=ybegin part={part} line={line_len} size={total_size} name={name}\r\n").as_bytes(),
    );
    out.extend_from_slice(
        format!("=ypart begin={} end={}\r\n", begin + 1, begin + data.len() as u64).as_bytes(),
    );
    encode_body(data, line_len, &mut out);
    out.extend_from_slice(
        format!(
            "=yend size={} part={part} pcrc32={crc:08x}\r\n",
            data.len()
        )
        .as_bytes(),
    );
    out
}

#[cfg(test)]
/// Encode a complete single-part file (`crc32` trailer, no `=ypart`)
pub fn encode_single(data: &[u8], name: &str, line_len: usize) -> Vec<u8> {
    let crc = crc32fast::hash(data);
    let mut out = Vec::with_capacity(data.len() + data.len() / 32 + 128);
    out.extend_from_slice(
        format!("=ybegin line={line_len} size={} name={name}\r\n", data.len()).as_bytes(),
    );
    encode_body(data, line_len, &mut out);
    out.extend_from_slice(format!("=yend size={} crc32={crc:08x}\r\n", data.len()).as_bytes());
    out
}

#[cfg(test)]
fn encode_body(data: &[u8], line_len: usize, out: &mut Vec<u8>) {
    let mut col = 0usize;
    for (i, &b) in data.iter().enumerate() {
        let e = b.wrapping_add(42);
        let last_in_line = col + 1 >= line_len || i + 1 == data.len();
        let must_escape = matches!(e, 0x00 | 0x0a | 0x0d | 0x3d)
            || (col == 0 && matches!(e, b'.' | b'\t' | b' '))
            || (last_in_line && matches!(e, b'\t' | b' '));
        if must_escape {
            out.push(b'=');
            out.push(e.wrapping_add(64));
            col += 2;
        } else {
            out.push(e);
            col += 1;
        }
        if col >= line_len {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_byte_value_survives_encode_decode() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let wire = encode_part(&data, "all.bin", 1, 4096, 0, 128);
        let part = decode(&wire, data.len()).unwrap();
        assert_eq!(part.data, data);
        assert_eq!(part.declared_crc, Some(crc32fast::hash(&data)));
        assert_eq!(part.begin, Some(0));
        assert_eq!(part.part, Some(1));
        assert_eq!(part.total_size, Some(4096));
        assert_eq!(part.name.as_deref(), Some("all.bin"));
    }

    #[test]
    fn ypart_begin_is_converted_to_zero_based_offset() {
        let wire = encode_part(b"hello", "f.bin", 3, 1000, 500, 128);
        let part = decode(&wire, 5).unwrap();
        assert_eq!(part.begin, Some(500));
        assert_eq!(part.end_size, Some(5));
    }

    #[test]
    fn single_part_uses_crc32_and_offset_zero() {
        let wire = encode_single(b"single", "one.txt", 128);
        let part = decode(&wire, 6).unwrap();
        assert_eq!(part.part, None);
        assert_eq!(part.begin, Some(0));
        assert_eq!(part.declared_crc, Some(crc32fast::hash(b"single")));
    }

    #[test]
    fn name_keeps_spaces() {
        let wire = encode_single(b"x", "my file name.nfo", 128);
        assert_eq!(
            decode(&wire, 1).unwrap().name.as_deref(),
            Some("my file name.nfo")
        );
    }

    #[test]
    fn leading_dot_is_escaped_so_dot_stuffing_cannot_eat_it() {
        // 0x2e - 42 = 0x04: encodes to '.' at the start of the line
        let data = [0x04u8, 0x04, 0x04];
        let wire = encode_single(&data, "d", 128);
        let body_line = wire.split(|&b| b == b'\n').nth(1).unwrap();
        assert!(body_line.starts_with(b"="), "leading dot must be escaped");
        assert_eq!(decode(&wire, 3).unwrap().data, data);
    }

    #[test]
    fn missing_trailer_is_malformed() {
        let mut wire = encode_single(b"abc", "t", 128);
        let cut = wire.len() - 30;
        wire.truncate(cut);
        assert!(matches!(
            decode(&wire, 3),
            Err(DecodeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn wrong_pcrc32_still_returns_the_bytes() {
        let wire = String::from_utf8(encode_part(b"abc", "w", 1, 3, 0, 128))
            .unwrap()
            .replace(&format!("pcrc32={:08x}", crc32fast::hash(b"abc")), "pcrc32=deadbeef");
        let part = decode(wire.as_bytes(), 3).unwrap();
        assert_eq!(part.data, b"abc");
        assert_eq!(part.declared_crc, Some(0xdead_beef));
    }

    #[test]
    fn missing_header_is_malformed() {
        assert!(matches!(
            decode(b"just text\r\n", 0),
            Err(DecodeError::MalformedPayload(_))
        ));
        assert!(!looks_like_yenc(b"just text\r\n"));
    }
}
