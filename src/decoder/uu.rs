//! uuencode bodies (legacy 6-bit text encoding)

use super::lines;
use crate::error::DecodeError;

#[derive(Debug)]
pub(crate) struct UuPart {
    pub data: Vec<u8>,
    pub name: Option<String>,
}

fn sixbit(c: u8) -> u8 {
    c.wrapping_sub(b' ') & 0x3f
}

/// Decoded length announced by the first character of a data line
fn line_len(line: &[u8]) -> Option<usize> {
    let first = *line.first()?;
    if !(b' '..=b'`').contains(&first) {
        return None;
    }
    Some(sixbit(first) as usize)
}

/// A uu data line carries at least `ceil(n/3)*4` characters after the length byte
fn is_data_line(line: &[u8]) -> bool {
    match line_len(line) {
        Some(0) => line.len() <= 2,
        Some(n) => {
            let needed = n.div_ceil(3) * 4;
            line.len() > needed
                && line.len() <= needed + 3
                && line[1..].iter().all(|c| (b' '..=b'`').contains(c))
        }
        None => false,
    }
}

/// Decode a uuencoded body. A `begin` line is optional (continuation parts of
/// multi-part posts have none), but at least one data line is required.
pub(crate) fn decode(raw: &[u8], size_hint: usize) -> Result<UuPart, DecodeError> {
    let mut data = Vec::new();
    data.try_reserve(size_hint)
        .map_err(|_| DecodeError::OutOfMemory)?;

    let mut name = None;
    let mut data_lines = 0usize;
    let mut started = false;

    for line in lines(raw) {
        if !started && line.starts_with(b"begin ") {
            let text = String::from_utf8_lossy(line);
            let mut parts = text.splitn(3, ' ');
            parts.next();
            let mode = parts.next().unwrap_or("");
            if mode.chars().all(|c| c.is_digit(8)) && !mode.is_empty() {
                name = parts.next().map(|n| n.trim().to_string());
                started = true;
                continue;
            }
        }
        if line == b"end" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        if !is_data_line(line) {
            if started || data_lines > 0 {
                return Err(DecodeError::MalformedPayload(
                    "invalid uuencode data line".into(),
                ));
            }
            continue;
        }
        started = true;

        let n = line_len(line).unwrap_or(0);
        if n == 0 {
            continue;
        }
        data.try_reserve(n).map_err(|_| DecodeError::OutOfMemory)?;
        let mut decoded = Vec::with_capacity(n + 2);
        for quad in line[1..].chunks(4) {
            let c = |i: usize| quad.get(i).copied().map(sixbit).unwrap_or(0);
            decoded.push((c(0) << 2) | (c(1) >> 4));
            decoded.push((c(1) << 4) | (c(2) >> 2));
            decoded.push((c(2) << 6) | c(3));
        }
        decoded.truncate(n);
        data.extend_from_slice(&decoded);
        data_lines += 1;
    }

    if data_lines == 0 {
        return Err(DecodeError::MalformedPayload(
            "no uuencode data lines".into(),
        ));
    }
    Ok(UuPart { data, name })
}

/// uuencode `data` with a `begin 644 name` header and `end` trailer
pub fn encode(data: &[u8], name: &str) -> Vec<u8> {
    let enc = |v: u8| if v == 0 { b'`' } else { v + b' ' };
    let mut out = format!("begin 644 {name}\r\n").into_bytes();
    for chunk in data.chunks(45) {
        out.push(enc(chunk.len() as u8));
        for triple in chunk.chunks(3) {
            let b = |i: usize| triple.get(i).copied().unwrap_or(0);
            out.push(enc(b(0) >> 2));
            out.push(enc(((b(0) << 4) | (b(1) >> 4)) & 0x3f));
            out.push(enc(((b(1) << 2) | (b(2) >> 6)) & 0x3f));
            out.push(enc(b(2) & 0x3f));
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"`\r\nend\r\n");
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_encode_produces() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let wire = encode(&data, "legacy.bin");
        let part = decode(&wire, data.len()).unwrap();
        assert_eq!(part.data, data);
        assert_eq!(part.name.as_deref(), Some("legacy.bin"));
    }

    #[test]
    fn known_vector_cat() {
        // "Cat" encodes to "#0V%T"
        let wire = b"begin 644 cat.txt\r\n#0V%T\r\n`\r\nend\r\n";
        assert_eq!(decode(wire, 3).unwrap().data, b"Cat");
    }

    #[test]
    fn continuation_part_without_begin_line() {
        let wire = encode(b"continuation bytes", "x");
        let body: Vec<u8> = wire
            .split(|&b| b == b'\n')
            .skip(1)
            .flat_map(|l| l.iter().copied().chain(std::iter::once(b'\n')))
            .collect();
        let part = decode(&body, 18).unwrap();
        assert_eq!(part.data, b"continuation bytes");
        assert!(part.name.is_none());
    }

    #[test]
    fn prose_is_not_uuencode() {
        assert!(matches!(
            decode(b"Hello there, this is plain text.\r\n", 0),
            Err(DecodeError::MalformedPayload(_))
        ));
    }
}
