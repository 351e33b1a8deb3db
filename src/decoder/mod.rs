//! Article body decoding
//!
//! [`decode`] turns an article body, as the NNTP client returns it, into
//! [`Decoded`] bytes. yEnc is tried first; a body without `=ybegin`, or whose
//! yEnc framing is malformed, is tried as uuencode. Articles fetched by a
//! pre-check are only inspected for removal notices.
//!
//! [`DecoderPool`] runs decodes on a fixed set of workers behind a bounded queue.

mod pool;
pub mod uu;
pub mod yenc;

pub use pool::{DecodeJob, DecodeOutcome, DecoderPool, DecodedMeta};

use crate::error::DecodeError;
use crate::nntp::contains_removal_marker;
use serde::{Deserialize, Serialize};

/// Bytes hashed for the 16K-signature
pub const SIGNATURE_BYTES: usize = 16 * 1024;

/// Payload encoding of a decoded article
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// yEnc
    Yenc,
    /// uuencode
    Uu,
}

/// Decoded article payload and what the framing said about it
#[derive(Clone, Debug, Default)]
pub struct Decoded {
    /// Decoded bytes
    pub data: Vec<u8>,
    /// File name carried by the framing
    pub filename: Option<String>,
    /// Whole-file size declared by the framing
    pub file_size: Option<u64>,
    /// Offset of this part in the target file, when the framing says
    pub data_begin: Option<u64>,
    /// Number of decoded bytes
    pub data_size: u64,
    /// CRC32 of the decoded bytes
    pub crc: u32,
    /// MD5 of the first 16 KiB, for the lowest-partnum article
    pub signature: Option<[u8; 16]>,
    /// Encoding that decoded the body
    pub encoding: Option<Encoding>,
}

/// Per-article context the decoder needs
#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeContext {
    /// Compute the 16K-signature
    pub lowest_partnum: bool,
    /// Article was fetched by a pre-check: inspect, do not decode
    pub precheck: bool,
    /// Expected decoded size, used to size buffers
    pub size_hint: usize,
}

/// Lines of a body with `\r\n` stripped
pub(crate) fn lines(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    raw.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

/// Decode one article body
pub fn decode(raw: &[u8], ctx: DecodeContext) -> Result<Decoded, DecodeError> {
    if ctx.precheck {
        return inspect_headers(raw).map(|()| Decoded::default());
    }

    let yenc_attempt = if yenc::looks_like_yenc(raw) {
        match yenc::decode(raw, ctx.size_hint) {
            Ok(part) => Some(Ok(part)),
            Err(DecodeError::OutOfMemory) => return Err(DecodeError::OutOfMemory),
            Err(e) => Some(Err(e)),
        }
    } else {
        None
    };

    match yenc_attempt {
        Some(Ok(part)) => finish_yenc(part, ctx),
        Some(Err(yenc_err)) => match uu::decode(raw, ctx.size_hint) {
            Ok(part) => Ok(finish_uu(part, ctx)),
            Err(DecodeError::OutOfMemory) => Err(DecodeError::OutOfMemory),
            Err(_) => Err(yenc_err),
        },
        None => match uu::decode(raw, ctx.size_hint) {
            Ok(part) => Ok(finish_uu(part, ctx)),
            Err(DecodeError::OutOfMemory) => Err(DecodeError::OutOfMemory),
            Err(e) => Err(e),
        },
    }
}

fn signature(data: &[u8], ctx: DecodeContext) -> Option<[u8; 16]> {
    ctx.lowest_partnum
        .then(|| md5::compute(&data[..data.len().min(SIGNATURE_BYTES)]).0)
}

fn finish_yenc(part: yenc::YencPart, ctx: DecodeContext) -> Result<Decoded, DecodeError> {
    let crc = crc32fast::hash(&part.data);
    let data_size = part.data.len() as u64;
    let decoded = Decoded {
        signature: signature(&part.data, ctx),
        filename: part.name,
        file_size: part.total_size,
        data_begin: part.begin,
        data_size,
        crc,
        encoding: Some(Encoding::Yenc),
        data: part.data,
    };

    let size_ok = part.end_size.is_none_or(|s| s == data_size);
    match part.declared_crc {
        Some(expected) if expected == crc && size_ok => Ok(decoded),
        expected => Err(DecodeError::BadData {
            decoded: Box::new(decoded),
            expected,
            computed: crc,
        }),
    }
}

fn finish_uu(part: uu::UuPart, ctx: DecodeContext) -> Decoded {
    let crc = crc32fast::hash(&part.data);
    Decoded {
        signature: signature(&part.data, ctx),
        filename: part.name,
        file_size: None,
        data_begin: None,
        data_size: part.data.len() as u64,
        crc,
        encoding: Some(Encoding::Uu),
        data: part.data,
    }
}

/// True for `Name: value` lines
fn is_header_line(line: &str) -> bool {
    line.split_once(':').is_some_and(|(name, _)| {
        !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Look at the first 2 KB of a served article: a removal marker in a header
/// other than `Message-ID` and `X-` headers means it is gone. Inspection stops
/// at the first line that is not a header, so bare bodies always pass.
pub fn inspect_headers(raw: &[u8]) -> Result<(), DecodeError> {
    let head = &raw[..raw.len().min(2048)];
    for line in lines(head) {
        let text = String::from_utf8_lossy(line);
        if !is_header_line(&text) {
            break;
        }
        let lower = text.to_ascii_lowercase();
        if lower.starts_with("x-") || lower.starts_with("message-id:") {
            continue;
        }
        if let Some(marker) = contains_removal_marker(&lower) {
            return Err(DecodeError::NotAvailable(format!(
                "header mentions '{marker}'"
            )));
        }
    }
    Ok(())
}
