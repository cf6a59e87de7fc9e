//! Minimal PEM armour for keys and certificates

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{CryptoError, CryptoResult};

const LINE_WIDTH: usize = 64;

/// Wrap `der` in a `-----BEGIN <label>-----` block
pub(crate) fn encode(label: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for chunk in body.as_bytes().chunks(LINE_WIDTH) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

/// Returns true if `data` looks like a PEM block
pub(crate) fn is_pem(data: &[u8]) -> bool {
    let trimmed = data.iter().position(|b| !b.is_ascii_whitespace()).map_or(&[][..], |p| &data[p..]);
    trimmed.starts_with(b"-----BEGIN ")
}

/// Extract the payload of the `label` block
pub(crate) fn decode(label: &str, data: &[u8]) -> CryptoResult<Vec<u8>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| CryptoError::SerializationError("PEM data is not UTF-8".into()))?;
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);

    let start = text
        .find(&begin)
        .ok_or_else(|| CryptoError::SerializationError(format!("missing {} header", label)))?
        + begin.len();
    let stop = text[start..]
        .find(&end)
        .ok_or_else(|| CryptoError::SerializationError(format!("missing {} footer", label)))?
        + start;

    let body: String = text[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(body)
        .map_err(|e| CryptoError::SerializationError(e.to_string()))
}
