//! Reversible token quoting for the command channel.
//!
//! Plain tokens go on the wire verbatim. A token containing whitespace,
//! control bytes, `"` or `\` (or an empty token) is wrapped in double quotes
//! with C-style escapes inside:
//!
//! ```text
//! hello        -> hello
//! hello world  -> "hello world"
//! a"b\c        -> "a\"b\\c"
//! <0x01>       -> "\001"
//! ```
//!
//! Bytes >= 0x80 pass through untouched so UTF-8 text stays readable.

use tokio_util::bytes::{BufMut, BytesMut};

/// Error produced while decoding a quoted token or tokenizing a line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscapeError {
    #[error("unterminated quoted string")]
    Unterminated,
    #[error("invalid escape sequence at offset {0}")]
    InvalidEscape(usize),
    #[error("unexpected data after closing quote at offset {0}")]
    TrailingData(usize),
}

fn is_special(b: u8) -> bool {
    b <= b' ' || b == 0x7f || b == b'"' || b == b'\\'
}

/// True when `token` cannot be emitted verbatim.
pub fn needs_quoting(token: &[u8]) -> bool {
    token.is_empty() || token.iter().copied().any(is_special)
}

/// Append the wire form of `token` to `dst`.
pub fn encode_token(token: &[u8], dst: &mut BytesMut) {
    if !needs_quoting(token) {
        dst.extend_from_slice(token);
        return;
    }

    dst.reserve(token.len() + 2);
    dst.put_u8(b'"');
    for &b in token {
        match b {
            b'\\' => dst.extend_from_slice(b"\\\\"),
            b'"' => dst.extend_from_slice(b"\\\""),
            b'\n' => dst.extend_from_slice(b"\\n"),
            b'\r' => dst.extend_from_slice(b"\\r"),
            b'\t' => dst.extend_from_slice(b"\\t"),
            b if b < b' ' || b == 0x7f => {
                dst.put_u8(b'\\');
                dst.put_u8(b'0' + (b >> 6));
                dst.put_u8(b'0' + ((b >> 3) & 0o7));
                dst.put_u8(b'0' + (b & 0o7));
            }
            b => dst.put_u8(b),
        }
    }
    dst.put_u8(b'"');
}

/// Decode a quoted token starting at `src[0] == b'"'`.
///
/// Returns the decoded bytes and the number of input bytes consumed,
/// including both quotes.
pub fn decode_quoted(src: &[u8]) -> Result<(Vec<u8>, usize), EscapeError> {
    debug_assert_eq!(src.first(), Some(&b'"'));

    let mut out = Vec::with_capacity(src.len());
    let mut i = 1;
    while i < src.len() {
        match src[i] {
            b'"' => return Ok((out, i + 1)),
            b'\\' => {
                let esc = *src.get(i + 1).ok_or(EscapeError::Unterminated)?;
                match esc {
                    b'\\' => out.push(b'\\'),
                    b'"' => out.push(b'"'),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'0'..=b'3' => {
                        let digits = src.get(i + 1..i + 4).ok_or(EscapeError::Unterminated)?;
                        if !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                            return Err(EscapeError::InvalidEscape(i));
                        }
                        out.push(
                            ((digits[0] - b'0') << 6) | ((digits[1] - b'0') << 3) | (digits[2] - b'0'),
                        );
                        i += 4;
                        continue;
                    }
                    _ => return Err(EscapeError::InvalidEscape(i)),
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(EscapeError::Unterminated)
}

/// Decode a single wire token (quoted or verbatim) that spans all of `src`.
pub fn decode_token(src: &[u8]) -> Result<Vec<u8>, EscapeError> {
    if src.first() != Some(&b'"') {
        return Ok(src.to_vec());
    }
    let (token, used) = decode_quoted(src)?;
    if used != src.len() {
        return Err(EscapeError::TrailingData(used));
    }
    Ok(token)
}

/// Split a line into decoded tokens separated by spaces or tabs.
pub fn split_tokens(line: &[u8]) -> Result<Vec<Vec<u8>>, EscapeError> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < line.len() {
        if line[i] == b' ' || line[i] == b'\t' {
            i += 1;
            continue;
        }
        if line[i] == b'"' {
            let (token, used) = decode_quoted(&line[i..])?;
            i += used;
            if i < line.len() && line[i] != b' ' && line[i] != b'\t' {
                return Err(EscapeError::TrailingData(i));
            }
            tokens.push(token);
        } else {
            let start = i;
            while i < line.len() && line[i] != b' ' && line[i] != b'\t' {
                i += 1;
            }
            tokens.push(line[start..i].to_vec());
        }
    }
    Ok(tokens)
}
