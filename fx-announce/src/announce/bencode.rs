//! The wire-dictionary codec used by HTTP trackers.
//!
//! Values are (de)serialized through [serde_bencode]. Decoding additionally walks the raw
//! document first and rejects dictionaries whose keys are not in ascending byte order,
//! which [serde_bencode] silently accepts.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

const MAX_DEPTH: usize = 64;

/// The result type of the wire-dictionary codec.
pub type Result<T> = std::result::Result<T, BencodeError>;

#[derive(Debug, Error, PartialEq)]
pub enum BencodeError {
    #[error("unexpected end of input at {0}")]
    UnexpectedEof(usize),
    #[error("unexpected character {0:?} at {1}")]
    UnexpectedChar(char, usize),
    #[error("invalid integer at {0}")]
    InvalidInteger(usize),
    #[error("invalid string length at {0}")]
    InvalidStringLength(usize),
    #[error("nesting too deep at {0}")]
    NestingTooDeep(usize),
    #[error("dictionary key \"{key}\" appeared after \"{previous}\"")]
    UnsortedKey { key: String, previous: String },
    #[error("{0}")]
    Serde(String),
}

impl From<serde_bencode::Error> for BencodeError {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

/// Encode the given value into its canonical bencoded form.
/// Dictionary keys are written in ascending byte order.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_bencode::to_bytes(value)?)
}

/// Decode the given bencoded document into the target type.
/// Fields are matched by their (renamed) serde name.
///
/// # Returns
///
/// It returns an error when the document is malformed, when a dictionary key appears after a
/// lexicographically greater key, or when the document doesn't match the target type.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    validate(bytes)?;
    Ok(serde_bencode::from_bytes(bytes)?)
}

/// Validate the structure and dictionary key order of the first value within the given bytes.
pub fn validate(bytes: &[u8]) -> Result<()> {
    let mut pos = 0;
    skip_value(bytes, &mut pos, 0)
}

fn skip_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::NestingTooDeep(*pos));
    }

    match data.get(*pos) {
        Some(b'i') => skip_integer(data, pos),
        Some(b'l') => skip_list(data, pos, depth),
        Some(b'd') => skip_dict(data, pos, depth),
        Some(b'0'..=b'9') => read_bytes(data, pos).map(|_| ()),
        Some(c) => Err(BencodeError::UnexpectedChar(*c as char, *pos)),
        None => Err(BencodeError::UnexpectedEof(*pos)),
    }
}

fn skip_integer(data: &[u8], pos: &mut usize) -> Result<()> {
    *pos += 1;
    let start = *pos;
    let end = find(data, start, b'e')?;
    let digits = data[start..end].strip_prefix(b"-").unwrap_or(&data[start..end]);

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidInteger(start));
    }

    *pos = end + 1;
    Ok(())
}

fn read_bytes<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let start = *pos;
    let colon = find(data, start, b':')?;
    let len = std::str::from_utf8(&data[start..colon])
        .ok()
        .and_then(|e| e.parse::<usize>().ok())
        .ok_or(BencodeError::InvalidStringLength(start))?;
    let end = (colon + 1)
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or(BencodeError::UnexpectedEof(data.len()))?;

    *pos = end;
    Ok(&data[colon + 1..end])
}

fn skip_list(data: &[u8], pos: &mut usize, depth: usize) -> Result<()> {
    *pos += 1;

    loop {
        match data.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                return Ok(());
            }
            Some(_) => skip_value(data, pos, depth + 1)?,
            None => return Err(BencodeError::UnexpectedEof(*pos)),
        }
    }
}

fn skip_dict(data: &[u8], pos: &mut usize, depth: usize) -> Result<()> {
    *pos += 1;
    let mut previous: Option<&[u8]> = None;

    loop {
        match data.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                return Ok(());
            }
            Some(b'0'..=b'9') => {
                let key = read_bytes(data, pos)?;
                if let Some(previous) = previous.filter(|previous| key < *previous) {
                    return Err(BencodeError::UnsortedKey {
                        key: String::from_utf8_lossy(key).to_string(),
                        previous: String::from_utf8_lossy(previous).to_string(),
                    });
                }

                previous = Some(key);
                skip_value(data, pos, depth + 1)?;
            }
            Some(c) => return Err(BencodeError::UnexpectedChar(*c as char, *pos)),
            None => return Err(BencodeError::UnexpectedEof(*pos)),
        }
    }
}

fn find(data: &[u8], start: usize, delimiter: u8) -> Result<usize> {
    data[start.min(data.len())..]
        .iter()
        .position(|e| *e == delimiter)
        .map(|offset| start + offset)
        .ok_or(BencodeError::UnexpectedEof(data.len()))
}
