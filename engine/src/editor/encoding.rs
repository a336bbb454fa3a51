//! Source encoding detection and normalisation to BOM-less UTF-8.

use crate::error::EditResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: &[u8] = &[0xFF, 0xFE];
const UTF16BE_BOM: &[u8] = &[0xFE, 0xFF];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Unknown,
}

impl Encoding {
    pub fn label(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Utf8Bom => "UTF-8-BOM",
            Self::Utf16Le => "UTF-16LE",
            Self::Utf16Be => "UTF-16BE",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        if data.starts_with(UTF8_BOM) {
            Self::Utf8Bom
        } else if data.starts_with(UTF16LE_BOM) {
            Self::Utf16Le
        } else if data.starts_with(UTF16BE_BOM) {
            Self::Utf16Be
        } else if std::str::from_utf8(data).is_ok() {
            Self::Utf8
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn detect_encoding(path: &Path) -> EditResult<Encoding> {
    let data = fs::read(path)?;
    let encoding = Encoding::from_bytes(&data);
    debug!(path = %path.display(), %encoding, "Detected encoding");
    Ok(encoding)
}

/// Decode `data` to a UTF-8 string, repairing what cannot be decoded.
pub fn decode(data: &[u8]) -> String {
    match Encoding::from_bytes(data) {
        Encoding::Utf8 => String::from_utf8_lossy(data).into_owned(),
        Encoding::Utf8Bom => String::from_utf8_lossy(&data[UTF8_BOM.len()..]).into_owned(),
        Encoding::Utf16Le => decode_utf16(&data[2..], u16::from_le_bytes),
        Encoding::Utf16Be => decode_utf16(&data[2..], u16::from_be_bytes),
        Encoding::Unknown => String::from_utf8_lossy(data).into_owned(),
    }
}

fn decode_utf16(data: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = data.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Rewrite `path` as BOM-less UTF-8. Returns the encoding found before the
/// rewrite; the file is untouched when it already was plain UTF-8.
pub fn ensure_utf8(path: &Path) -> EditResult<Encoding> {
    let data = fs::read(path)?;
    let encoding = Encoding::from_bytes(&data);
    if encoding == Encoding::Utf8 {
        return Ok(encoding);
    }
    if encoding == Encoding::Unknown {
        warn!(path = %path.display(), "Invalid UTF-8, replacing undecodable bytes");
    }
    fs::write(path, decode(&data))?;
    info!(path = %path.display(), from = %encoding, "Converted to UTF-8");
    Ok(encoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_labels() {
        assert_eq!(Encoding::from_bytes(b"plain"), Encoding::Utf8);
        assert_eq!(Encoding::from_bytes(b"\xEF\xBB\xBFx"), Encoding::Utf8Bom);
        assert_eq!(Encoding::from_bytes(b"\xFF\xFEx\x00"), Encoding::Utf16Le);
        assert_eq!(Encoding::from_bytes(b"\xFE\xFF\x00x"), Encoding::Utf16Be);
        assert_eq!(Encoding::from_bytes(b"a\xC3(b"), Encoding::Unknown);
        assert_eq!(Encoding::Utf8Bom.to_string(), "UTF-8-BOM");
    }

    #[test]
    fn test_ensure_utf8_strips_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tex");
        fs::write(&path, b"\xEF\xBB\xBF\\section{x}").unwrap();
        assert_eq!(ensure_utf8(&path).unwrap(), Encoding::Utf8Bom);
        assert_eq!(fs::read(&path).unwrap(), b"\\section{x}");
        assert_eq!(detect_encoding(&path).unwrap(), Encoding::Utf8);
    }

    #[test]
    fn test_ensure_utf8_transcodes_utf16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tex");
        let mut data = vec![0xFF, 0xFE];
        for unit in "中x".encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        fs::write(&path, data).unwrap();
        ensure_utf8(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "中x");
    }

    #[test]
    fn test_ensure_utf8_repairs_invalid_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tex");
        fs::write(&path, b"ok\xFFok").unwrap();
        assert_eq!(ensure_utf8(&path).unwrap(), Encoding::Unknown);
        assert_eq!(fs::read_to_string(&path).unwrap(), "ok\u{FFFD}ok");
    }
}
