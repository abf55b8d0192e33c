//! Model path transcoding.
//!
//! Callers hand paths over as UTF-8 bytes. Platforms whose file APIs take
//! wide strings (Windows) get them re-encoded as UTF-16 before they reach the
//! engine; everywhere else the UTF-8 string is used as is.

use std::path::PathBuf;

use crate::error::{EngineError, Result};

/// Native path encoding expected by the engine's file APIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathEncoding {
    /// Byte strings (UTF-8).
    Narrow,
    /// UTF-16 code units.
    Wide,
}

impl PathEncoding {
    /// Encoding of the compilation target.
    pub const fn native() -> Self {
        if cfg!(windows) { Self::Wide } else { Self::Narrow }
    }
}

impl Default for PathEncoding {
    fn default() -> Self {
        Self::native()
    }
}

/// A model path decoded from caller bytes and held in the native encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelPath {
    Narrow(String),
    Wide(Vec<u16>),
}

impl ModelPath {
    /// Decode `bytes` as UTF-8 and re-encode for `encoding`.
    ///
    /// Malformed UTF-8 fails with [`EngineError::InvalidPathEncoding`]
    /// carrying the offset of the first bad byte. Nothing is replaced or
    /// dropped.
    pub fn from_utf8(bytes: &[u8], encoding: PathEncoding) -> Result<Self> {
        let s = std::str::from_utf8(bytes).map_err(|e| EngineError::InvalidPathEncoding {
            valid_up_to: e.valid_up_to(),
        })?;
        Ok(match encoding {
            PathEncoding::Narrow => Self::Narrow(s.to_owned()),
            PathEncoding::Wide => Self::Wide(s.encode_utf16().collect()),
        })
    }

    pub fn encoding(&self) -> PathEncoding {
        match self {
            Self::Narrow(_) => PathEncoding::Narrow,
            Self::Wide(_) => PathEncoding::Wide,
        }
    }

    /// Filesystem path for the engine.
    #[cfg(windows)]
    pub fn to_path_buf(&self) -> Result<PathBuf> {
        use std::os::windows::ffi::OsStringExt;
        Ok(match self {
            Self::Narrow(s) => PathBuf::from(s),
            Self::Wide(units) => PathBuf::from(std::ffi::OsString::from_wide(units)),
        })
    }

    /// Filesystem path for the engine.
    #[cfg(not(windows))]
    pub fn to_path_buf(&self) -> Result<PathBuf> {
        match self {
            Self::Narrow(s) => Ok(PathBuf::from(s)),
            // Only reachable when a caller forces Wide on a narrow platform.
            Self::Wide(units) => String::from_utf16(units)
                .map(PathBuf::from)
                .map_err(|_| EngineError::InvalidPathEncoding { valid_up_to: 0 }),
        }
    }
}

impl std::fmt::Display for ModelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Narrow(s) => f.write_str(s),
            Self::Wide(units) => f.write_str(&String::from_utf16_lossy(units)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_transcoding_is_lossless() {
        let src = "models/réal-ESRGAN/模型 x4.onnx";
        let wide = ModelPath::from_utf8(src.as_bytes(), PathEncoding::Wide).expect("valid utf-8");
        let ModelPath::Wide(units) = &wide else {
            panic!("expected wide path");
        };
        assert_eq!(String::from_utf16(units).expect("utf-16"), src);
        assert_eq!(wide.to_path_buf().expect("path"), PathBuf::from(src));
    }

    #[test]
    fn narrow_keeps_string() {
        let p = ModelPath::from_utf8(b"a/b.onnx", PathEncoding::Narrow).expect("valid");
        assert_eq!(p, ModelPath::Narrow("a/b.onnx".into()));
        assert_eq!(p.encoding(), PathEncoding::Narrow);
    }

    #[test]
    fn malformed_utf8_reports_offset() {
        let bytes = b"mod\xffel.onnx";
        for enc in [PathEncoding::Narrow, PathEncoding::Wide] {
            let err = ModelPath::from_utf8(bytes, enc).expect_err("malformed");
            assert!(matches!(
                err,
                EngineError::InvalidPathEncoding { valid_up_to: 3 }
            ));
        }
    }

    #[test]
    fn native_encoding_follows_target() {
        assert_eq!(PathEncoding::native() == PathEncoding::Wide, cfg!(windows));
    }
}
