//! Source-URI grammar for secret and remote-style inputs.
//!
//! ```text
//! fileb://P   read file at P as raw bytes          (encoding = binary)
//! file://P    read file at P as base64 text        (encoding = base64)
//! base64:D    inline literal base64 payload D      (encoding = base64)
//! other       plain path, encoding chosen by action defaults
//! ```

use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

/// How payload bytes are represented at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Raw bytes.
    Binary,
    /// Base64 text (whitespace tolerated).
    Base64,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Binary => "binary",
            Encoding::Base64 => "base64",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where payload bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceRef {
    /// A file on disk.
    Path(PathBuf),
    /// An inline base64 literal carried in the recipe itself.
    Inline(String),
}

impl SourceRef {
    /// Read the raw payload and decode it per `encoding`.
    pub fn read(&self, encoding: Encoding) -> Result<Vec<u8>> {
        match self {
            SourceRef::Path(path) => {
                let raw = fs::read(path)
                    .with_context(|| format!("failed to read source {}", path.display()))?;
                decode(&raw, encoding)
            }
            // Inline payloads are base64 by grammar, whatever the
            // requested encoding says.
            SourceRef::Inline(data) => decode(data.as_bytes(), Encoding::Base64),
        }
    }
}

/// A parsed source: the reference plus the encoding the grammar itself
/// prescribes (`None` when the action default decides).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSource {
    pub source: SourceRef,
    pub encoding: Option<Encoding>,
}

/// Parse a source input per the grammar above.
pub fn parse_source(input: &str) -> ParsedSource {
    if let Some(path) = input.strip_prefix("fileb://") {
        return ParsedSource {
            source: SourceRef::Path(PathBuf::from(path)),
            encoding: Some(Encoding::Binary),
        };
    }
    if let Some(path) = input.strip_prefix("file://") {
        return ParsedSource {
            source: SourceRef::Path(PathBuf::from(path)),
            encoding: Some(Encoding::Base64),
        };
    }
    if let Some(data) = input.strip_prefix("base64:") {
        return ParsedSource {
            source: SourceRef::Inline(data.to_string()),
            encoding: Some(Encoding::Base64),
        };
    }
    ParsedSource {
        source: SourceRef::Path(PathBuf::from(input)),
        encoding: None,
    }
}

/// Decode payload bytes from their at-rest representation.
pub fn decode(raw: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Binary => Ok(raw.to_vec()),
        Encoding::Base64 => {
            let text = std::str::from_utf8(raw).context("base64 payload is not UTF-8")?;
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64.decode(compact).context("invalid base64 payload")
        }
    }
}

/// Encode payload bytes into their at-rest representation.
pub fn encode(bytes: &[u8], encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Binary => bytes.to_vec(),
        Encoding::Base64 => BASE64.encode(bytes).into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grammar_prefixes() {
        assert_eq!(
            parse_source("fileb:///etc/secret.bin"),
            ParsedSource {
                source: SourceRef::Path(PathBuf::from("/etc/secret.bin")),
                encoding: Some(Encoding::Binary),
            }
        );
        assert_eq!(
            parse_source("file:///etc/secret.b64"),
            ParsedSource {
                source: SourceRef::Path(PathBuf::from("/etc/secret.b64")),
                encoding: Some(Encoding::Base64),
            }
        );
        assert_eq!(
            parse_source("base64:aGVsbG8="),
            ParsedSource {
                source: SourceRef::Inline("aGVsbG8=".to_string()),
                encoding: Some(Encoding::Base64),
            }
        );
    }

    #[test]
    fn bare_path_leaves_encoding_to_the_action() {
        let parsed = parse_source("/var/lib/secret");
        assert_eq!(parsed.source, SourceRef::Path(PathBuf::from("/var/lib/secret")));
        assert_eq!(parsed.encoding, None);
    }

    #[test]
    fn inline_payload_decodes() {
        let parsed = parse_source("base64:aGVsbG8=");
        let bytes = parsed.source.read(Encoding::Base64).expect("read");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn base64_decode_tolerates_whitespace() {
        let bytes = decode(b"aGVs\nbG8=\n", Encoding::Base64).expect("decode");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn encode_decode_are_duals() {
        for encoding in [Encoding::Binary, Encoding::Base64] {
            let payload = b"\x00\x01hola\xff";
            let encoded = encode(payload, encoding);
            assert_eq!(decode(&encoded, encoding).expect("decode"), payload);
        }
    }

    #[test]
    fn file_sources_read_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("raw.bin");
        std::fs::write(&raw, b"\x01\x02\x03").expect("write");

        let parsed = parse_source(&format!("fileb://{}", raw.display()));
        assert_eq!(
            parsed.source.read(parsed.encoding.unwrap()).expect("read"),
            b"\x01\x02\x03"
        );

        let b64 = dir.path().join("payload.b64");
        std::fs::write(&b64, BASE64.encode(b"inner")).expect("write");
        let parsed = parse_source(&format!("file://{}", b64.display()));
        assert_eq!(parsed.source.read(parsed.encoding.unwrap()).expect("read"), b"inner");
    }
}
