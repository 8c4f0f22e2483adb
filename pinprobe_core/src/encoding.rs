use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Unknown text encoding '{0}'")]
    UnknownEncoding(String),
    #[error("Character {ch:?} at offset {offset} cannot be encoded as {encoding}")]
    Unrepresentable {
        ch: char,
        offset: usize,
        encoding: TextEncoding,
    },
}

/// Text encoding used to turn a candidate into the bytes fed to the target,
/// and to decode what the harness writes back.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
    Utf16Le,
    Utf16Be,
}

impl TextEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf8",
            TextEncoding::Ascii => "ascii",
            TextEncoding::Latin1 => "latin1",
            TextEncoding::Utf16Le => "utf16le",
            TextEncoding::Utf16Be => "utf16be",
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>, EncodingError> {
        match self {
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            TextEncoding::Ascii => self.encode_narrow(text, 0x7F),
            TextEncoding::Latin1 => self.encode_narrow(text, 0xFF),
            TextEncoding::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            TextEncoding::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
        }
    }

    fn encode_narrow(&self, text: &str, max: u32) -> Result<Vec<u8>, EncodingError> {
        text.chars()
            .enumerate()
            .map(|(offset, ch)| {
                let code = ch as u32;
                if code <= max {
                    Ok(code as u8)
                } else {
                    Err(EncodingError::Unrepresentable {
                        ch,
                        offset,
                        encoding: *self,
                    })
                }
            })
            .collect()
    }

    /// Lossy decode. Never fails; unmappable input becomes U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
                let units: Vec<u16> = bytes
                    .chunks(2)
                    .map(|pair| {
                        let pair = [pair[0], pair.get(1).copied().unwrap_or(0)];
                        if *self == TextEncoding::Utf16Le {
                            u16::from_le_bytes(pair)
                        } else {
                            u16::from_be_bytes(pair)
                        }
                    })
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextEncoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(TextEncoding::Utf8),
            "ascii" | "us-ascii" => Ok(TextEncoding::Ascii),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Ok(TextEncoding::Latin1),
            "utf16le" | "utf-16le" => Ok(TextEncoding::Utf16Le),
            "utf16be" | "utf-16be" => Ok(TextEncoding::Utf16Be),
            _ => Err(EncodingError::UnknownEncoding(s.to_string())),
        }
    }
}
