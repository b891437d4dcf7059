//! Text charsets supported for request bodies and response decoding

use crate::error::HttpAccessError;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use url::form_urlencoded::EncodingOverride;

/// A character set used to encode request text and decode response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    /// ISO-8859-1
    Latin1,
    /// US-ASCII
    Ascii,
}

impl Charset {
    /// Canonical IANA name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Latin1 => "ISO-8859-1",
            Self::Ascii => "US-ASCII",
        }
    }

    /// Encode text, replacing unmappable characters with `?`.
    #[must_use]
    pub fn encode(self, text: &str) -> Cow<'_, [u8]> {
        let limit = match self {
            Self::Utf8 => return Cow::Borrowed(text.as_bytes()),
            Self::Latin1 => 0xFF,
            Self::Ascii => 0x7F,
        };
        if text.is_ascii() {
            return Cow::Borrowed(text.as_bytes());
        }
        Cow::Owned(
            text.chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .ok()
                        .filter(|b| u32::from(*b) <= limit)
                        .unwrap_or(b'?')
                })
                .collect(),
        )
    }

    /// Decode bytes, replacing invalid sequences with U+FFFD.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|b| char::from(*b)).collect(),
            Self::Ascii => bytes
                .iter()
                .map(|b| {
                    if b.is_ascii() {
                        char::from(*b)
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
        }
    }

    /// Encoding hook for `application/x-www-form-urlencoded` serialization
    #[must_use]
    pub fn form_encoding(self) -> EncodingOverride<'static> {
        match self {
            Self::Utf8 => None,
            Self::Latin1 => Some(&encode_latin1),
            Self::Ascii => Some(&encode_ascii),
        }
    }
}

fn encode_latin1(text: &str) -> Cow<'_, [u8]> {
    Charset::Latin1.encode(text)
}

fn encode_ascii(text: &str) -> Cow<'_, [u8]> {
    Charset::Ascii.encode(text)
}

impl FromStr for Charset {
    type Err = HttpAccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UTF-8" | "UTF8" => Ok(Self::Utf8),
            "ISO-8859-1" | "ISO8859-1" | "ISO_8859_1" | "LATIN1" => Ok(Self::Latin1),
            "US-ASCII" | "ASCII" => Ok(Self::Ascii),
            _ => Err(HttpAccessError::UnsupportedCharset(s.to_owned())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
