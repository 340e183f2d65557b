use std::ascii;
use std::fmt;
use std::str::FromStr;

/// Text encodings tried on echo request payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

pub const ENCODING_NAMES: &[&str] = &["utf-8", "ascii", "latin-1"];

impl Encoding {
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec()).ok(),
            Encoding::Ascii if bytes.is_ascii() => Some(bytes.iter().map(|&b| b as char).collect()),
            Encoding::Ascii => None,
            Encoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    /// Decoded text, or an escaped `b'...'` rendering if it does not decode.
    pub fn decode_or_escape(self, bytes: &[u8]) -> String {
        self.decode(bytes).unwrap_or_else(|| escape_bytes(bytes))
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "ascii" | "us-ascii" => Ok(Encoding::Ascii),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Encoding::Latin1),
            _ => Err(format!("unknown encoding: {}", s)),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Encoding::Utf8 => ENCODING_NAMES[0],
            Encoding::Ascii => ENCODING_NAMES[1],
            Encoding::Latin1 => ENCODING_NAMES[2],
        };
        f.write_str(name)
    }
}

/// Printable ASCII rendering of arbitrary bytes.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let escaped: String = bytes
        .iter()
        .flat_map(|&b| ascii::escape_default(b))
        .map(char::from)
        .collect();
    format!("b'{}'", escaped)
}
