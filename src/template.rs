//! Log line templates: the whole line, and the IP and ICMP parts of a
//! ping record.
//!
//! Literal text with `{name}` or `{name:x}` placeholders, `{{` and `}}`
//! for literal braces. Field names are checked when the template is
//! parsed, so rendering never fails.

use std::marker::PhantomData;
use std::str::FromStr;

use crate::packet::{IcmpPacket, IpHeader};

pub const DEFAULT_IP_TEMPLATE: &str = " {src}:{ident}";
pub const DEFAULT_ICMP_TEMPLATE: &str = " {ident} {seq_num}";

pub enum Value {
    Int(u64),
    Text(String),
}

/// Something a template can pull named values out of.
pub trait Fields {
    const NAMES: &'static [&'static str];

    fn field(&self, name: &str) -> Option<Value>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { name: String, hex: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template<F> {
    segments: Vec<Segment>,
    fields: PhantomData<fn(&F)>,
}

impl<F: Fields> Template<F> {
    pub fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut spec = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => spec.push(c),
                            None => return Err(format!("unterminated placeholder in {:?}", template)),
                        }
                    }

                    let (name, hex) = match spec.split_once(':') {
                        None => (spec.as_str(), false),
                        Some((name, "x")) => (name, true),
                        Some((_, format)) => return Err(format!("unsupported format {:?}, only 'x'", format)),
                    };
                    if !F::NAMES.contains(&name) {
                        return Err(format!("unknown field {:?} (known: {})", name, F::NAMES.join(", ")));
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field { name: name.to_string(), hex });
                }
                '}' => return Err(format!("single '}}' in {:?}", template)),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Template { segments, fields: PhantomData })
    }

    pub fn render(&self, fields: &F) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { name, hex } => match fields.field(name) {
                    Some(Value::Int(v)) if *hex => out.push_str(&format!("{:x}", v)),
                    Some(Value::Int(v)) => out.push_str(&v.to_string()),
                    Some(Value::Text(text)) => out.push_str(&text),
                    None => {}
                },
            }
        }
        out
    }
}

impl<F: Fields> FromStr for Template<F> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Fields for IpHeader {
    const NAMES: &'static [&'static str] = &[
        "version", "ihl", "tos", "length", "ident", "flags", "fragoffset",
        "ttl", "proto", "hdr_checksum", "src", "dst",
    ];

    fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "version" => Value::Int(self.version.into()),
            "ihl" => Value::Int(self.ihl.into()),
            "tos" => Value::Int(self.tos.into()),
            "length" => Value::Int(self.length.into()),
            "ident" => Value::Int(self.ident.into()),
            "flags" => Value::Int(self.flags.bits().into()),
            "fragoffset" => Value::Int(self.fragment_offset.into()),
            "ttl" => Value::Int(self.ttl.into()),
            "proto" => Value::Int(self.protocol.into()),
            "hdr_checksum" => Value::Int(self.checksum.into()),
            "src" => Value::Text(self.source().to_string()),
            "dst" => Value::Text(self.destination().to_string()),
            _ => return None,
        };
        Some(value)
    }
}

impl Fields for IcmpPacket {
    const NAMES: &'static [&'static str] = &["type", "code", "checksum", "ident", "seq_num", "size"];

    fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "type" => Value::Int(self.message_type.into()),
            "code" => Value::Int(self.code.into()),
            "checksum" => Value::Int(self.checksum.into()),
            "ident" => Value::Int(self.identifier.into()),
            "seq_num" => Value::Int(self.sequence.into()),
            "size" => Value::Int(self.payload.len() as u64),
            _ => return None,
        };
        Some(value)
    }
}
