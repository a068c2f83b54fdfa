//! Scalar and array value codec.
//!
//! Decodes raw target bytes into [`Value`]s for a [`ValueType`] under a
//! chosen [`Endianness`], encodes them back, and parses user-entered text.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Byte order of values in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Default for Endianness {
    fn default() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

/// Semantic type of a scanned value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Pointer-sized unsigned integer (8 bytes).
    Pointer,
    /// UTF-8 text of the given byte length.
    String(usize),
    /// Raw byte array of the given length.
    Bytes(usize),
}

impl ValueType {
    /// Size in bytes of one value.
    pub fn size(self) -> usize {
        match self {
            ValueType::U8 | ValueType::I8 => 1,
            ValueType::U16 | ValueType::I16 => 2,
            ValueType::U32 | ValueType::I32 | ValueType::F32 => 4,
            ValueType::U64 | ValueType::I64 | ValueType::F64 | ValueType::Pointer => 8,
            ValueType::String(len) | ValueType::Bytes(len) => len,
        }
    }

    /// Natural alignment used when scanning.
    pub fn alignment(self) -> usize {
        if self.is_numeric() {
            self.size()
        } else {
            1
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ValueType::String(_) | ValueType::Bytes(_))
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }

    fn is_signed(self) -> bool {
        matches!(
            self,
            ValueType::I8 | ValueType::I16 | ValueType::I32 | ValueType::I64
        )
    }

    /// Inclusive range of an integer type.
    fn int_range(self) -> Option<(i128, i128)> {
        let bits = (self.size() * 8) as u32;
        match self {
            _ if self.is_float() || !self.is_numeric() => None,
            _ if self.is_signed() => Some((-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)),
            _ => Some((0, (1i128 << bits) - 1)),
        }
    }

    /// Decode one value from the first `size()` bytes of `bytes`.
    pub fn decode(self, bytes: &[u8], endianness: Endianness) -> Option<Value> {
        let size = self.size();
        if size == 0 || bytes.len() < size {
            return None;
        }
        let raw = &bytes[..size];
        if !self.is_numeric() {
            return Some(Value::Bytes(raw.to_vec()));
        }

        let mut buf = [0u8; 8];
        match endianness {
            Endianness::Little => buf[..size].copy_from_slice(raw),
            Endianness::Big => {
                for (dst, src) in buf[..size].iter_mut().zip(raw.iter().rev()) {
                    *dst = *src;
                }
            }
        }
        let bits = u64::from_le_bytes(buf);

        let value = match self {
            ValueType::F32 => Value::Float(f32::from_bits(bits as u32) as f64),
            ValueType::F64 => Value::Float(f64::from_bits(bits)),
            ValueType::I8 => Value::Int(bits as u8 as i8 as i128),
            ValueType::I16 => Value::Int(bits as u16 as i16 as i128),
            ValueType::I32 => Value::Int(bits as u32 as i32 as i128),
            ValueType::I64 => Value::Int(bits as i64 as i128),
            _ => Value::Int(bits as i128),
        };
        Some(value)
    }

    /// Encode a value into target bytes.
    pub fn encode(self, value: &Value, endianness: Endianness) -> Result<Vec<u8>> {
        let size = self.size();
        let le: Vec<u8> = match (self, value) {
            (ValueType::F32, Value::Float(f)) => (*f as f32).to_le_bytes().to_vec(),
            (ValueType::F64, Value::Float(f)) => f.to_le_bytes().to_vec(),
            (ValueType::String(_) | ValueType::Bytes(_), Value::Bytes(b)) => {
                if b.len() != size {
                    return Err(Error::InvalidInput(format!(
                        "expected {} bytes for {}, got {}",
                        size,
                        self,
                        b.len()
                    )));
                }
                return Ok(b.clone());
            }
            (_, Value::Int(i)) if self.int_range().is_some() => {
                let (lo, hi) = self.int_range().unwrap_or((0, 0));
                if *i < lo || *i > hi {
                    return Err(Error::InvalidInput(format!(
                        "{} does not fit in {}",
                        i, self
                    )));
                }
                (*i as u64).to_le_bytes()[..size].to_vec()
            }
            _ => {
                return Err(Error::InvalidInput(format!(
                    "{} value cannot be stored as {}",
                    value.kind(),
                    self
                )))
            }
        };
        Ok(match endianness {
            Endianness::Little => le,
            Endianness::Big => le.into_iter().rev().collect(),
        })
    }

    /// Parse user-entered text into a value of this type.
    ///
    /// Integers accept decimal or `0x` hex (with an optional leading `-`),
    /// byte arrays accept whitespace separated hex bytes, strings are taken
    /// verbatim.
    pub fn parse(self, text: &str) -> Result<Value> {
        let text_trimmed = text.trim();
        let value = match self {
            ValueType::F32 | ValueType::F64 => Value::Float(
                text_trimmed
                    .parse::<f64>()
                    .map_err(|_| Error::InvalidInput(format!("invalid float: '{}'", text)))?,
            ),
            ValueType::String(_) => Value::Bytes(text.as_bytes().to_vec()),
            ValueType::Bytes(_) => Value::Bytes(parse_hex_bytes(text_trimmed)?),
            _ => Value::Int(parse_int(text_trimmed)?),
        };
        // Range and length checks
        self.encode(&value, Endianness::Little)?;
        Ok(self.narrow(&value))
    }

    /// Round a value to the precision this type stores, so an entered
    /// `0.1` compares equal to the `0.1` held in an `f32`. Integers given
    /// for a float type become floats.
    pub fn narrow(self, value: &Value) -> Value {
        match (self, value) {
            (ValueType::F32, Value::Float(f)) => Value::Float(*f as f32 as f64),
            (ValueType::F32, Value::Int(i)) => Value::Float(*i as f32 as f64),
            (ValueType::F64, Value::Int(i)) => Value::Float(*i as f64),
            _ => value.clone(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::U8 => write!(f, "u8"),
            ValueType::U16 => write!(f, "u16"),
            ValueType::U32 => write!(f, "u32"),
            ValueType::U64 => write!(f, "u64"),
            ValueType::I8 => write!(f, "i8"),
            ValueType::I16 => write!(f, "i16"),
            ValueType::I32 => write!(f, "i32"),
            ValueType::I64 => write!(f, "i64"),
            ValueType::F32 => write!(f, "f32"),
            ValueType::F64 => write!(f, "f64"),
            ValueType::Pointer => write!(f, "pointer"),
            ValueType::String(len) => write!(f, "string[{}]", len),
            ValueType::Bytes(len) => write!(f, "bytes[{}]", len),
        }
    }
}

fn parse_int(text: &str) -> Result<i128> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|_| Error::InvalidInput(format!("invalid integer: '{}'", text)))?;
    Ok(if negative { -parsed } else { parsed })
}

fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    text.split_whitespace()
        .map(|token| {
            u8::from_str_radix(token, 16)
                .map_err(|_| Error::InvalidInput(format!("invalid hex byte: '{}'", token)))
        })
        .collect()
}

/// A decoded value.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i128),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Bytes(_) => "byte string",
        }
    }

    /// Natural ordering: integers numerically, floats by IEEE order
    /// (`None` when either is NaN), byte strings are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    /// Exact equality: floats compare bit patterns, so `NaN` equals an
    /// identical `NaN` and `0.0` differs from `-0.0`.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }

    /// `self - base`, for the "changed by" predicates.
    pub fn delta_from(&self, base: &Value) -> Option<Value> {
        match (self, base) {
            (Value::Int(a), Value::Int(b)) => Some(Value::Int(a - b)),
            (Value::Float(a), Value::Float(b)) => Some(Value::Float(a - b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a == b,
            _ => self.same_as(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{:?}", s),
                Err(_) => {
                    let hex: Vec<String> = b.iter().map(|x| format!("{:02x}", x)).collect();
                    write!(f, "{}", hex.join(" "))
                }
            },
        }
    }
}
