//! Typed value codec
//!
//! Self-describing payload values are written as a one-byte type index followed
//! by the value bytes. The index table below is the compatibility contract
//! between peers: entries may be appended but never reordered.

use bytes::{Buf, BufMut};

use super::{Color, Message, MessageError, MessageResult};

/// Number of entries in the type index table
pub const VALUE_TYPE_COUNT: u8 = 13;

const TYPE_INT: u8 = 0;
const TYPE_FLOAT: u8 = 1;
const TYPE_DOUBLE: u8 = 2;
const TYPE_LONG: u8 = 3;
const TYPE_CHAR: u8 = 4;
const TYPE_BOOL: u8 = 5;
const TYPE_STRING: u8 = 6;
const TYPE_VECTOR2: u8 = 7;
const TYPE_VECTOR3: u8 = 8;
const TYPE_VECTOR4: u8 = 9;
const TYPE_QUATERNION: u8 = 10;
const TYPE_COLOR: u8 = 11;
const TYPE_JSON: u8 = 12;

/// A dynamically typed payload value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Double(f64),
    Long(i64),
    Char(char),
    Bool(bool),
    String(String),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    Vector4([f32; 4]),
    Quaternion([f32; 4]),
    Color(Color),
    /// Arbitrary value carried as a JSON string
    Json(serde_json::Value),
}

impl Value {
    /// Wire type index of this value
    pub fn type_index(&self) -> u8 {
        match self {
            Value::Int(_) => TYPE_INT,
            Value::Float(_) => TYPE_FLOAT,
            Value::Double(_) => TYPE_DOUBLE,
            Value::Long(_) => TYPE_LONG,
            Value::Char(_) => TYPE_CHAR,
            Value::Bool(_) => TYPE_BOOL,
            Value::String(_) => TYPE_STRING,
            Value::Vector2(_) => TYPE_VECTOR2,
            Value::Vector3(_) => TYPE_VECTOR3,
            Value::Vector4(_) => TYPE_VECTOR4,
            Value::Quaternion(_) => TYPE_QUATERNION,
            Value::Color(_) => TYPE_COLOR,
            Value::Json(_) => TYPE_JSON,
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Value::Char(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Color> for Value {
    fn from(value: Color) -> Self {
        Value::Color(value)
    }
}

impl Message {
    /// Write a value preceded by its type index
    ///
    /// On failure the write cursor is restored, so a value is never partially
    /// written.
    pub fn write_value(&mut self, value: &Value) -> MessageResult<()> {
        self.check_lock()?;
        let mark = self.write_pos();
        let result = self.write_value_inner(value);
        if result.is_err() {
            self.set_write_pos(mark);
        }
        result
    }

    /// Read a type index and decode the matching value
    pub fn read_value(&mut self) -> MessageResult<Value> {
        self.check_lock()?;
        let mark = self.read_pos();
        let result = self.read_value_inner();
        if result.is_err() {
            self.set_read_pos(mark);
        }
        result
    }

    fn write_value_inner(&mut self, value: &Value) -> MessageResult<()> {
        self.write_u8(value.type_index())?;
        match value {
            Value::Int(v) => self.write_i32(*v),
            Value::Float(v) => self.write_f32(*v),
            Value::Double(v) => self.write_f64(*v),
            Value::Long(v) => self.write_i64(*v),
            Value::Char(v) => self.write_char(*v),
            Value::Bool(v) => self.write_bool(*v),
            Value::String(v) => self.write_str(v),
            Value::Vector2(v) => self.write_vector2(*v),
            Value::Vector3(v) => self.write_vector3(*v),
            Value::Vector4(v) => self.write_vector4(*v),
            Value::Quaternion(v) => self.write_quaternion(*v),
            Value::Color(v) => self.write_color(*v),
            Value::Json(v) => self.write_json(v),
        }
    }

    fn read_value_inner(&mut self) -> MessageResult<Value> {
        let index = self.read_u8()?;
        let value = match index {
            TYPE_INT => Value::Int(self.read_i32()?),
            TYPE_FLOAT => Value::Float(self.read_f32()?),
            TYPE_DOUBLE => Value::Double(self.read_f64()?),
            TYPE_LONG => Value::Long(self.read_i64()?),
            TYPE_CHAR => Value::Char(self.read_char()?),
            TYPE_BOOL => Value::Bool(self.read_bool()?),
            TYPE_STRING => Value::String(self.read_string()?),
            TYPE_VECTOR2 => Value::Vector2(self.read_vector2()?),
            TYPE_VECTOR3 => Value::Vector3(self.read_vector3()?),
            TYPE_VECTOR4 => Value::Vector4(self.read_vector4()?),
            TYPE_QUATERNION => Value::Quaternion(self.read_quaternion()?),
            TYPE_COLOR => Value::Color(self.read_color()?),
            TYPE_JSON => Value::Json(self.read_json()?),
            unknown => return Err(MessageError::UnknownType(unknown)),
        };
        Ok(value)
    }
}

/// Encoded size of a string with its 7-bit length prefix
pub(crate) fn prefixed_str_len(value: &str) -> usize {
    let len = value.len();
    let mut prefix = 1;
    let mut rest = len >> 7;
    while rest > 0 {
        prefix += 1;
        rest >>= 7;
    }
    prefix + len
}

/// Write a string as a 7-bit encoded byte count followed by UTF-8 bytes
pub(crate) fn put_prefixed_str<B: BufMut>(buf: &mut B, value: &str) {
    let mut len = value.len() as u32;
    while len >= 0x80 {
        buf.put_u8((len as u8) | 0x80);
        len >>= 7;
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
}

/// Read a string written by [`put_prefixed_str`]
pub(crate) fn get_prefixed_str<B: Buf>(buf: &mut B) -> MessageResult<String> {
    let mut len: u32 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(MessageError::Truncated { needed: 1, available: 0 });
        }
        if shift > 28 {
            return Err(MessageError::Malformed("string length prefix too long".to_string()));
        }
        let byte = buf.get_u8();
        len |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let len = len as usize;
    if buf.remaining() < len {
        return Err(MessageError::Truncated {
            needed: len,
            available: buf.remaining(),
        });
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| MessageError::Malformed(e.to_string()))
}
