//! Protocol message buffer
//!
//! A `Message` is a fixed-capacity byte buffer holding the 12-byte header
//! followed by a payload written and read through independent cursors.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::codec::{get_prefixed_str, prefixed_str_len, put_prefixed_str};
use super::{HEADER_SIZE, MAX_MESSAGE_SIZE};

const FROM_UID_OFFSET: usize = 0;
const TO_UID_OFFSET: usize = 4;
const MESSAGE_TYPE_OFFSET: usize = 8;

/// Message errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Message has been recycled")]
    Recycled,

    #[error("Message capacity exceeded: {needed} bytes needed, {available} available")]
    Capacity { needed: usize, available: usize },

    #[error("Read past end of payload: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown value type index: {0}")]
    UnknownType(u8),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Kind of a message, stored as an i32 in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Identity announcement carrying the sender's friendly name
    Greeting,
    /// Remote procedure call, interpreted by the host application
    RemoteCall,
    /// Application-defined kind (values 2 and up, or negative)
    UserDefined(i32),
}

impl MessageType {
    pub fn to_i32(self) -> i32 {
        match self {
            MessageType::Greeting => 0,
            MessageType::RemoteCall => 1,
            MessageType::UserDefined(value) => value,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => MessageType::Greeting,
            1 => MessageType::RemoteCall,
            other => MessageType::UserDefined(other),
        }
    }
}

impl From<i32> for MessageType {
    fn from(value: i32) -> Self {
        MessageType::from_i32(value)
    }
}

impl From<MessageType> for i32 {
    fn from(value: MessageType) -> Self {
        value.to_i32()
    }
}

/// RGBA color with float components
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

/// A framed protocol message
///
/// Messages are checked out of a [`MessagePool`](super::MessagePool). A message
/// that is not checked out is locked and refuses every payload operation with
/// [`MessageError::Recycled`].
pub struct Message {
    buffer: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    locked: bool,
}

impl Message {
    /// Allocate a fresh, locked buffer
    pub(crate) fn new() -> Self {
        Self {
            buffer: vec![0u8; MAX_MESSAGE_SIZE].into_boxed_slice(),
            read_pos: HEADER_SIZE,
            write_pos: HEADER_SIZE,
            locked: true,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Fail with [`MessageError::Recycled`] if the message is locked
    pub fn check_lock(&self) -> MessageResult<()> {
        if self.locked {
            return Err(MessageError::Recycled);
        }
        Ok(())
    }

    /// Reset both cursors and zero the header
    pub fn clear(&mut self) {
        self.read_pos = HEADER_SIZE;
        self.write_pos = HEADER_SIZE;
        self.buffer[..HEADER_SIZE].fill(0);
    }

    pub fn from_uid(&self) -> i32 {
        self.int_at(FROM_UID_OFFSET)
    }

    pub fn set_from_uid(&mut self, uid: i32) {
        self.set_int_at(FROM_UID_OFFSET, uid);
    }

    pub fn to_uid(&self) -> i32 {
        self.int_at(TO_UID_OFFSET)
    }

    pub fn set_to_uid(&mut self, uid: i32) {
        self.set_int_at(TO_UID_OFFSET, uid);
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_i32(self.int_at(MESSAGE_TYPE_OFFSET))
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.set_int_at(MESSAGE_TYPE_OFFSET, message_type.to_i32());
    }

    /// Length of the frame body (header + written payload)
    pub fn len(&self) -> usize {
        self.write_pos
    }

    /// True when no payload has been written
    pub fn is_empty(&self) -> bool {
        self.write_pos == HEADER_SIZE
    }

    /// Unread payload bytes between the read and write cursors
    pub fn remaining(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// The frame body as it goes on the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.write_pos]
    }

    /// Move the read cursor back to the start of the payload
    pub fn rewind(&mut self) {
        self.read_pos = HEADER_SIZE;
    }

    /// Replace the contents with a received frame body
    pub(crate) fn load_frame(&mut self, body: &[u8]) -> MessageResult<()> {
        self.check_lock()?;
        if body.len() < HEADER_SIZE || body.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::Malformed(format!(
                "frame body of {} bytes",
                body.len()
            )));
        }
        self.buffer[..body.len()].copy_from_slice(body);
        self.write_pos = body.len();
        self.read_pos = HEADER_SIZE;
        Ok(())
    }

    /// Copy buffer contents and cursors from another message
    pub(crate) fn copy_from(&mut self, other: &Message) -> MessageResult<()> {
        other.check_lock()?;
        self.check_lock()?;
        self.buffer[..other.write_pos].copy_from_slice(&other.buffer[..other.write_pos]);
        self.read_pos = other.read_pos;
        self.write_pos = other.write_pos;
        Ok(())
    }

    // Primitive writers

    pub fn write_i32(&mut self, value: i32) -> MessageResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_u8(&mut self, value: u8) -> MessageResult<()> {
        self.write_raw(&[value])
    }

    pub fn write_i64(&mut self, value: i64) -> MessageResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> MessageResult<()> {
        self.write_raw(&value.to_bits().to_le_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> MessageResult<()> {
        self.write_raw(&value.to_bits().to_le_bytes())
    }

    pub fn write_bool(&mut self, value: bool) -> MessageResult<()> {
        self.write_raw(&[value as u8])
    }

    /// Write a char as its UTF-8 encoding
    pub fn write_char(&mut self, value: char) -> MessageResult<()> {
        let mut tmp = [0u8; 4];
        let encoded = value.encode_utf8(&mut tmp);
        self.write_raw(encoded.as_bytes())
    }

    /// Write a string with a 7-bit variable-length byte count prefix
    pub fn write_str(&mut self, value: &str) -> MessageResult<()> {
        self.check_lock()?;
        let needed = prefixed_str_len(value);
        self.ensure_capacity(needed)?;
        let mut dst = &mut self.buffer[self.write_pos..self.write_pos + needed];
        put_prefixed_str(&mut dst, value);
        self.write_pos += needed;
        Ok(())
    }

    pub fn write_vector2(&mut self, value: [f32; 2]) -> MessageResult<()> {
        self.write_floats(&value)
    }

    pub fn write_vector3(&mut self, value: [f32; 3]) -> MessageResult<()> {
        self.write_floats(&value)
    }

    pub fn write_vector4(&mut self, value: [f32; 4]) -> MessageResult<()> {
        self.write_floats(&value)
    }

    /// Write a quaternion as x, y, z, w
    pub fn write_quaternion(&mut self, value: [f32; 4]) -> MessageResult<()> {
        self.write_floats(&value)
    }

    pub fn write_color(&mut self, value: Color) -> MessageResult<()> {
        self.write_floats(&[value.r, value.g, value.b, value.a])
    }

    /// Write any serializable value as a JSON string
    pub fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> MessageResult<()> {
        self.check_lock()?;
        let json = serde_json::to_string(value)?;
        self.write_str(&json)
    }

    /// Write a fieldless enum as its i32 discriminant
    pub fn write_enum<E: Into<i32>>(&mut self, value: E) -> MessageResult<()> {
        self.write_i32(value.into())
    }

    // Primitive readers

    pub fn read_i32(&mut self) -> MessageResult<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u8(&mut self) -> MessageResult<u8> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    pub fn read_i64(&mut self) -> MessageResult<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> MessageResult<f32> {
        Ok(f32::from_bits(u32::from_le_bytes(self.read_array()?)))
    }

    pub fn read_f64(&mut self) -> MessageResult<f64> {
        Ok(f64::from_bits(u64::from_le_bytes(self.read_array()?)))
    }

    pub fn read_bool(&mut self) -> MessageResult<bool> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte != 0)
    }

    pub fn read_char(&mut self) -> MessageResult<char> {
        self.check_lock()?;
        let lead = *self
            .unread()
            .first()
            .ok_or(MessageError::Truncated { needed: 1, available: 0 })?;
        let width = match lead {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return Err(MessageError::Malformed(format!("invalid UTF-8 lead byte {lead:#04x}"))),
        };
        self.ensure_readable(width)?;
        let bytes = &self.buffer[self.read_pos..self.read_pos + width];
        let value = std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.chars().next())
            .ok_or_else(|| MessageError::Malformed("invalid UTF-8 char".to_string()))?;
        self.read_pos += width;
        Ok(value)
    }

    pub fn read_string(&mut self) -> MessageResult<String> {
        self.check_lock()?;
        let mut src = self.unread();
        let before = src.len();
        let value = get_prefixed_str(&mut src)?;
        let consumed = before - src.len();
        self.read_pos += consumed;
        Ok(value)
    }

    pub fn read_vector2(&mut self) -> MessageResult<[f32; 2]> {
        self.read_floats()
    }

    pub fn read_vector3(&mut self) -> MessageResult<[f32; 3]> {
        self.read_floats()
    }

    pub fn read_vector4(&mut self) -> MessageResult<[f32; 4]> {
        self.read_floats()
    }

    pub fn read_quaternion(&mut self) -> MessageResult<[f32; 4]> {
        self.read_floats()
    }

    pub fn read_color(&mut self) -> MessageResult<Color> {
        let [r, g, b, a] = self.read_floats()?;
        Ok(Color { r, g, b, a })
    }

    /// Read an enum written by [`Message::write_enum`]
    pub fn read_enum<E: TryFrom<i32>>(&mut self) -> MessageResult<E> {
        let start = self.read_pos;
        let raw = self.read_i32()?;
        E::try_from(raw).map_err(|_| {
            self.read_pos = start;
            MessageError::Malformed(format!("invalid enum discriminant {raw}"))
        })
    }

    /// Read a JSON string and deserialize it
    pub fn read_json<T: DeserializeOwned>(&mut self) -> MessageResult<T> {
        let json = self.read_string()?;
        Ok(serde_json::from_str(&json)?)
    }

    pub(crate) fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub(crate) fn set_write_pos(&mut self, pos: usize) {
        self.write_pos = pos;
    }

    pub(crate) fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub(crate) fn set_read_pos(&mut self, pos: usize) {
        self.read_pos = pos;
    }

    fn write_raw(&mut self, bytes: &[u8]) -> MessageResult<()> {
        self.check_lock()?;
        self.ensure_capacity(bytes.len())?;
        self.buffer[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
        Ok(())
    }

    fn write_floats(&mut self, values: &[f32]) -> MessageResult<()> {
        self.check_lock()?;
        self.ensure_capacity(values.len() * 4)?;
        for value in values {
            self.write_f32(*value)?;
        }
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> MessageResult<[u8; N]> {
        self.check_lock()?;
        self.ensure_readable(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer[self.read_pos..self.read_pos + N]);
        self.read_pos += N;
        Ok(out)
    }

    fn read_floats<const N: usize>(&mut self) -> MessageResult<[f32; N]> {
        self.check_lock()?;
        self.ensure_readable(N * 4)?;
        let mut out = [0f32; N];
        for slot in out.iter_mut() {
            *slot = self.read_f32()?;
        }
        Ok(out)
    }

    fn unread(&self) -> &[u8] {
        &self.buffer[self.read_pos..self.write_pos]
    }

    fn ensure_capacity(&self, needed: usize) -> MessageResult<()> {
        let available = MAX_MESSAGE_SIZE - self.write_pos;
        if needed > available {
            return Err(MessageError::Capacity { needed, available });
        }
        Ok(())
    }

    fn ensure_readable(&self, needed: usize) -> MessageResult<()> {
        let available = self.remaining();
        if needed > available {
            return Err(MessageError::Truncated { needed, available });
        }
        Ok(())
    }

    fn int_at(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buffer[offset..offset + 4]);
        i32::from_le_bytes(bytes)
    }

    fn set_int_at(&mut self, offset: usize, value: i32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("from_uid", &self.from_uid())
            .field("to_uid", &self.to_uid())
            .field("message_type", &self.message_type())
            .field("len", &self.write_pos)
            .field("read_pos", &self.read_pos)
            .field("locked", &self.locked)
            .finish()
    }
}
