use std::fmt;
use std::io::{self, Cursor, Read, Write};

use rmpv::Value;

use crate::config::AppConfig;
use crate::message::{
    EnvelopeParts, MessageBody, MessageEnvelope, MessageId, MessageKind, Priority, Properties,
    PropertyValue, RequestType, Response, ResponseCode,
};

pub const MAX_ENVELOPE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;
pub const ABSENT_RESPONSE_CODE: i32 = -1;

#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    UnknownTypeTag { tag: u8 },
    Truncated { field: &'static str },
    NegativeLength { field: &'static str, length: i32 },
    FieldTooLarge { field: &'static str, length: usize, limit: usize },
    InvalidUtf8 { field: &'static str },
    InvalidBool { field: &'static str, value: u8 },
    InvalidPriority { value: i32 },
    InvalidResponseCode { code: i32 },
    InvalidPropertyCount { count: i32 },
    UnknownPropertyType { name: String, tag: u8 },
    ObjectEncode(rmpv::encode::Error),
    ObjectDecode(rmpv::decode::Error),
    TrailingObjectData { field: &'static str },
    TrailingData { remaining: usize },
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    InvalidMaxEnvelopeSize { value: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "wire io error: {source}"),
            Self::UnknownTypeTag { tag } => write!(f, "unknown message type tag {tag}"),
            Self::Truncated { field } => write!(f, "envelope truncated while reading '{field}'"),
            Self::NegativeLength { field, length } => {
                write!(f, "negative length {length} for '{field}'")
            }
            Self::FieldTooLarge {
                field,
                length,
                limit,
            } => write!(f, "field '{field}' length {length} exceeds limit {limit}"),
            Self::InvalidUtf8 { field } => write!(f, "field '{field}' is not valid UTF-8"),
            Self::InvalidBool { field, value } => {
                write!(f, "field '{field}' holds invalid boolean byte {value}")
            }
            Self::InvalidPriority { value } => write!(f, "priority {value} is outside 0..=9"),
            Self::InvalidResponseCode { code } => write!(f, "unknown response code {code}"),
            Self::InvalidPropertyCount { count } => {
                write!(f, "property count {count} must not be negative")
            }
            Self::UnknownPropertyType { name, tag } => {
                write!(f, "property '{name}' has unknown value type {tag}")
            }
            Self::ObjectEncode(source) => write!(f, "object encode error: {source}"),
            Self::ObjectDecode(source) => write!(f, "object decode error: {source}"),
            Self::TrailingObjectData { field } => {
                write!(f, "object payload in '{field}' contains trailing data")
            }
            Self::TrailingData { remaining } => {
                write!(f, "envelope followed by {remaining} unexpected bytes")
            }
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => write!(f, "protocol error: frame length cannot be zero"),
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::InvalidMaxEnvelopeSize { value } => write!(
                f,
                "wire.max_envelope_size_bytes must be between 1 and {}, got {value}",
                u32::MAX
            ),
        }
    }
}

impl std::error::Error for CodecError {}

impl CodecError {
    /// True when the stream ended inside a record rather than on a record boundary.
    pub fn is_truncation(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

pub fn encode_envelope(envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
    let mut encoded = Vec::with_capacity(128);
    write_envelope(&mut encoded, envelope)?;
    Ok(encoded)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<MessageEnvelope, CodecError> {
    let mut cursor = Cursor::new(bytes);
    let Some(envelope) = read_envelope(&mut cursor)? else {
        return Err(CodecError::Truncated { field: "typeTag" });
    };

    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingData {
            remaining: bytes.len() - consumed,
        });
    }

    Ok(envelope)
}

pub fn write_envelope<W: Write>(writer: &mut W, envelope: &MessageEnvelope) -> Result<(), CodecError> {
    let kind = envelope.kind();
    put_u8(writer, kind.tag())?;
    writer
        .write_all(envelope.id().as_bytes())
        .map_err(CodecError::Io)?;
    writer
        .write_all(envelope.correlation_id().as_bytes())
        .map_err(CodecError::Io)?;
    put_i32(writer, i32::from(envelope.priority().value()))?;
    put_i32(writer, envelope.request_type().ordinal())?;
    put_i64(writer, envelope.created_at())?;
    put_i64(writer, envelope.expires_after())?;
    write_response(writer, envelope.response())?;
    write_properties(writer, &envelope.properties)?;

    match &envelope.body {
        MessageBody::Empty => Ok(()),
        MessageBody::Text(text) => {
            put_bool(writer, text.is_some())?;
            match text {
                Some(text) => put_str(writer, text),
                None => Ok(()),
            }
        }
        MessageBody::Object(value) => {
            put_bool(writer, value.is_some())?;
            match value {
                Some(value) => put_object(writer, value),
                None => Ok(()),
            }
        }
    }
}

/// Reads one envelope. `Ok(None)` means the stream ended cleanly before a type tag.
pub fn read_envelope<R: Read>(reader: &mut R) -> Result<Option<MessageEnvelope>, CodecError> {
    let Some(tag) = read_tag(reader)? else {
        return Ok(None);
    };
    let kind = MessageKind::from_tag(tag).ok_or(CodecError::UnknownTypeTag { tag })?;

    let id = MessageId::from_bytes(take_array(reader, "id")?);
    let correlation_id = MessageId::from_bytes(take_array(reader, "correlationId")?);
    let raw_priority = take_i32(reader, "priority")?;
    let priority = Priority::new(i64::from(raw_priority))
        .map_err(|_| CodecError::InvalidPriority { value: raw_priority })?;
    let request_type = RequestType::from_ordinal(take_i32(reader, "requestType")?);
    let created_at = take_i64(reader, "createdAt")?;
    let expires_after = take_i64(reader, "expiresAfter")?;
    let response = read_response(reader)?;
    let properties = read_properties(reader)?;

    let body = match kind {
        MessageKind::Control | MessageKind::Response => MessageBody::Empty,
        MessageKind::Text => {
            if take_bool(reader, "body.hasText")? {
                MessageBody::Text(Some(take_str(reader, "body.text")?))
            } else {
                MessageBody::Text(None)
            }
        }
        MessageKind::Object => {
            if take_bool(reader, "body.hasObject")? {
                MessageBody::Object(Some(take_object(reader, "body.object")?))
            } else {
                MessageBody::Object(None)
            }
        }
    };

    Ok(Some(MessageEnvelope::from_parts(EnvelopeParts {
        id,
        correlation_id,
        priority,
        request_type,
        created_at,
        expires_after,
        response,
        properties,
        body,
    })))
}

fn write_response<W: Write>(writer: &mut W, response: Option<&Response>) -> Result<(), CodecError> {
    match response {
        None => {
            put_i32(writer, ABSENT_RESPONSE_CODE)?;
            put_bool(writer, false)
        }
        Some(response) => {
            put_i32(writer, response.code.code())?;
            put_bool(writer, response.description.is_some())?;
            match &response.description {
                Some(description) => put_str(writer, description),
                None => Ok(()),
            }
        }
    }
}

fn read_response<R: Read>(reader: &mut R) -> Result<Option<Response>, CodecError> {
    let code = take_i32(reader, "response.code")?;
    let has_description = take_bool(reader, "response.hasDesc")?;

    if code == ABSENT_RESPONSE_CODE {
        if has_description {
            // Description without a code is not a valid encoding.
            return Err(CodecError::InvalidResponseCode { code });
        }
        return Ok(None);
    }

    let code = ResponseCode::from_code(code).ok_or(CodecError::InvalidResponseCode { code })?;
    let description = if has_description {
        Some(take_str(reader, "response.desc")?)
    } else {
        None
    };

    Ok(Some(Response { code, description }))
}

fn write_properties<W: Write>(writer: &mut W, properties: &Properties) -> Result<(), CodecError> {
    let count = i32::try_from(properties.len()).map_err(|_| CodecError::FieldTooLarge {
        field: "properties",
        length: properties.len(),
        limit: i32::MAX as usize,
    })?;
    put_i32(writer, count)?;

    for (name, value) in properties.iter() {
        put_str(writer, name)?;
        put_u8(writer, value.type_tag())?;
        match value {
            PropertyValue::Bool(value) => put_bool(writer, *value)?,
            PropertyValue::Int(value) => put_i32(writer, *value)?,
            PropertyValue::Long(value) => put_i64(writer, *value)?,
            PropertyValue::Float(value) => put_bytes_raw(writer, &value.to_bits().to_be_bytes())?,
            PropertyValue::Double(value) => {
                put_bytes_raw(writer, &value.to_bits().to_be_bytes())?
            }
            PropertyValue::Byte(value) => put_bytes_raw(writer, &value.to_be_bytes())?,
            PropertyValue::Short(value) => put_bytes_raw(writer, &value.to_be_bytes())?,
            PropertyValue::String(value) => put_str(writer, value)?,
            PropertyValue::Object(value) => put_object(writer, value)?,
            PropertyValue::Bytes(value) => put_blob(writer, value, "property.bytes")?,
        }
    }

    Ok(())
}

fn read_properties<R: Read>(reader: &mut R) -> Result<Properties, CodecError> {
    let count = take_i32(reader, "properties.count")?;
    if count < 0 {
        return Err(CodecError::InvalidPropertyCount { count });
    }

    let mut properties = Properties::new();
    for _ in 0..count {
        let name = take_str(reader, "property.name")?;
        let tag = take_u8(reader, "property.type")?;
        let value = match tag {
            1 => PropertyValue::Bool(take_bool(reader, "property.bool")?),
            2 => PropertyValue::Int(take_i32(reader, "property.int")?),
            3 => PropertyValue::Long(take_i64(reader, "property.long")?),
            4 => PropertyValue::Float(f32::from_bits(u32::from_be_bytes(take_array(
                reader,
                "property.float",
            )?))),
            5 => PropertyValue::Double(f64::from_bits(u64::from_be_bytes(take_array(
                reader,
                "property.double",
            )?))),
            6 => PropertyValue::Byte(i8::from_be_bytes(take_array(reader, "property.byte")?)),
            7 => PropertyValue::Short(i16::from_be_bytes(take_array(reader, "property.short")?)),
            8 => PropertyValue::String(take_str(reader, "property.string")?),
            9 => PropertyValue::Object(take_object(reader, "property.object")?),
            10 => PropertyValue::Bytes(take_blob(reader, "property.bytes")?),
            _ => return Err(CodecError::UnknownPropertyType { name, tag }),
        };
        properties.set(name, value);
    }

    Ok(properties)
}

fn put_u8<W: Write>(writer: &mut W, value: u8) -> Result<(), CodecError> {
    writer.write_all(&[value]).map_err(CodecError::Io)
}

fn put_bool<W: Write>(writer: &mut W, value: bool) -> Result<(), CodecError> {
    put_u8(writer, u8::from(value))
}

fn put_i32<W: Write>(writer: &mut W, value: i32) -> Result<(), CodecError> {
    writer.write_all(&value.to_be_bytes()).map_err(CodecError::Io)
}

fn put_i64<W: Write>(writer: &mut W, value: i64) -> Result<(), CodecError> {
    writer.write_all(&value.to_be_bytes()).map_err(CodecError::Io)
}

fn put_bytes_raw<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), CodecError> {
    writer.write_all(bytes).map_err(CodecError::Io)
}

/// Only the i32 length prefix bounds a single field. Whole envelopes are bounded by
/// the configured `WireCodec` limit.
fn put_blob<W: Write>(writer: &mut W, bytes: &[u8], field: &'static str) -> Result<(), CodecError> {
    let length = i32::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLarge {
        field,
        length: bytes.len(),
        limit: i32::MAX as usize,
    })?;
    put_i32(writer, length)?;
    put_bytes_raw(writer, bytes)
}

fn put_str<W: Write>(writer: &mut W, text: &str) -> Result<(), CodecError> {
    put_blob(writer, text.as_bytes(), "string")
}

fn put_object<W: Write>(writer: &mut W, value: &Value) -> Result<(), CodecError> {
    let mut encoded = Vec::new();
    rmpv::encode::write_value(&mut encoded, value).map_err(CodecError::ObjectEncode)?;
    put_blob(writer, &encoded, "object")
}

fn read_tag<R: Read>(reader: &mut R) -> Result<Option<u8>, CodecError> {
    let mut tag = [0_u8; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(tag[0])),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(CodecError::Io(error)),
        }
    }
}

fn take_exact<R: Read>(reader: &mut R, buffer: &mut [u8], field: &'static str) -> Result<(), CodecError> {
    reader.read_exact(buffer).map_err(|error| {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Truncated { field }
        } else {
            CodecError::Io(error)
        }
    })
}

fn take_array<R: Read, const N: usize>(
    reader: &mut R,
    field: &'static str,
) -> Result<[u8; N], CodecError> {
    let mut buffer = [0_u8; N];
    take_exact(reader, &mut buffer, field)?;
    Ok(buffer)
}

fn take_u8<R: Read>(reader: &mut R, field: &'static str) -> Result<u8, CodecError> {
    let [value] = take_array::<R, 1>(reader, field)?;
    Ok(value)
}

fn take_bool<R: Read>(reader: &mut R, field: &'static str) -> Result<bool, CodecError> {
    match take_u8(reader, field)? {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(CodecError::InvalidBool { field, value }),
    }
}

fn take_i32<R: Read>(reader: &mut R, field: &'static str) -> Result<i32, CodecError> {
    Ok(i32::from_be_bytes(take_array(reader, field)?))
}

fn take_i64<R: Read>(reader: &mut R, field: &'static str) -> Result<i64, CodecError> {
    Ok(i64::from_be_bytes(take_array(reader, field)?))
}

fn take_blob<R: Read>(reader: &mut R, field: &'static str) -> Result<Vec<u8>, CodecError> {
    let length = take_i32(reader, field)?;
    if length < 0 {
        return Err(CodecError::NegativeLength { field, length });
    }
    let length = length as usize;

    // Grows with the bytes actually present, so a corrupt length cannot force a huge allocation.
    let mut buffer = Vec::new();
    reader
        .by_ref()
        .take(length as u64)
        .read_to_end(&mut buffer)
        .map_err(CodecError::Io)?;
    if buffer.len() != length {
        return Err(CodecError::Truncated { field });
    }
    Ok(buffer)
}

fn take_str<R: Read>(reader: &mut R, field: &'static str) -> Result<String, CodecError> {
    let bytes = take_blob(reader, field)?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8 { field })
}

fn take_object<R: Read>(reader: &mut R, field: &'static str) -> Result<Value, CodecError> {
    let bytes = take_blob(reader, field)?;
    let mut cursor = Cursor::new(bytes.as_slice());
    let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::ObjectDecode)?;
    if cursor.position() as usize != bytes.len() {
        return Err(CodecError::TrailingObjectData { field });
    }
    Ok(value)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: MAX_ENVELOPE_SIZE_BYTES,
        }
    }
}

/// Length-prefixed framing of envelopes on a socket.
#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    config: CodecConfig,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        let value = app_config.wire.max_envelope_size_bytes;
        if value == 0 || value > u32::MAX as usize {
            return Err(CodecError::InvalidMaxEnvelopeSize { value });
        }

        Ok(Self::new(CodecConfig {
            max_envelope_size_bytes: value,
        }))
    }

    pub fn max_envelope_size_bytes(&self) -> usize {
        self.config.max_envelope_size_bytes
    }

    pub fn encode_frame(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let payload = encode_envelope(envelope)?;
        if payload.len() > self.config.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_envelope_size_bytes,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        }

        let declared_len = self.validate_declared_len([frame[0], frame[1], frame[2], frame[3]])?;
        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared_len {
            return Err(CodecError::FrameLengthMismatch {
                declared: declared_len,
                actual_payload: payload.len(),
            });
        }

        decode_envelope(payload)
    }

    pub fn write_frame<W: Write>(&self, writer: &mut W, envelope: &MessageEnvelope) -> Result<(), CodecError> {
        let frame = self.encode_frame(envelope)?;
        writer.write_all(&frame).map_err(CodecError::Io)?;
        writer.flush().map_err(CodecError::Io)
    }

    /// Blocking read of exactly one frame.
    pub fn read_frame<R: Read>(&self, reader: &mut R) -> Result<MessageEnvelope, CodecError> {
        let header = take_array::<R, FRAME_HEADER_SIZE_BYTES>(reader, "frame.length")?;
        let declared_len = self.validate_declared_len(header)?;

        let mut payload = vec![0_u8; declared_len];
        take_exact(reader, &mut payload, "frame.payload")?;
        decode_envelope(&payload)
    }

    pub fn frame_buffer(&self) -> FrameBuffer {
        FrameBuffer::new(*self)
    }

    fn validate_declared_len(&self, header: [u8; FRAME_HEADER_SIZE_BYTES]) -> Result<usize, CodecError> {
        let declared_len = u32::from_be_bytes(header) as usize;
        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared_len > self.config.max_envelope_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit: self.config.max_envelope_size_bytes,
            });
        }
        Ok(declared_len)
    }
}

/// Accumulates bytes from partial socket reads and yields whole frames.
pub struct FrameBuffer {
    codec: WireCodec,
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(codec: WireCodec) -> Self {
        Self {
            codec,
            pending: Vec::new(),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_envelope(&mut self) -> Result<Option<MessageEnvelope>, CodecError> {
        if self.pending.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let header = [
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ];
        let declared_len = self.codec.validate_declared_len(header)?;
        let frame_len = FRAME_HEADER_SIZE_BYTES + declared_len;
        if self.pending.len() < frame_len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.pending.drain(..frame_len).collect();
        decode_envelope(&frame[FRAME_HEADER_SIZE_BYTES..]).map(Some)
    }
}
