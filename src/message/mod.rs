pub mod properties;

use std::fmt;

use chrono::Utc;
use rmpv::Value;
use uuid::Uuid;

pub use properties::{Properties, PropertyError, PropertyValue};

pub const MIN_PRIORITY: u8 = 0;
pub const MAX_PRIORITY: u8 = 9;
pub const PRIORITY_LEVELS: usize = (MAX_PRIORITY as usize) + 1;
pub const DEFAULT_PRIORITY: u8 = 4;
pub const NEVER_EXPIRES: i64 = i64::MAX;

#[derive(Debug, PartialEq, Eq)]
pub enum MessageError {
    InvalidPriority { provided: i64 },
    NegativeExpiration { provided: i64 },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPriority { provided } => write!(
                f,
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {provided}"
            ),
            Self::NegativeExpiration { provided } => {
                write!(f, "expiration must be zero or positive, got {provided}ms")
            }
        }
    }
}

impl std::error::Error for MessageError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub fn new(value: i64) -> Result<Self, MessageError> {
        if (i64::from(MIN_PRIORITY)..=i64::from(MAX_PRIORITY)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(MessageError::InvalidPriority { provided: value })
        }
    }

    pub fn highest() -> Self {
        Self(MAX_PRIORITY)
    }

    pub fn lowest() -> Self {
        Self(MIN_PRIORITY)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(DEFAULT_PRIORITY)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    None,
    Login,
    Get,
    DefineQueue,
    DeleteQueue,
    QueryQueue,
    Shutdown,
    SystemStateChange,
    Unknown(i32),
}

impl RequestType {
    pub fn ordinal(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Login => 1,
            Self::Get => 2,
            Self::DefineQueue => 3,
            Self::DeleteQueue => 4,
            Self::QueryQueue => 5,
            Self::Shutdown => 6,
            Self::SystemStateChange => 7,
            Self::Unknown(raw) => raw,
        }
    }

    pub fn from_ordinal(raw: i32) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Login,
            2 => Self::Get,
            3 => Self::DefineQueue,
            4 => Self::DeleteQueue,
            5 => Self::QueryQueue,
            6 => Self::Shutdown,
            7 => Self::SystemStateChange,
            other => Self::Unknown(other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Login => "login",
            Self::Get => "get",
            Self::DefineQueue => "defineQueue",
            Self::DeleteQueue => "deleteQueue",
            Self::QueryQueue => "queryQueue",
            Self::Shutdown => "shutdown",
            Self::SystemStateChange => "systemStateChange",
            Self::Unknown(_) => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    Warn,
    Fail,
    Error,
}

impl ResponseCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Warn => 1,
            Self::Fail => 2,
            Self::Error => 3,
        }
    }

    pub fn from_code(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::Warn),
            2 => Some(Self::Fail),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Warn)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub description: Option<String>,
}

impl Response {
    pub fn new(code: ResponseCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }

    pub fn ok(description: impl Into<String>) -> Self {
        Self::new(ResponseCode::Ok, description)
    }

    pub fn warn(description: impl Into<String>) -> Self {
        Self::new(ResponseCode::Warn, description)
    }

    pub fn fail(description: impl Into<String>) -> Self {
        Self::new(ResponseCode::Fail, description)
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self::new(ResponseCode::Error, description)
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {description}", self.code.as_str()),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum MessageBody {
    #[default]
    Empty,
    Text(Option<String>),
    Object(Option<Value>),
}

/// Wire type tag. The decoder reads it first to pick the body layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Control,
    Text,
    Object,
    Response,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Text => 1,
            Self::Object => 2,
            Self::Response => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Control),
            1 => Some(Self::Text),
            2 => Some(Self::Object),
            3 => Some(Self::Response),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageEnvelope {
    id: MessageId,
    correlation_id: MessageId,
    priority: Priority,
    request_type: RequestType,
    created_at: i64,
    expires_after: i64,
    response: Option<Response>,
    pub properties: Properties,
    pub body: MessageBody,
}

/// Decoded field set used to rebuild an envelope with its original identity.
pub(crate) struct EnvelopeParts {
    pub id: MessageId,
    pub correlation_id: MessageId,
    pub priority: Priority,
    pub request_type: RequestType,
    pub created_at: i64,
    pub expires_after: i64,
    pub response: Option<Response>,
    pub properties: Properties,
    pub body: MessageBody,
}

impl MessageEnvelope {
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: MessageId::generate(),
            correlation_id: MessageId::nil(),
            priority: Priority::default(),
            request_type: RequestType::None,
            created_at: Utc::now().timestamp_millis(),
            expires_after: NEVER_EXPIRES,
            response: None,
            properties: Properties::new(),
            body,
        }
    }

    pub fn control() -> Self {
        Self::new(MessageBody::Empty)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(Some(text.into())))
    }

    pub fn object(value: Value) -> Self {
        Self::new(MessageBody::Object(Some(value)))
    }

    /// Reply skeleton correlated to `request`.
    pub fn reply_to(request: &MessageEnvelope, response: Response) -> Self {
        let mut reply = Self::control();
        reply.correlation_id = request.id;
        reply.request_type = request.request_type;
        reply.response = Some(response);
        reply
    }

    pub(crate) fn from_parts(parts: EnvelopeParts) -> Self {
        Self {
            id: parts.id,
            correlation_id: parts.correlation_id,
            priority: parts.priority,
            request_type: parts.request_type,
            created_at: parts.created_at,
            expires_after: parts.expires_after,
            response: parts.response,
            properties: parts.properties,
            body: parts.body,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn correlation_id(&self) -> MessageId {
        self.correlation_id
    }

    pub fn set_correlation_id(&mut self, correlation_id: MessageId) {
        self.correlation_id = correlation_id;
    }

    pub fn is_reply(&self) -> bool {
        !self.correlation_id.is_nil()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i64) -> Result<(), MessageError> {
        self.priority = Priority::new(priority)?;
        Ok(())
    }

    pub fn with_priority(mut self, priority: i64) -> Result<Self, MessageError> {
        self.set_priority(priority)?;
        Ok(self)
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn set_request_type(&mut self, request_type: RequestType) {
        self.request_type = request_type;
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn expires_after(&self) -> i64 {
        self.expires_after
    }

    pub fn set_expires_after(&mut self, expires_after_ms: i64) -> Result<(), MessageError> {
        if expires_after_ms < 0 {
            return Err(MessageError::NegativeExpiration {
                provided: expires_after_ms,
            });
        }
        self.expires_after = expires_after_ms;
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at) > self.expires_after
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, response: Option<Response>) {
        self.response = response;
    }

    pub fn response_code(&self) -> Option<ResponseCode> {
        self.response.as_ref().map(|response| response.code)
    }

    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => text.as_deref(),
            _ => None,
        }
    }

    pub fn object_body(&self) -> Option<&Value> {
        match &self.body {
            MessageBody::Object(value) => value.as_ref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match (&self.body, &self.response) {
            (MessageBody::Text(_), _) => MessageKind::Text,
            (MessageBody::Object(_), _) => MessageKind::Object,
            (MessageBody::Empty, Some(_)) => MessageKind::Response,
            (MessageBody::Empty, None) => MessageKind::Control,
        }
    }
}
