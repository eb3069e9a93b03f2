use std::fmt;

use uuid::Uuid;

use crate::message::{
    MessageEnvelope, MessageId, Properties, PropertyError, PropertyValue, RequestType,
};

pub const QUEUE_NAME_KEY: &str = "queueName";
pub const THRESHOLD_KEY: &str = "threshold";
pub const FORCE_KEY: &str = "force";
pub const TIMEOUT_MS_KEY: &str = "timeoutMs";
pub const POLL_INTERVAL_MS_KEY: &str = "pollIntervalMs";
pub const IS_PREFIX_KEY: &str = "isPrefix";
pub const INCLUDE_ALL_DATA_KEY: &str = "includeAllData";
pub const USER_NAME_KEY: &str = "userName";
pub const PASSWORD_KEY: &str = "password";
pub const SESSION_ID_KEY: &str = "sessionId";
/// Carries a delivered message's own correlation id while the reply is correlated to the get.
pub const STORED_CORRELATION_ID_KEY: &str = "storedCorrelationId";

pub const MAX_QUEUE_NAME_LEN: usize = 48;

#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    InvalidQueueName { name: String, reason: &'static str },
    NegativeThreshold { provided: i64 },
    ThresholdTooLarge { provided: i64 },
    NegativeTimeout { provided: i64 },
    NonPositivePollInterval { provided: i64 },
    EmptyUserName,
    InvalidPasswordEncoding,
    InvalidSessionId { raw: String },
    Parameter(PropertyError),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidQueueName { name, reason } => {
                write!(f, "invalid queue name '{name}': {reason}")
            }
            Self::NegativeThreshold { provided } => {
                write!(f, "threshold must be zero or positive, got {provided}")
            }
            Self::ThresholdTooLarge { provided } => {
                write!(f, "threshold {provided} exceeds the supported maximum")
            }
            Self::NegativeTimeout { provided } => {
                write!(f, "timeout must be zero or positive, got {provided}ms")
            }
            Self::NonPositivePollInterval { provided } => {
                write!(f, "poll interval must be positive, got {provided}ms")
            }
            Self::EmptyUserName => write!(f, "user name must not be empty"),
            Self::InvalidPasswordEncoding => write!(f, "password is not valid hex-encoded UTF-8"),
            Self::InvalidSessionId { raw } => write!(f, "session id '{raw}' is not a UUID"),
            Self::Parameter(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<PropertyError> for RequestError {
    fn from(value: PropertyError) -> Self {
        Self::Parameter(value)
    }
}

/// Checks a queue name: 1 to 48 characters of `[A-Za-z0-9._%-]`.
pub fn validate_queue_name(name: &str) -> Result<(), RequestError> {
    if name.is_empty() {
        return Err(RequestError::InvalidQueueName {
            name: name.to_owned(),
            reason: "must not be empty",
        });
    }
    if name.chars().count() > MAX_QUEUE_NAME_LEN {
        return Err(RequestError::InvalidQueueName {
            name: name.to_owned(),
            reason: "must be at most 48 characters",
        });
    }
    if !name.chars().all(is_queue_name_char) {
        return Err(RequestError::InvalidQueueName {
            name: name.to_owned(),
            reason: "allowed characters are A-Z, a-z, 0-9, '.', '_', '%', '-'",
        });
    }
    Ok(())
}

fn is_queue_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '%' | '-')
}

fn validate_query_pattern(pattern: &str, is_prefix: bool) -> Result<(), RequestError> {
    // An empty prefix lists every queue.
    if pattern.is_empty() && is_prefix {
        return Ok(());
    }
    validate_queue_name(pattern)
}

fn validate_threshold(threshold: i64) -> Result<(), RequestError> {
    if threshold < 0 {
        return Err(RequestError::NegativeThreshold {
            provided: threshold,
        });
    }
    if threshold > i64::from(i32::MAX) {
        return Err(RequestError::ThresholdTooLarge {
            provided: threshold,
        });
    }
    Ok(())
}

fn validate_timeouts(timeout_ms: i64, poll_interval_ms: i64) -> Result<(), RequestError> {
    if timeout_ms < 0 {
        return Err(RequestError::NegativeTimeout {
            provided: timeout_ms,
        });
    }
    if poll_interval_ms <= 0 {
        return Err(RequestError::NonPositivePollInterval {
            provided: poll_interval_ms,
        });
    }
    Ok(())
}

fn control_request(request_type: RequestType) -> MessageEnvelope {
    let mut envelope = MessageEnvelope::control();
    envelope.set_request_type(request_type);
    envelope
}

pub fn define_queue(name: &str, threshold: i64) -> Result<MessageEnvelope, RequestError> {
    validate_queue_name(name)?;
    validate_threshold(threshold)?;

    let mut envelope = control_request(RequestType::DefineQueue);
    envelope.properties.set_string(QUEUE_NAME_KEY, name);
    envelope.properties.set_int(THRESHOLD_KEY, threshold as i32);
    Ok(envelope)
}

pub fn delete_queue(name: &str, force: bool) -> Result<MessageEnvelope, RequestError> {
    validate_queue_name(name)?;

    let mut envelope = control_request(RequestType::DeleteQueue);
    envelope.properties.set_string(QUEUE_NAME_KEY, name);
    envelope.properties.set_bool(FORCE_KEY, force);
    Ok(envelope)
}

pub fn get(name: &str, timeout_ms: i64, poll_interval_ms: i64) -> Result<MessageEnvelope, RequestError> {
    validate_queue_name(name)?;
    validate_timeouts(timeout_ms, poll_interval_ms)?;

    let mut envelope = control_request(RequestType::Get);
    envelope.properties.set_string(QUEUE_NAME_KEY, name);
    envelope.properties.set_long(TIMEOUT_MS_KEY, timeout_ms);
    envelope.properties.set_long(POLL_INTERVAL_MS_KEY, poll_interval_ms);
    Ok(envelope)
}

pub fn query_queue(
    pattern: &str,
    is_prefix: bool,
    include_all_data: bool,
) -> Result<MessageEnvelope, RequestError> {
    validate_query_pattern(pattern, is_prefix)?;

    let mut envelope = control_request(RequestType::QueryQueue);
    envelope.properties.set_string(QUEUE_NAME_KEY, pattern);
    envelope.properties.set_bool(IS_PREFIX_KEY, is_prefix);
    envelope.properties.set_bool(INCLUDE_ALL_DATA_KEY, include_all_data);
    Ok(envelope)
}

pub fn login(user: &str, password: &str, session_id: Uuid) -> Result<MessageEnvelope, RequestError> {
    if user.is_empty() {
        return Err(RequestError::EmptyUserName);
    }

    let mut envelope = control_request(RequestType::Login);
    envelope.properties.set_string(USER_NAME_KEY, user);
    envelope
        .properties
        .set_string(PASSWORD_KEY, hex::encode(password.as_bytes()));
    envelope
        .properties
        .set_string(SESSION_ID_KEY, session_id.to_string());
    Ok(envelope)
}

pub fn shutdown(user: &str) -> Result<MessageEnvelope, RequestError> {
    if user.is_empty() {
        return Err(RequestError::EmptyUserName);
    }

    let mut envelope = control_request(RequestType::Shutdown);
    envelope.properties.set_string(USER_NAME_KEY, user);
    Ok(envelope)
}

/// Turns a data message into a put request for `name`. The body and caller properties are kept.
pub fn put(name: &str, mut message: MessageEnvelope) -> Result<MessageEnvelope, RequestError> {
    validate_queue_name(name)?;
    message.set_request_type(RequestType::None);
    message.properties.set_string(QUEUE_NAME_KEY, name);
    Ok(message)
}

/// Readies a stored message as the reply to the get `request`.
pub fn delivery(mut message: MessageEnvelope, request: &MessageEnvelope) -> MessageEnvelope {
    let stored = message.correlation_id();
    message
        .properties
        .set_bytes(STORED_CORRELATION_ID_KEY, stored.as_bytes().to_vec());
    message.set_correlation_id(request.id());
    message
}

/// Client-side inverse of `delivery`, applied once the reply has been matched.
pub fn restore_delivered(message: &mut MessageEnvelope) {
    let Some(PropertyValue::Bytes(raw)) = message.properties.remove(STORED_CORRELATION_ID_KEY)
    else {
        return;
    };
    if let Ok(bytes) = <[u8; 16]>::try_from(raw.as_slice()) {
        message.set_correlation_id(MessageId::from_bytes(bytes));
    }
}

/// Server-side view of a decoded request envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum BrokerRequest {
    Login {
        user: String,
        password: String,
        session_id: Option<Uuid>,
    },
    Get {
        queue_name: String,
        timeout_ms: i64,
        poll_interval_ms: Option<i64>,
    },
    DefineQueue {
        queue_name: String,
        threshold: usize,
    },
    DeleteQueue {
        queue_name: String,
        force: bool,
    },
    QueryQueue {
        pattern: String,
        is_prefix: bool,
        include_all_data: bool,
    },
    Shutdown {
        user: String,
    },
    SystemStateChange,
    Put {
        queue_name: String,
    },
}

impl BrokerRequest {
    pub fn parse(envelope: &MessageEnvelope) -> Result<Self, RequestError> {
        let props = &envelope.properties;
        match envelope.request_type() {
            RequestType::Login => {
                let user = props.get_string(USER_NAME_KEY)?;
                if user.is_empty() {
                    return Err(RequestError::EmptyUserName);
                }
                let encoded = props.get_string(PASSWORD_KEY)?;
                let password = hex::decode(encoded.as_bytes())
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .ok_or(RequestError::InvalidPasswordEncoding)?;
                let session_id = match optional(props.get_string(SESSION_ID_KEY))? {
                    Some(raw) => Some(
                        Uuid::parse_str(&raw).map_err(|_| RequestError::InvalidSessionId { raw })?,
                    ),
                    None => None,
                };
                Ok(Self::Login {
                    user,
                    password,
                    session_id,
                })
            }
            RequestType::Get => {
                let queue_name = queue_name(props)?;
                let timeout_ms = optional(props.get_long(TIMEOUT_MS_KEY))?.unwrap_or(0);
                let poll_interval_ms = optional(props.get_long(POLL_INTERVAL_MS_KEY))?;
                validate_timeouts(timeout_ms, poll_interval_ms.unwrap_or(1))?;
                Ok(Self::Get {
                    queue_name,
                    timeout_ms,
                    poll_interval_ms,
                })
            }
            RequestType::DefineQueue => {
                let queue_name = queue_name(props)?;
                let threshold = optional(props.get_long(THRESHOLD_KEY))?.unwrap_or(0);
                validate_threshold(threshold)?;
                Ok(Self::DefineQueue {
                    queue_name,
                    threshold: threshold as usize,
                })
            }
            RequestType::DeleteQueue => Ok(Self::DeleteQueue {
                queue_name: queue_name(props)?,
                force: optional(props.get_bool(FORCE_KEY))?.unwrap_or(false),
            }),
            RequestType::QueryQueue => {
                let pattern = optional(props.get_string(QUEUE_NAME_KEY))?.unwrap_or_default();
                let is_prefix = optional(props.get_bool(IS_PREFIX_KEY))?.unwrap_or(false);
                validate_query_pattern(&pattern, is_prefix)?;
                Ok(Self::QueryQueue {
                    pattern,
                    is_prefix,
                    include_all_data: optional(props.get_bool(INCLUDE_ALL_DATA_KEY))?
                        .unwrap_or(false),
                })
            }
            RequestType::Shutdown => {
                let user = props.get_string(USER_NAME_KEY)?;
                if user.is_empty() {
                    return Err(RequestError::EmptyUserName);
                }
                Ok(Self::Shutdown { user })
            }
            RequestType::SystemStateChange => Ok(Self::SystemStateChange),
            RequestType::None | RequestType::Unknown(_) => Ok(Self::Put {
                queue_name: queue_name(props)?,
            }),
        }
    }

    pub fn requires_login(&self) -> bool {
        !matches!(self, Self::Login { .. })
    }
}

fn queue_name(props: &Properties) -> Result<String, RequestError> {
    let name = props.get_string(QUEUE_NAME_KEY)?;
    validate_queue_name(&name)?;
    Ok(name)
}

fn optional<T>(result: Result<T, PropertyError>) -> Result<Option<T>, RequestError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(PropertyError::NotFound { .. }) => Ok(None),
        Err(error) => Err(RequestError::Parameter(error)),
    }
}
