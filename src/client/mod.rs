use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::OnceLock;
use std::time::Duration;

use uuid::Uuid;

use crate::message::{MessageEnvelope, MessageId, Properties, Response, ResponseCode};
use crate::wire::codec::{CodecConfig, CodecError, WireCodec};
use crate::wire::request::{self, RequestError};

static PROCESS_SESSION_ID: OnceLock<Uuid> = OnceLock::new();

/// Session id shared by every client in this process, so reconnects resume the same session.
pub fn process_session_id() -> Uuid {
    *PROCESS_SESSION_ID.get_or_init(Uuid::new_v4)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    LoggedIn,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::LoggedIn => "logged in",
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    Connect {
        address: String,
        source: io::Error,
    },
    Io(io::Error),
    Codec(CodecError),
    Request(RequestError),
    MissingResponse,
    Rejected(Response),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { operation, state } => {
                write!(f, "cannot {operation} while {}", state.as_str())
            }
            Self::Connect { address, source } => {
                write!(f, "failed to connect to {address}: {source}")
            }
            Self::Io(source) => write!(f, "connection error: {source}"),
            Self::Codec(source) => write!(f, "{source}"),
            Self::Request(source) => write!(f, "invalid request: {source}"),
            Self::MissingResponse => write!(f, "reply carried no response code"),
            Self::Rejected(response) => write!(f, "request rejected: {response}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<RequestError> for ClientError {
    fn from(value: RequestError) -> Self {
        Self::Request(value)
    }
}

impl ClientError {
    /// Transport failures drop the socket; business rejections do not.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Codec(_) | Self::Connect { .. })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ClientOptions {
    /// Read/write timeout for a single exchange. `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
    pub codec: CodecConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            io_timeout: Some(Duration::from_secs(30)),
            codec: CodecConfig::default(),
        }
    }
}

/// Blocking broker connection: connect, log in, issue requests, disconnect.
pub struct BrokerClient {
    options: ClientOptions,
    codec: WireCodec,
    stream: Option<TcpStream>,
    state: ConnectionState,
    active_user: Option<String>,
    last_response: Option<String>,
}

impl BrokerClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            codec: WireCodec::new(options.codec),
            stream: None,
            state: ConnectionState::Disconnected,
            active_user: None,
            last_response: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    pub fn active_user(&self) -> Option<&str> {
        self.active_user.as_deref()
    }

    pub fn session_id(&self) -> Uuid {
        process_session_id()
    }

    pub fn last_response(&self) -> Option<&str> {
        self.last_response.as_deref()
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        self.disconnect();

        let address = format!("{host}:{port}");
        match self.open_stream(&address) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                self.last_response = Some(format!("connected to {address}"));
                Ok(())
            }
            Err(source) => {
                let error = ClientError::Connect { address, source };
                self.last_response = Some(error.to_string());
                Err(error)
            }
        }
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<Response, ClientError> {
        if self.state != ConnectionState::Connected {
            return Err(self.invalid_state("log in"));
        }

        let request = request::login(user, password, process_session_id())?;
        let response = self.exchange_for_response(&request)?;
        self.state = ConnectionState::LoggedIn;
        self.active_user = Some(user.to_owned());
        Ok(response)
    }

    pub fn connect_and_login(
        &mut self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<Response, ClientError> {
        self.connect(host, port)?;
        self.login(user, password)
    }

    pub fn define_queue(&mut self, name: &str, threshold: i64) -> Result<Response, ClientError> {
        self.require_connection("define a queue")?;
        let request = request::define_queue(name, threshold)?;
        self.exchange_for_response(&request)
    }

    pub fn delete_queue(&mut self, name: &str, force: bool) -> Result<Response, ClientError> {
        self.require_connection("delete a queue")?;
        let request = request::delete_queue(name, force)?;
        self.exchange_for_response(&request)
    }

    /// Returns the result properties of a query; empty when nothing matched.
    pub fn query_queue(
        &mut self,
        pattern: &str,
        is_prefix: bool,
        include_all_data: bool,
    ) -> Result<Properties, ClientError> {
        self.require_connection("query queues")?;
        let request = request::query_queue(pattern, is_prefix, include_all_data)?;
        let reply = self.send_and_receive(&request)?;
        self.classify(&reply)?;
        Ok(reply.properties)
    }

    pub fn put(&mut self, queue_name: &str, message: MessageEnvelope) -> Result<Response, ClientError> {
        self.require_connection("put a message")?;
        let request = request::put(queue_name, message)?;
        self.exchange_for_response(&request)
    }

    /// Takes the next message from `queue_name`, or `None` when none arrived in time.
    pub fn get(
        &mut self,
        queue_name: &str,
        timeout_ms: i64,
        poll_interval_ms: i64,
    ) -> Result<Option<MessageEnvelope>, ClientError> {
        self.require_connection("get a message")?;
        let request = request::get(queue_name, timeout_ms, poll_interval_ms)?;

        // The server may hold the reply for the whole wait.
        let read_timeout = match (self.options.io_timeout, timeout_ms) {
            (_, 0) | (None, _) => None,
            (Some(io_timeout), wait) => Some(io_timeout + Duration::from_millis(wait as u64)),
        };
        let reply = self.send_and_receive_with_timeout(&request, read_timeout)?;
        let response = self.classify(&reply)?;

        if response.code == ResponseCode::Ok {
            let mut message = reply;
            message.set_response(None);
            request::restore_delivered(&mut message);
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }

    pub fn shutdown(&mut self, user: &str) -> Result<Response, ClientError> {
        self.require_connection("request shutdown")?;
        let request = request::shutdown(user)?;
        self.exchange_for_response(&request)
    }

    /// Closes the socket. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = ConnectionState::Disconnected;
        self.active_user = None;
    }

    /// Writes `request` and blocks for the reply carrying its id as correlation id.
    pub fn send_and_receive(&mut self, request: &MessageEnvelope) -> Result<MessageEnvelope, ClientError> {
        self.send_and_receive_with_timeout(request, self.options.io_timeout)
    }

    fn send_and_receive_with_timeout(
        &mut self,
        request: &MessageEnvelope,
        read_timeout: Option<Duration>,
    ) -> Result<MessageEnvelope, ClientError> {
        let result = self.exchange(request, read_timeout);
        if let Err(error) = &result {
            self.last_response = Some(error.to_string());
            if error.is_transport() {
                self.disconnect();
            }
        }
        result
    }

    fn exchange(
        &mut self,
        request: &MessageEnvelope,
        read_timeout: Option<Duration>,
    ) -> Result<MessageEnvelope, ClientError> {
        let codec = self.codec;
        let Some(stream) = self.stream.as_mut() else {
            return Err(ClientError::InvalidState {
                operation: "send a request",
                state: ConnectionState::Disconnected,
            });
        };

        stream.set_read_timeout(read_timeout).map_err(ClientError::Io)?;
        codec.write_frame(&mut *stream, request).map_err(ClientError::Codec)?;

        loop {
            let reply = codec.read_frame(&mut *stream).map_err(ClientError::Codec)?;
            if reply.correlation_id() == request.id() {
                return Ok(reply);
            }
            // Undecodable-frame errors from the server carry a nil correlation id.
            if reply.correlation_id() == MessageId::nil() && reply.response_code() == Some(ResponseCode::Error) {
                return Ok(reply);
            }
        }
    }

    fn exchange_for_response(&mut self, request: &MessageEnvelope) -> Result<Response, ClientError> {
        let reply = self.send_and_receive(request)?;
        self.classify(&reply)
    }

    fn classify(&mut self, reply: &MessageEnvelope) -> Result<Response, ClientError> {
        let Some(response) = reply.response().cloned() else {
            self.last_response = Some(ClientError::MissingResponse.to_string());
            return Err(ClientError::MissingResponse);
        };

        self.last_response = Some(response.to_string());
        if response.code.is_success() {
            Ok(response)
        } else {
            Err(ClientError::Rejected(response))
        }
    }

    fn open_stream(&self, address: &str) -> io::Result<TcpStream> {
        let stream = match self.options.io_timeout {
            Some(timeout) => {
                let mut last_error = None;
                let mut connected = None;
                for candidate in address.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&candidate, timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(error) => last_error = Some(error),
                    }
                }
                match connected {
                    Some(stream) => stream,
                    None => {
                        return Err(last_error.unwrap_or_else(|| {
                            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
                        }))
                    }
                }
            }
            None => TcpStream::connect(address)?,
        };

        stream.set_nodelay(true)?;
        stream.set_write_timeout(self.options.io_timeout)?;
        Ok(stream)
    }

    fn require_connection(&self, operation: &'static str) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> ClientError {
        ClientError::InvalidState {
            operation,
            state: self.state,
        }
    }
}

impl Default for BrokerClient {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use crate::message::{MessageEnvelope, Response};
    use crate::wire::codec::{CodecConfig, WireCodec};

    use super::{process_session_id, BrokerClient, ClientError, ClientOptions, ConnectionState};

    fn options() -> ClientOptions {
        ClientOptions {
            io_timeout: Some(Duration::from_secs(2)),
            codec: CodecConfig::default(),
        }
    }

    #[test]
    fn session_id_is_stable_within_the_process() {
        assert_eq!(process_session_id(), process_session_id());
        let client = BrokerClient::new(options());
        assert_eq!(client.session_id(), process_session_id());
    }

    #[test]
    fn operations_require_a_connection() {
        let mut client = BrokerClient::new(options());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let err = client.define_queue("Q", 0).expect_err("not connected");
        assert!(matches!(
            err,
            ClientError::InvalidState {
                state: ConnectionState::Disconnected,
                ..
            }
        ));
        assert!(client.login("u", "p").is_err());

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn failed_connect_stays_disconnected_and_records_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let mut client = BrokerClient::new(options());
        let err = client.connect("127.0.0.1", port).expect_err("nothing listens");
        assert!(matches!(err, ClientError::Connect { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client
            .last_response()
            .is_some_and(|text| text.contains("failed to connect")));
    }

    #[test]
    fn replies_are_matched_by_correlation_id() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake broker");
        let port = listener.local_addr().expect("local addr").port();

        let server = thread::spawn(move || {
            let codec = WireCodec::new(CodecConfig::default());
            let (mut stream, _) = listener.accept().expect("accept client");
            let request = codec.read_frame(&mut stream).expect("read request");

            let stray = MessageEnvelope::reply_to(&MessageEnvelope::control(), Response::ok("stray"));
            codec.write_frame(&mut stream, &stray).expect("write stray reply");
            let reply = MessageEnvelope::reply_to(&request, Response::warn("queue exists"));
            codec.write_frame(&mut stream, &reply).expect("write reply");
        });

        let mut client = BrokerClient::new(options());
        client.connect("127.0.0.1", port).expect("connect");
        let response = client.define_queue("ORDERS", 0).expect("WARN counts as success");
        server.join().expect("fake broker should finish");

        assert_eq!(response, Response::warn("queue exists"));
        assert_eq!(client.last_response(), Some("WARN: queue exists"));
    }

    #[test]
    fn transport_error_drops_to_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake broker");
        let port = listener.local_addr().expect("local addr").port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept client");
            drop(stream);
        });

        let mut client = BrokerClient::new(options());
        client.connect("127.0.0.1", port).expect("connect");
        server.join().expect("fake broker should finish");

        let err = client
            .delete_queue("ORDERS", false)
            .expect_err("peer closed the socket");
        assert!(err.is_transport());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn fail_response_is_a_rejection_but_keeps_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake broker");
        let port = listener.local_addr().expect("local addr").port();

        let server = thread::spawn(move || {
            let codec = WireCodec::new(CodecConfig::default());
            let (mut stream, _) = listener.accept().expect("accept client");
            let request = codec.read_frame(&mut stream).expect("read request");
            let reply = MessageEnvelope::reply_to(&request, Response::fail("bad credentials"));
            codec.write_frame(&mut stream, &reply).expect("write reply");
        });

        let mut client = BrokerClient::new(options());
        client.connect("127.0.0.1", port).expect("connect");
        let err = client.login("alice", "nope").expect_err("login rejected");
        server.join().expect("fake broker should finish");

        assert!(matches!(err, ClientError::Rejected(_)));
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.last_response(), Some("FAIL: bad credentials"));
    }
}
