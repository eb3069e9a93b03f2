use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{BrokerClient, ClientError, ClientOptions};
use crate::config::{AppConfig, RemoteRoute};
use crate::message::{MessageEnvelope, Response};
use crate::pools::{PoolError, RemoteConnectionPool};
use crate::wire::codec::CodecConfig;

#[derive(Debug)]
pub enum RemoteError {
    Pool(PoolError),
    Client {
        manager: String,
        source: ClientError,
    },
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(source) => write!(f, "remote slot unavailable: {source}"),
            Self::Client { manager, source } => {
                write!(f, "remote manager '{manager}' error: {source}")
            }
        }
    }
}

impl std::error::Error for RemoteError {}

/// What the remote manager answered once the call got through.
#[derive(Debug, PartialEq)]
pub enum RemoteOutcome<T> {
    Completed(T),
    /// The remote manager refused with FAIL or ERROR. Relayed to the caller as is.
    Refused(Response),
}

/// Identity and limits used for every outbound call to another manager.
#[derive(Clone, Debug)]
pub struct RemoteSettings {
    pub user: String,
    pub password: String,
    pub acquire_timeout: Duration,
    pub io_timeout: Duration,
    pub codec: CodecConfig,
}

impl RemoteSettings {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self {
            user: app_config.remote.user.clone(),
            password: app_config.remote.password.clone(),
            acquire_timeout: Duration::from_millis(app_config.remote.acquire_timeout_ms),
            io_timeout: Duration::from_millis(app_config.remote.io_timeout_ms),
            codec: CodecConfig {
                max_envelope_size_bytes: app_config.wire.max_envelope_size_bytes,
            },
        }
    }
}

/// Stand-in for a queue owned by another manager.
///
/// Each operation takes a slot from the shared pool, opens a fresh connection, logs in as
/// the configured system identity, runs exactly one request and disconnects.
#[derive(Clone, Debug)]
pub struct RemoteQueueProxy {
    queue_name: String,
    route: RemoteRoute,
    pool: Arc<RemoteConnectionPool>,
    settings: Arc<RemoteSettings>,
}

impl RemoteQueueProxy {
    pub fn new(
        queue_name: impl Into<String>,
        route: RemoteRoute,
        pool: Arc<RemoteConnectionPool>,
        settings: Arc<RemoteSettings>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            route,
            pool,
            settings,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn route(&self) -> &RemoteRoute {
        &self.route
    }

    /// Forwards a put. Any response code the remote manager gives is returned as a value.
    pub fn put(&self, message: MessageEnvelope) -> Result<Response, RemoteError> {
        let queue_name = self.queue_name.clone();
        match self.with_session(move |client| client.put(&queue_name, message))? {
            RemoteOutcome::Completed(response) | RemoteOutcome::Refused(response) => Ok(response),
        }
    }

    pub fn get(
        &self,
        timeout_ms: i64,
        poll_interval_ms: i64,
    ) -> Result<RemoteOutcome<Option<MessageEnvelope>>, RemoteError> {
        self.with_session(|client| client.get(&self.queue_name, timeout_ms, poll_interval_ms))
    }

    fn with_session<T, F>(&self, operation: F) -> Result<RemoteOutcome<T>, RemoteError>
    where
        F: FnOnce(&mut BrokerClient) -> Result<T, ClientError>,
    {
        let _slot = self
            .pool
            .acquire(self.settings.acquire_timeout)
            .map_err(RemoteError::Pool)?;

        let mut client = BrokerClient::new(ClientOptions {
            io_timeout: Some(self.settings.io_timeout),
            codec: self.settings.codec,
        });
        if let Err(source) = client.connect_and_login(
            &self.route.host,
            self.route.port,
            &self.settings.user,
            &self.settings.password,
        ) {
            client.disconnect();
            return Err(self.client_error(source));
        }

        let result = operation(&mut client);
        client.disconnect();

        match result {
            Ok(value) => Ok(RemoteOutcome::Completed(value)),
            Err(ClientError::Rejected(response)) => Ok(RemoteOutcome::Refused(response)),
            Err(source) => Err(self.client_error(source)),
        }
    }

    fn client_error(&self, source: ClientError) -> RemoteError {
        RemoteError::Client {
            manager: self.route.manager.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::config::RemoteRoute;
    use crate::message::{MessageEnvelope, RequestType, Response};
    use crate::pools::RemoteConnectionPool;
    use crate::wire::codec::{CodecConfig, WireCodec};

    use super::{RemoteError, RemoteOutcome, RemoteQueueProxy, RemoteSettings};

    fn settings() -> Arc<RemoteSettings> {
        Arc::new(RemoteSettings {
            user: "system".to_owned(),
            password: "pw".to_owned(),
            acquire_timeout: Duration::from_millis(100),
            io_timeout: Duration::from_secs(2),
            codec: CodecConfig::default(),
        })
    }

    fn route(port: u16) -> RemoteRoute {
        RemoteRoute {
            queue: "PAYMENTS".to_owned(),
            manager: "QM_WEST".to_owned(),
            host: "127.0.0.1".to_owned(),
            port,
        }
    }

    #[test]
    fn put_logs_in_then_forwards_and_releases_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake manager");
        let port = listener.local_addr().expect("local addr").port();

        let server = thread::spawn(move || {
            let codec = WireCodec::new(CodecConfig::default());
            let (mut stream, _) = listener.accept().expect("accept proxy");
            let mut seen = Vec::new();
            for _ in 0..2 {
                let request = codec.read_frame(&mut stream).expect("read request");
                seen.push((
                    request.request_type(),
                    request.properties.get_string("queueName").ok(),
                ));
                let reply = MessageEnvelope::reply_to(&request, Response::ok("done"));
                codec.write_frame(&mut stream, &reply).expect("write reply");
            }
            seen
        });

        let pool = Arc::new(RemoteConnectionPool::new(1).expect("pool"));
        let proxy = RemoteQueueProxy::new("PAYMENTS", route(port), Arc::clone(&pool), settings());
        let response = proxy
            .put(MessageEnvelope::text("forwarded"))
            .expect("remote put should succeed");

        let seen = server.join().expect("fake manager should finish");
        assert_eq!(response, Response::ok("done"));
        assert_eq!(
            seen,
            vec![
                (RequestType::Login, None),
                (RequestType::None, Some("PAYMENTS".to_owned())),
            ]
        );
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn remote_refusal_is_relayed_not_raised() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake manager");
        let port = listener.local_addr().expect("local addr").port();

        let server = thread::spawn(move || {
            let codec = WireCodec::new(CodecConfig::default());
            let (mut stream, _) = listener.accept().expect("accept proxy");
            let login = codec.read_frame(&mut stream).expect("read login");
            let reply = MessageEnvelope::reply_to(&login, Response::ok("welcome"));
            codec.write_frame(&mut stream, &reply).expect("write login reply");

            let request = codec.read_frame(&mut stream).expect("read get");
            let reply =
                MessageEnvelope::reply_to(&request, Response::fail("queue PAYMENTS not found"));
            codec.write_frame(&mut stream, &reply).expect("write refusal");
        });

        let pool = Arc::new(RemoteConnectionPool::new(1).expect("pool"));
        let proxy = RemoteQueueProxy::new("PAYMENTS", route(port), Arc::clone(&pool), settings());
        let outcome = proxy.get(50, 10).expect("refusal is not a transport failure");
        server.join().expect("fake manager should finish");

        assert_eq!(
            outcome,
            RemoteOutcome::Refused(Response::fail("queue PAYMENTS not found"))
        );
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn rejected_login_stays_a_client_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake manager");
        let port = listener.local_addr().expect("local addr").port();

        let server = thread::spawn(move || {
            let codec = WireCodec::new(CodecConfig::default());
            let (mut stream, _) = listener.accept().expect("accept proxy");
            let login = codec.read_frame(&mut stream).expect("read login");
            let reply = MessageEnvelope::reply_to(&login, Response::fail("bad credentials"));
            codec.write_frame(&mut stream, &reply).expect("write refusal");
        });

        let pool = Arc::new(RemoteConnectionPool::new(1).expect("pool"));
        let proxy = RemoteQueueProxy::new("PAYMENTS", route(port), Arc::clone(&pool), settings());
        let err = proxy
            .put(MessageEnvelope::text("denied"))
            .expect_err("login refusal is a configuration problem");
        server.join().expect("fake manager should finish");
        assert!(matches!(err, RemoteError::Client { .. }));
    }

    #[test]
    fn exhausted_pool_fails_fast_with_pool_error() {
        let pool = Arc::new(RemoteConnectionPool::new(1).expect("pool"));
        let _held = pool
            .acquire(Duration::from_millis(10))
            .expect("slot should be free");

        let proxy = RemoteQueueProxy::new("PAYMENTS", route(1), Arc::clone(&pool), settings());
        let err = proxy.get(10, 5).expect_err("no slot available");
        assert!(matches!(err, RemoteError::Pool(_)));
    }

    #[test]
    fn unreachable_manager_is_a_client_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let pool = Arc::new(RemoteConnectionPool::new(2).expect("pool"));
        let proxy = RemoteQueueProxy::new("PAYMENTS", route(port), Arc::clone(&pool), settings());
        let err = proxy
            .put(MessageEnvelope::text("lost"))
            .expect_err("nothing listens");
        assert!(matches!(err, RemoteError::Client { ref manager, .. } if manager == "QM_WEST"));
        assert_eq!(pool.in_use(), 0);
    }
}
