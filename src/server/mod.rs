pub mod dispatch;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::context::BrokerContext;
use crate::logging::LogLevel;
use crate::message::{MessageEnvelope, Response};

const READ_CHUNK_SIZE_BYTES: usize = 16 * 1024;

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    SpawnWorker {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::SpawnWorker { source } => {
                write!(f, "failed to spawn connection worker thread: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// One accepted client socket, shared between its worker and the server registry.
pub struct ClientConnection {
    id: u64,
    peer_addr: SocketAddr,
    stream: TcpStream,
}

impl ClientConnection {
    fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        read_poll: Duration,
    ) -> Result<Self, ServerError> {
        stream
            .set_nonblocking(false)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_read_timeout(Some(read_poll))
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        Ok(Self {
            id,
            peer_addr,
            stream,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Non-destructive check whether the peer has hung up.
    pub fn peer_closed(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut probe = [0_u8; 1];
        let closed = match self.stream.peek(&mut probe) {
            Ok(0) => true,
            Ok(_) => false,
            Err(error) => !matches!(
                error.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
        };
        let _ = self.stream.set_nonblocking(false);
        closed
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}

type ConnectionRegistry = Arc<Mutex<HashMap<u64, Arc<ClientConnection>>>>;

/// Non-blocking accept loop with one worker thread per connection.
pub struct BrokerServer {
    listener: TcpListener,
    context: BrokerContext,
    next_connection_id: AtomicU64,
    connections: ConnectionRegistry,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerServer {
    pub fn bind(context: BrokerContext) -> Result<Self, ServerError> {
        let address = format!(
            "{}:{}",
            context.config.server.host, context.config.server.port
        );
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            context,
            next_connection_id: AtomicU64::new(1),
            connections: Arc::new(Mutex::new(HashMap::new())),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn read_poll(&self) -> Duration {
        Duration::from_millis(self.context.config.server.read_poll_ms.max(1))
    }

    /// Accepts connections until the shutdown signal fires.
    pub fn run(&self) -> Result<(), ServerError> {
        let idle = self.read_poll();
        while !self.context.shutdown.is_triggered() {
            if !self.try_accept()? {
                thread::sleep(idle);
            }
        }
        Ok(())
    }

    /// Accepts at most one pending connection. Returns whether one was accepted.
    pub fn try_accept(&self) -> Result<bool, ServerError> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(source) if source.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(source) => return Err(ServerError::Accept { source }),
        };

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = match ClientConnection::new(id, stream, peer_addr, self.read_poll()) {
            Ok(connection) => Arc::new(connection),
            Err(error) => {
                self.context.logger.warn(
                    Some("server::accept"),
                    &format!("dropping connection from {peer_addr}: {error}"),
                );
                return Ok(true);
            }
        };

        self.context.sessions.register(id, peer_addr);
        self.connections
            .lock()
            .expect("active connections lock poisoned")
            .insert(id, Arc::clone(&connection));
        self.context.logger.log(
            LogLevel::Info,
            Some("server::accept"),
            "Accepted TCP connection",
            Some(json!({
                "connection_id": id,
                "peer_addr": peer_addr.to_string()
            })),
        );

        let context = self.context.clone();
        let registry = Arc::clone(&self.connections);
        let worker = thread::Builder::new()
            .name(format!("tidemq-conn-{id}"))
            .spawn(move || serve_connection(context, connection, registry));
        match worker {
            Ok(handle) => {
                let mut workers = self.workers.lock().expect("worker handles lock poisoned");
                workers.retain(|handle| !handle.is_finished());
                workers.push(handle);
                Ok(true)
            }
            Err(source) => {
                self.forget_connection(id);
                Err(ServerError::SpawnWorker { source })
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("active connections lock poisoned")
            .len()
    }

    /// Closes every client socket and waits for the workers to finish.
    pub fn shutdown_all_connections(&self) {
        let connections: Vec<Arc<ClientConnection>> = self
            .connections
            .lock()
            .expect("active connections lock poisoned")
            .values()
            .cloned()
            .collect();
        for connection in &connections {
            let _ = connection.shutdown();
        }

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("worker handles lock poisoned")
            .drain(..)
            .collect();
        let joined = workers.len();
        for worker in workers {
            if worker.join().is_err() {
                self.context
                    .logger
                    .error(Some("server::shutdown"), "connection worker panicked");
            }
        }

        self.context.logger.log(
            LogLevel::Info,
            Some("server::shutdown"),
            "All client connections closed",
            Some(json!({ "closed": connections.len(), "workers_joined": joined })),
        );
    }

    fn forget_connection(&self, id: u64) {
        self.connections
            .lock()
            .expect("active connections lock poisoned")
            .remove(&id);
        let _ = self.context.sessions.remove(id);
    }
}

fn serve_connection(
    context: BrokerContext,
    connection: Arc<ClientConnection>,
    registry: ConnectionRegistry,
) {
    let id = connection.id();
    let mut frames = context.codec.frame_buffer();
    let mut chunk = vec![0_u8; READ_CHUNK_SIZE_BYTES];
    let cancelled = || connection.peer_closed();

    'session: while !context.shutdown.is_triggered() {
        let read = (&connection.stream).read(&mut chunk);
        match read {
            Ok(0) => break,
            Ok(size) => frames.extend(&chunk[..size]),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(error) => {
                context.logger.warn(
                    Some("server::connection"),
                    &format!("read error on connection {id}: {error}; closing connection"),
                );
                break;
            }
        }

        loop {
            let request = match frames.next_envelope() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(error) => {
                    context.logger.warn(
                        Some("server::connection"),
                        &format!("undecodable frame on connection {id}: {error}; closing connection"),
                    );
                    let mut reply = MessageEnvelope::control();
                    reply.set_response(Some(Response::error(error.to_string())));
                    let _ = context.codec.write_frame(&mut &connection.stream, &reply);
                    break 'session;
                }
            };

            context.logger.verbose(
                Some("server::connection"),
                &format!(
                    "request {} on connection {id}",
                    request.request_type().as_str()
                ),
            );
            let reply = dispatch::dispatch(&context, id, &request, &cancelled);
            if let Err(error) = context.codec.write_frame(&mut &connection.stream, &reply) {
                context.logger.warn(
                    Some("server::connection"),
                    &format!("write error on connection {id}: {error}; closing connection"),
                );
                break 'session;
            }
        }
    }

    let _ = connection.shutdown();
    registry
        .lock()
        .expect("active connections lock poisoned")
        .remove(&id);
    let user = context
        .sessions
        .remove(id)
        .ok()
        .and_then(|snapshot| snapshot.authenticated_user);
    context.logger.log(
        LogLevel::Info,
        Some("server::connection"),
        "Connection closed",
        Some(json!({
            "connection_id": id,
            "peer_addr": connection.peer_addr().to_string(),
            "user": user
        })),
    );
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use crate::client::{BrokerClient, ClientError, ClientOptions};
    use crate::config::{AppConfig, RemoteRoute, UserCredentials};
    use crate::context::BrokerContext;
    use crate::logging::Logger;
    use crate::manager::tests::{temp_root, test_config};
    use crate::manager::QueueManager;
    use crate::message::{MessageEnvelope, MessageId, ResponseCode};
    use crate::shutdown::ShutdownSignal;
    use crate::storage::StorageFacade;
    use crate::wire::codec::{CodecConfig, WireCodec};

    use super::dispatch::REMOTE_GET_SLICE_MS;
    use super::BrokerServer;

    struct RunningBroker {
        addr: SocketAddr,
        shutdown: ShutdownSignal,
        handle: Option<JoinHandle<()>>,
        root: PathBuf,
    }

    impl RunningBroker {
        fn start(label: &str) -> Self {
            Self::start_with(label, |_| {})
        }

        fn start_with(label: &str, configure: impl FnOnce(&mut AppConfig)) -> Self {
            let root = temp_root(label);
            let mut app_config = test_config(&root);
            app_config.server.port = 0;
            app_config.server.read_poll_ms = 20;
            app_config.broker.max_get_wait_ms = 5_000;
            app_config.broker.default_poll_interval_ms = 20;
            app_config.auth.users = vec![
                UserCredentials {
                    name: "alice".to_owned(),
                    password: "secret".to_owned(),
                },
                UserCredentials {
                    name: "bob".to_owned(),
                    password: "hunter2".to_owned(),
                },
            ];
            configure(&mut app_config);

            let (logger, _) = Logger::in_memory();
            let logger = Arc::new(logger);
            let storage = Arc::new(
                StorageFacade::initialize(&app_config, &logger).expect("storage should initialize"),
            );
            let manager = Arc::new(
                QueueManager::new(&app_config, storage, Arc::clone(&logger)).expect("manager"),
            );
            let codec = WireCodec::from_app_config(&app_config).expect("codec");
            let shutdown = ShutdownSignal::new();
            let context = BrokerContext::new(
                Arc::new(app_config),
                logger,
                manager,
                shutdown.clone(),
                codec,
            );

            let server = BrokerServer::bind(context).expect("server should bind");
            let addr = server.local_addr().expect("bound address");
            let handle = thread::spawn(move || {
                server.run().expect("accept loop should not fail");
                server.shutdown_all_connections();
            });

            Self {
                addr,
                shutdown,
                handle: Some(handle),
                root,
            }
        }

        fn client(&self, user: &str, password: &str) -> BrokerClient {
            let mut client = BrokerClient::new(ClientOptions::default());
            client
                .connect_and_login("127.0.0.1", self.addr.port(), user, password)
                .expect("login should succeed");
            client
        }
    }

    impl Drop for RunningBroker {
        fn drop(&mut self) {
            self.shutdown.trigger();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn rejected_code(error: ClientError) -> ResponseCode {
        match error {
            ClientError::Rejected(response) => response.code,
            other => panic!("expected a rejection, got {other}"),
        }
    }

    #[test]
    fn define_put_get_round_trip_honours_threshold_priority_and_timeout() {
        let broker = RunningBroker::start("e2e");
        let mut client = broker.client("alice", "secret");

        client.define_queue("ORDERS", 2).expect("define");
        let again = client.define_queue("ORDERS", 2).expect("second define is a warning");
        assert_eq!(again.code, ResponseCode::Warn);

        let medium = MessageEnvelope::text("p5").with_priority(5).expect("priority");
        let high = MessageEnvelope::text("p9").with_priority(9).expect("priority");
        let low = MessageEnvelope::text("p1").with_priority(1).expect("priority");
        client.put("ORDERS", medium).expect("first put");
        client.put("ORDERS", high).expect("second put");
        let third = client.put("ORDERS", low).expect_err("threshold reached");
        assert_eq!(rejected_code(third), ResponseCode::Fail);

        let props = client.query_queue("ORDERS", false, false).expect("query");
        assert_eq!(props.get_long("queue.0.size").expect("size"), 2);

        let first = client.get("ORDERS", 1_000, 20).expect("get").expect("message");
        assert_eq!(first.text_body(), Some("p9"));
        let second = client.get("ORDERS", 1_000, 20).expect("get").expect("message");
        assert_eq!(second.text_body(), Some("p5"));

        let started = Instant::now();
        let empty = client.get("ORDERS", 100, 20).expect("timed out get is a warning");
        let waited = started.elapsed();
        assert!(empty.is_none());
        assert!(waited >= Duration::from_millis(90), "returned after {waited:?}");
        assert!(waited < Duration::from_secs(3), "returned after {waited:?}");
    }

    #[test]
    fn delete_requires_force_for_non_empty_queue() {
        let broker = RunningBroker::start("delete");
        let mut client = broker.client("alice", "secret");

        client.define_queue("WORK", 0).expect("define");
        client
            .put("WORK", MessageEnvelope::text("pending"))
            .expect("put");

        let refused = client.delete_queue("WORK", false).expect_err("queue holds a message");
        assert_eq!(rejected_code(refused), ResponseCode::Fail);
        client.delete_queue("WORK", true).expect("forced delete");

        let missing = client
            .put("WORK", MessageEnvelope::text("late"))
            .expect_err("queue is gone");
        assert_eq!(rejected_code(missing), ResponseCode::Fail);
        let warn = client.delete_queue("WORK", true).expect("missing queue is a warning");
        assert_eq!(warn.code, ResponseCode::Warn);
    }

    #[test]
    fn requests_before_login_are_refused() {
        let broker = RunningBroker::start("login");
        let mut client = BrokerClient::new(ClientOptions::default());
        client
            .connect("127.0.0.1", broker.addr.port())
            .expect("connect");

        let wrong = client.login("alice", "nope").expect_err("wrong password");
        assert_eq!(rejected_code(wrong), ResponseCode::Fail);

        let mut anonymous = BrokerClient::new(ClientOptions::default());
        anonymous
            .connect("127.0.0.1", broker.addr.port())
            .expect("connect");
        let refused = anonymous
            .define_queue("ANY", 0)
            .expect_err("not logged in");
        assert_eq!(rejected_code(refused), ResponseCode::Fail);
        assert!(anonymous
            .last_response()
            .is_some_and(|text| text.contains("not logged in")));
    }

    #[test]
    fn query_reports_sizes_and_details() {
        let broker = RunningBroker::start("query");
        let mut client = broker.client("alice", "secret");
        client.define_queue("APP.A", 5).expect("define");
        client.define_queue("APP.B", 0).expect("define");
        client
            .put("APP.B", MessageEnvelope::text("x").with_priority(9).expect("priority"))
            .expect("put");

        let props = client.query_queue("APP.", true, true).expect("query");
        assert_eq!(props.get_int("queueCount").expect("count"), 2);
        assert_eq!(props.get_string("queue.0.name").expect("name"), "APP.A");
        assert_eq!(props.get_string("queue.1.kind").expect("kind"), "local");
        assert_eq!(props.get_long("queue.1.size").expect("size"), 1);
        assert_eq!(props.get_long("queue.0.threshold").expect("threshold"), 5);
        assert_eq!(props.get_long("queue.1.depth.9").expect("depth"), 1);
        assert_eq!(
            props.get_string("queue.1.lastAccessUser").expect("user"),
            "alice"
        );
        assert_eq!(
            props.get_string("queue.1.lastAccessOperation").expect("op"),
            "put"
        );

        let none = client.query_queue("NOPE", false, false).expect("warn is success");
        assert!(none.is_empty());
    }

    #[test]
    fn shutdown_requires_session_user_and_triggers_signal() {
        let broker = RunningBroker::start("shutdown");
        let mut client = broker.client("alice", "secret");

        let refused = client.shutdown("bob").expect_err("bob is not the session user");
        assert_eq!(rejected_code(refused), ResponseCode::Fail);
        assert!(!broker.shutdown.is_triggered());

        client.shutdown("alice").expect("shutdown accepted");
        assert!(broker.shutdown.is_triggered());
    }

    #[test]
    fn undecodable_frame_gets_error_reply_then_close() {
        let broker = RunningBroker::start("garbage");
        let mut stream = TcpStream::connect(broker.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .expect("read timeout");
        stream
            .write_all(&u32::MAX.to_be_bytes())
            .expect("write oversized header");

        let codec = WireCodec::new(CodecConfig::default());
        let reply = codec.read_frame(&mut stream).expect("error reply");
        assert_eq!(reply.response_code(), Some(ResponseCode::Error));
        assert_eq!(reply.correlation_id(), MessageId::nil());

        let mut rest = [0_u8; 1];
        assert_eq!(stream.read(&mut rest).expect("closed by server"), 0);
    }

    #[test]
    fn pending_get_ends_when_broker_shuts_down() {
        let broker = RunningBroker::start("cancel");
        let mut client = broker.client("alice", "secret");
        client.define_queue("IDLE", 0).expect("define");

        let signal = broker.shutdown.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            signal.trigger();
        });

        let started = Instant::now();
        let outcome = client.get("IDLE", 0, 20);
        trigger.join().expect("trigger thread");

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!matches!(outcome, Ok(Some(_))));
    }

    #[test]
    fn get_returns_the_stored_correlation_id() {
        let broker = RunningBroker::start("correlation");
        let mut client = broker.client("alice", "secret");
        client.define_queue("REPLIES", 0).expect("define");

        let question = MessageEnvelope::text("question");
        let mut answer = MessageEnvelope::text("answer");
        answer.set_correlation_id(question.id());
        let answer_id = answer.id();
        client.put("REPLIES", answer).expect("put");

        let got = client.get("REPLIES", 1_000, 20).expect("get").expect("message");
        assert_eq!(got.id(), answer_id);
        assert_eq!(got.correlation_id(), question.id());
        assert!(got.response().is_none());
    }

    fn routed_to(remote: &RunningBroker, queues: &[&str]) -> impl FnOnce(&mut AppConfig) {
        let port = remote.addr.port();
        let routes: Vec<RemoteRoute> = queues
            .iter()
            .map(|queue| RemoteRoute {
                queue: (*queue).to_owned(),
                manager: "QM_WEST".to_owned(),
                host: "127.0.0.1".to_owned(),
                port,
            })
            .collect();
        move |app_config: &mut AppConfig| {
            app_config.manager.name = "QM_EAST".to_owned();
            app_config.remote.user = "alice".to_owned();
            app_config.remote.password = "secret".to_owned();
            app_config.remote.routes = routes;
        }
    }

    #[test]
    fn remote_queues_behave_like_local_ones() {
        let west = RunningBroker::start_with("west", |app_config| {
            app_config.manager.name = "QM_WEST".to_owned();
        });
        let mut west_client = west.client("alice", "secret");
        west_client.define_queue("PAY", 1).expect("define on the owning manager");

        let east = RunningBroker::start_with("east", routed_to(&west, &["PAY", "GONE"]));
        let mut client = east.client("bob", "hunter2");

        let request = MessageEnvelope::text("invoice 17");
        let mut message = MessageEnvelope::text("wire 40 EUR")
            .with_priority(7)
            .expect("priority");
        message.set_correlation_id(request.id());
        let message_id = message.id();
        let stored = client.put("PAY", message).expect("remote put");
        assert_eq!(stored.code, ResponseCode::Ok);

        let over = client
            .put("PAY", MessageEnvelope::text("second"))
            .expect_err("remote threshold of 1");
        assert_eq!(rejected_code(over), ResponseCode::Fail);
        assert!(client
            .last_response()
            .is_some_and(|text| text.contains("threshold")));

        let gone = client
            .get("GONE", 100, 20)
            .expect_err("route points at an undefined queue");
        assert_eq!(rejected_code(gone), ResponseCode::Fail);

        let props = client.query_queue("PAY", false, false).expect("query");
        assert_eq!(props.get_string("queue.0.kind").expect("kind"), "remote");

        let got = client.get("PAY", 1_000, 20).expect("remote get").expect("message");
        assert_eq!(got.id(), message_id);
        assert_eq!(got.text_body(), Some("wire 40 EUR"));
        assert_eq!(got.priority().value(), 7);
        assert_eq!(got.correlation_id(), request.id());

        let west_props = west_client.query_queue("PAY", false, false).expect("query");
        assert_eq!(west_props.get_long("queue.0.size").expect("size"), 0);
    }

    #[test]
    fn remote_get_notices_shutdown_between_slices() {
        let west = RunningBroker::start("west-idle");
        let mut west_client = west.client("alice", "secret");
        west_client.define_queue("PAY", 0).expect("define");

        let east = RunningBroker::start_with("east-idle", routed_to(&west, &["PAY"]));
        let mut client = east.client("alice", "secret");

        let signal = east.shutdown.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            signal.trigger();
        });

        let started = Instant::now();
        let outcome = client.get("PAY", 4_000, 20);
        trigger.join().expect("trigger thread");

        let waited = started.elapsed();
        assert!(
            waited < Duration::from_millis(4 * REMOTE_GET_SLICE_MS as u64),
            "returned after {waited:?}"
        );
        assert!(!matches!(outcome, Ok(Some(_))));
    }
}
