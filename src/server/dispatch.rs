use std::time::{Duration, Instant};

use serde_json::json;

use crate::context::BrokerContext;
use crate::logging::LogLevel;
use crate::manager::{DefineOutcome, DeleteOutcome, ManagerError, QueueHandle, QueueLocation};
use crate::message::{MessageEnvelope, Properties, Response};
use crate::remote::{RemoteOutcome, RemoteQueueProxy};
use crate::wire::request::{self, BrokerRequest, SESSION_ID_KEY};

pub const QUEUE_COUNT_KEY: &str = "queueCount";

/// Longest single wait forwarded to another manager before hang-up and shutdown are rechecked.
pub const REMOTE_GET_SLICE_MS: i64 = 500;

/// Handles one decoded request and builds the envelope to send back.
///
/// `cancelled` is probed while a get waits so a closed peer or a broker shutdown ends
/// the wait early.
pub fn dispatch(
    ctx: &BrokerContext,
    connection_id: u64,
    request: &MessageEnvelope,
    cancelled: &dyn Fn() -> bool,
) -> MessageEnvelope {
    let parsed = match BrokerRequest::parse(request) {
        Ok(parsed) => parsed,
        Err(error) => {
            ctx.logger.debug(
                Some("server::dispatch"),
                &format!("rejected malformed request on connection {connection_id}: {error}"),
            );
            return MessageEnvelope::reply_to(request, Response::error(error.to_string()));
        }
    };

    let session_user = ctx.sessions.authenticated_user(connection_id);
    let user = match (&session_user, parsed.requires_login()) {
        (Some(user), _) => user.clone(),
        (None, false) => String::new(),
        (None, true) => {
            return MessageEnvelope::reply_to(request, Response::fail("not logged in"));
        }
    };

    match parsed {
        BrokerRequest::Login {
            user,
            password,
            session_id,
        } => login(ctx, connection_id, request, &user, &password, session_id),
        BrokerRequest::DefineQueue {
            queue_name,
            threshold,
        } => {
            let response = match ctx.manager.define(&queue_name, threshold) {
                Ok(DefineOutcome::Created) => Response::ok(format!("queue {queue_name} defined")),
                Ok(DefineOutcome::AlreadyExists) => {
                    Response::warn(format!("queue {queue_name} already exists"))
                }
                Err(error @ ManagerError::InvalidName(_)) => Response::fail(error.to_string()),
                Err(error) => internal_error(ctx, "define", &error),
            };
            MessageEnvelope::reply_to(request, response)
        }
        BrokerRequest::DeleteQueue { queue_name, force } => {
            let response = match ctx.manager.delete(&queue_name, force) {
                Ok(DeleteOutcome::Deleted) => Response::ok(format!("queue {queue_name} deleted")),
                Ok(DeleteOutcome::NotEmpty { size }) => Response::fail(format!(
                    "queue {queue_name} is not empty ({size} messages)"
                )),
                Ok(DeleteOutcome::NotFound) => {
                    Response::warn(format!("queue {queue_name} not found"))
                }
                Err(error) => internal_error(ctx, "delete", &error),
            };
            MessageEnvelope::reply_to(request, response)
        }
        BrokerRequest::QueryQueue {
            pattern,
            is_prefix,
            include_all_data,
        } => query(ctx, request, &pattern, is_prefix, include_all_data),
        BrokerRequest::Get {
            queue_name,
            timeout_ms,
            poll_interval_ms,
        } => get(
            ctx,
            request,
            &user,
            &queue_name,
            ctx.effective_get_timeout(timeout_ms),
            ctx.effective_poll_interval(poll_interval_ms),
            cancelled,
        ),
        BrokerRequest::Shutdown {
            user: requested_by,
        } => {
            if requested_by != user {
                return MessageEnvelope::reply_to(
                    request,
                    Response::fail(format!("user {requested_by} is not the session user")),
                );
            }
            ctx.logger.log(
                LogLevel::Warn,
                Some("server::dispatch"),
                "Shutdown requested by client",
                Some(json!({ "user": user, "connection_id": connection_id })),
            );
            ctx.shutdown.trigger();
            MessageEnvelope::reply_to(request, Response::ok("shutdown initiated"))
        }
        BrokerRequest::SystemStateChange => MessageEnvelope::reply_to(
            request,
            Response::fail("system state change is unsupported"),
        ),
        BrokerRequest::Put { queue_name } => put(ctx, request, &user, &queue_name),
    }
}

fn login(
    ctx: &BrokerContext,
    connection_id: u64,
    request: &MessageEnvelope,
    user: &str,
    password: &str,
    session_id: Option<uuid::Uuid>,
) -> MessageEnvelope {
    if !ctx.config.auth.verify(user, password) {
        ctx.logger.warn(
            Some("server::dispatch"),
            &format!("login refused for user '{user}' on connection {connection_id}"),
        );
        return MessageEnvelope::reply_to(request, Response::fail("invalid user or password"));
    }

    let record = match ctx.sessions.mark_logged_in(connection_id, user, session_id) {
        Ok(record) => record,
        Err(error) => {
            return MessageEnvelope::reply_to(request, Response::error(error.to_string()));
        }
    };

    ctx.logger.log(
        LogLevel::Info,
        Some("server::dispatch"),
        if record.resumed {
            "Session resumed"
        } else {
            "User logged in"
        },
        Some(json!({
            "user": user,
            "connection_id": connection_id,
            "session_id": record.session_id.to_string()
        })),
    );

    let description = if record.resumed {
        format!("session {} resumed", record.session_id)
    } else {
        format!("user {user} logged in")
    };
    let mut reply = MessageEnvelope::reply_to(request, Response::ok(description));
    reply
        .properties
        .set_string(SESSION_ID_KEY, record.session_id.to_string());
    reply
}

fn query(
    ctx: &BrokerContext,
    request: &MessageEnvelope,
    pattern: &str,
    is_prefix: bool,
    include_all_data: bool,
) -> MessageEnvelope {
    let summaries = ctx.manager.query(pattern, is_prefix);
    if summaries.is_empty() {
        return MessageEnvelope::reply_to(
            request,
            Response::warn(format!("no queue matches '{pattern}'")),
        );
    }

    let mut reply = MessageEnvelope::reply_to(
        request,
        Response::ok(format!("{} queue(s) found", summaries.len())),
    );
    let props: &mut Properties = &mut reply.properties;
    props.set_int(QUEUE_COUNT_KEY, summaries.len() as i32);

    for (index, summary) in summaries.iter().enumerate() {
        let key = |field: &str| format!("queue.{index}.{field}");
        props.set_string(key("name"), summary.name.as_str());
        props.set_string(key("kind"), summary.kind());

        match &summary.location {
            QueueLocation::Local(stats) => {
                props.set_long(key("size"), stats.size as i64);
                if !include_all_data {
                    continue;
                }
                props.set_long(key("threshold"), stats.threshold as i64);
                for (priority, depth) in stats.depths.iter().enumerate() {
                    props.set_long(key(&format!("depth.{priority}")), *depth as i64);
                }
                if let Some(access) = &stats.last_access {
                    props.set_string(key("lastAccessUser"), access.user.as_str());
                    props.set_string(key("lastAccessTime"), access.timestamp.to_rfc3339());
                    props.set_string(key("lastAccessOperation"), access.operation.as_str());
                }
            }
            QueueLocation::Remote(route) => {
                props.set_long(key("size"), -1);
                if include_all_data {
                    props.set_string(key("manager"), route.manager.as_str());
                    props.set_string(key("host"), route.host.as_str());
                    props.set_int(key("port"), i32::from(route.port));
                }
            }
        }
    }

    reply
}

fn get(
    ctx: &BrokerContext,
    request: &MessageEnvelope,
    user: &str,
    queue_name: &str,
    timeout_ms: i64,
    poll_interval_ms: i64,
    cancelled: &dyn Fn() -> bool,
) -> MessageEnvelope {
    let outcome = match ctx.manager.resolve(queue_name) {
        QueueHandle::Local(store) => store
            .get_cancellable(user, timeout_ms, poll_interval_ms, || {
                cancelled() || ctx.shutdown.is_triggered()
            })
            .map_err(|error| Response::error(error.to_string())),
        QueueHandle::Remote(proxy) => {
            remote_get(ctx, &proxy, timeout_ms, poll_interval_ms, cancelled)
        }
        QueueHandle::NotFound => Err(Response::fail(format!("queue {queue_name} not found"))),
    };

    match outcome {
        Ok(Some(message)) => {
            let mut reply = request::delivery(message, request);
            reply.set_response(Some(Response::ok("message delivered")));
            reply
        }
        Ok(None) => MessageEnvelope::reply_to(
            request,
            Response::warn(format!("no message available on {queue_name}")),
        ),
        Err(response) => MessageEnvelope::reply_to(request, response),
    }
}

/// Remote waits run as a series of short remote gets so a hang-up or shutdown is noticed
/// between them. A timeout of 0 keeps slicing until cancelled.
fn remote_get(
    ctx: &BrokerContext,
    proxy: &RemoteQueueProxy,
    timeout_ms: i64,
    poll_interval_ms: i64,
    cancelled: &dyn Fn() -> bool,
) -> Result<Option<MessageEnvelope>, Response> {
    let deadline =
        (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

    loop {
        let slice_ms = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                (remaining.as_millis() as i64).clamp(1, REMOTE_GET_SLICE_MS)
            }
            None => REMOTE_GET_SLICE_MS,
        };

        match proxy.get(slice_ms, poll_interval_ms.min(slice_ms)) {
            Ok(RemoteOutcome::Completed(Some(message))) => return Ok(Some(message)),
            Ok(RemoteOutcome::Completed(None)) => {}
            Ok(RemoteOutcome::Refused(response)) => return Err(response),
            Err(error) => return Err(remote_failure(ctx, &error)),
        }

        let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if expired || cancelled() || ctx.shutdown.is_triggered() {
            return Ok(None);
        }
    }
}

fn put(
    ctx: &BrokerContext,
    request: &MessageEnvelope,
    user: &str,
    queue_name: &str,
) -> MessageEnvelope {
    let mut message = request.clone();
    message.set_response(None);

    let response = match ctx.manager.resolve(queue_name) {
        QueueHandle::Local(store) => {
            if store.put(message, user) {
                Response::ok(format!("message stored on {queue_name}"))
            } else {
                Response::fail(format!(
                    "queue {queue_name} threshold of {} exceeded",
                    store.threshold()
                ))
            }
        }
        QueueHandle::Remote(proxy) => match proxy.put(message) {
            Ok(response) => response,
            Err(error) => remote_failure(ctx, &error),
        },
        QueueHandle::NotFound => Response::fail(format!("queue {queue_name} not found")),
    };
    MessageEnvelope::reply_to(request, response)
}

fn remote_failure(ctx: &BrokerContext, error: &dyn std::error::Error) -> Response {
    ctx.logger
        .warn(Some("server::dispatch"), &format!("remote operation failed: {error}"));
    Response::error(error.to_string())
}

fn internal_error(ctx: &BrokerContext, operation: &str, error: &ManagerError) -> Response {
    ctx.logger.error(
        Some("server::dispatch"),
        &format!("{operation} failed: {error}"),
    );
    Response::error(error.to_string())
}
