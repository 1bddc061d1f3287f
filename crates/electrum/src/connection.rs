//! Per-client protocol state machine and serve loop.
//!
//! A connection starts with only `server.ping` and `server.version`
//! registered. A successful `server.version` negotiates the protocol and
//! registers the blockchain methods; from then on the client may
//! subscribe to addresses and receives unsolicited status notifications.
//! A keepalive timer, reset on every request, closes idle clients.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crest_types::{Explorer, TransactionPool, UnlockHash};

use crate::error::RpcError;
use crate::jsonrpc::{encode_responses, BatchRequest, Notification, Params, Request, Response};
use crate::status;
use crate::subscriptions::{SubscriberHub, Update};
use crate::transport::{MessageSink, MessageSource, Transport};
use crate::version::{VersionRange, SERVER_PROTOCOL_VERSION, SERVER_SOFTWARE_VERSION};

/// Everything a connection needs from the server.
pub(crate) struct ServeContext {
    pub explorer: Arc<dyn Explorer>,
    pub pool: Arc<dyn TransactionPool>,
    pub hub: Arc<SubscriberHub>,
    pub keepalive: Duration,
    pub cancellation: CancellationToken,
    pub tracker: TaskTracker,
    /// Peer label for logs.
    pub peer: String,
}

/// Methods servable on a connection. The map starts minimal and grows
/// once the protocol version is negotiated.
#[derive(Debug, Clone, Copy)]
enum Service {
    Ping,
    Version,
    AddressSubscribe,
}

enum Outcome {
    Reply(Value),
    Fail(RpcError),
    /// Respond with the error, then close the connection.
    Fatal(RpcError),
}

struct Negotiated {
    #[allow(dead_code)]
    client_name: String,
}

pub(crate) struct Connection {
    explorer: Arc<dyn Explorer>,
    pool: Arc<dyn TransactionPool>,
    services: HashMap<String, Service>,
    subscriptions: HashSet<UnlockHash>,
    negotiated: Option<Negotiated>,
}

impl Connection {
    pub(crate) fn new(explorer: Arc<dyn Explorer>, pool: Arc<dyn TransactionPool>) -> Self {
        let mut services = HashMap::new();
        services.insert("server.ping".to_owned(), Service::Ping);
        services.insert("server.version".to_owned(), Service::Version);

        Self {
            explorer,
            pool,
            services,
            subscriptions: HashSet::new(),
            negotiated: None,
        }
    }

    /// Handle one raw inbound message. Returns the bytes to write back
    /// (if any) and whether the connection must close afterwards.
    pub(crate) async fn process(&mut self, raw: &str) -> (Option<String>, bool) {
        let batch = match BatchRequest::decode(raw) {
            Ok(batch) => batch,
            Err(err) => {
                let response = Response::error(Value::Null, err);
                return (
                    Some(serde_json::to_string(&response).expect("response always serializes")),
                    false,
                );
            }
        };

        let mut fatal = false;
        let mut responses = Vec::with_capacity(batch.requests.len());
        for request in &batch.requests {
            if fatal {
                // The connection is going down; later entries get no
                // answer.
                responses.push(None);
                continue;
            }

            let outcome = self.dispatch(request).await;
            let response = match outcome {
                Outcome::Reply(value) => request
                    .id
                    .clone()
                    .map(|id| Response::result(id, value)),
                Outcome::Fail(err) => request.id.clone().map(|id| Response::error(id, err)),
                Outcome::Fatal(err) => {
                    fatal = true;
                    request.id.clone().map(|id| Response::error(id, err))
                }
            };
            responses.push(response);
        }

        (encode_responses(responses, batch.is_batch), fatal)
    }

    async fn dispatch(&mut self, request: &Request) -> Outcome {
        let Some(service) = self.services.get(&request.method).copied() else {
            return Outcome::Fail(RpcError::method_not_found(&request.method));
        };
        trace!("dispatching {}", request.method);

        match service {
            Service::Ping => Outcome::Reply(Value::Null),
            Service::Version => self.server_version(&request.params),
            Service::AddressSubscribe => self.address_subscribe(&request.params).await,
        }
    }

    fn server_version(&mut self, params: &Params) -> Outcome {
        if self.negotiated.is_some() {
            return Outcome::Fatal(RpcError::version_already_set());
        }

        let args = match params.positional() {
            Ok(args) => args,
            Err(err) => return Outcome::Fail(err),
        };
        if args.len() != 2 {
            return Outcome::Fail(RpcError::invalid_params(
                "server.version takes a client name and a protocol argument",
            ));
        }
        let client_name = match args[0].as_str() {
            Some(name) => name.to_owned(),
            None => return Outcome::Fail(RpcError::invalid_params("client name must be a string")),
        };
        let range = match VersionRange::from_param(&args[1]) {
            Ok(range) => range,
            Err(err) => return Outcome::Fail(err),
        };

        if !range.contains(SERVER_PROTOCOL_VERSION) {
            return Outcome::Fatal(RpcError::unsupported_protocol());
        }

        self.negotiated = Some(Negotiated { client_name });
        self.services.insert(
            "blockchain.address.subscribe".to_owned(),
            Service::AddressSubscribe,
        );

        Outcome::Reply(json!([
            SERVER_SOFTWARE_VERSION,
            SERVER_PROTOCOL_VERSION.to_string()
        ]))
    }

    async fn address_subscribe(&mut self, params: &Params) -> Outcome {
        let args = match params.positional() {
            Ok(args) => args,
            Err(err) => return Outcome::Fail(err),
        };
        if args.len() != 1 {
            return Outcome::Fail(RpcError::invalid_params(
                "blockchain.address.subscribe takes one address",
            ));
        }
        let address: UnlockHash = match args[0].as_str().map(str::parse) {
            Some(Ok(address)) => address,
            _ => return Outcome::Fail(RpcError::invalid_params("unparseable address")),
        };

        if self.subscriptions.contains(&address) {
            return Outcome::Fail(RpcError::already_subscribed());
        }

        match status::address_status(self.explorer.as_ref(), self.pool.as_ref(), &address).await
        {
            Ok(current) => {
                self.subscriptions.insert(address);
                Outcome::Reply(Value::String(current))
            }
            Err(err) => Outcome::Fail(err.into()),
        }
    }

    /// Notifications this connection owes its client for `update`: the
    /// intersection of the update with the subscription set. Nothing is
    /// emitted before the protocol version is negotiated.
    pub(crate) fn notifications_for(&self, update: &Update) -> Vec<String> {
        if self.negotiated.is_none() {
            return Vec::new();
        }

        update
            .address_states
            .iter()
            .filter(|(address, _)| self.subscriptions.contains(address))
            .map(|(address, state)| {
                Notification::new(
                    "blockchain.address.subscribe",
                    json!({"address": address.to_string(), "status": state}),
                )
                .encode()
            })
            .collect()
    }
}

/// Serve one client until it disconnects, idles out, lags behind the
/// update fan-out, or the server shuts down.
pub(crate) async fn serve<T: Transport>(transport: T, ctx: ServeContext) {
    let (source, mut sink) = transport.split();

    let transport_closed = CancellationToken::new();
    let (request_tx, request_rx) = flume::bounded::<String>(16);
    ctx.tracker.spawn(run_reader(
        source,
        request_tx,
        transport_closed.clone(),
        ctx.peer.clone(),
    ));

    let (subscriber_id, update_rx, desync) = ctx.hub.register();
    let mut connection = Connection::new(ctx.explorer.clone(), ctx.pool.clone());

    let keepalive = tokio::time::sleep(ctx.keepalive);
    tokio::pin!(keepalive);

    'serve: loop {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => break,
            _ = transport_closed.cancelled() => {
                trace!("{}: transport closed", ctx.peer);
                break;
            }
            _ = desync.cancelled() => {
                debug!("{}: desynchronised, closing", ctx.peer);
                break;
            }
            _ = &mut keepalive => {
                debug!("{}: keepalive expired", ctx.peer);
                break;
            }
            res = request_rx.recv_async() => {
                let Ok(raw) = res else { break };
                keepalive.as_mut().reset(Instant::now() + ctx.keepalive);

                let (reply, fatal) = connection.process(&raw).await;
                if let Some(text) = reply {
                    if let Err(err) = sink.send_message(text).await {
                        debug!("{}: write failed: {err}", ctx.peer);
                        break;
                    }
                }
                if fatal {
                    debug!("{}: fatal protocol error, closing", ctx.peer);
                    break;
                }
            }
            res = update_rx.recv_async() => {
                let Ok(update) = res else { break };
                for text in connection.notifications_for(&update) {
                    if let Err(err) = sink.send_message(text).await {
                        debug!("{}: write failed: {err}", ctx.peer);
                        break 'serve;
                    }
                }
            }
        }
    }

    ctx.hub.unregister(subscriber_id);
    transport_closed.cancel();
}

async fn run_reader<S: MessageSource>(
    mut source: S,
    request_tx: flume::Sender<String>,
    closed: CancellationToken,
    peer: String,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            res = source.next_message() => match res {
                Ok(Some(message)) => {
                    if request_tx.send_async(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("{peer}: transport read failed: {err}");
                    break;
                }
            },
        }
    }
    closed.cancel();
}
