//! The user-facing connection handle.
//!
//! A [`Connection`] is a cheap clone over an unbounded request channel;
//! the driver task on the other end owns the socket and all
//! per-connection state. Handles issue commands, subscriptions and
//! transactions and await per-request oneshot responders.

use crate::cache::{ClientCache, INVALIDATION_CHANNEL};
use crate::cmd::{cmd, Cmd};
use crate::config::Config;
use crate::driver::{CommandFlags, Driver, Request};
use crate::parser::ValueCodec;
use crate::subscription::{MessageStream, SubscriptionKind};
use crate::transaction::MultiHandle;
use crate::types::{ErrorKind, ProtocolVersion, RedisError, RedisResult, ToRedisArgs, Value};
use arc_swap::ArcSwap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio_util::codec::Framed;
use tracing::{info_span, Instrument};

/// Lifecycle events emitted on the connection's event sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The socket connected and the handshake completed.
    Connected {
        /// Local endpoint of the socket.
        local_addr: SocketAddr,
        /// Remote endpoint of the socket.
        peer_addr: SocketAddr,
    },
    /// The stream closed; every outstanding request was failed and all
    /// subscription sinks were shut.
    Disconnected,
}

/// Swappable slot holding the event sink, shared between handles and
/// the driver.
pub(crate) type EventSink = Arc<ArcSwap<Option<mpsc::UnboundedSender<ConnectionEvent>>>>;

/// How client-side cache invalidations reach this connection.
enum CacheChannel {
    /// RESP3: invalidation push frames arrive inline on this
    /// connection.
    Shared,
    /// RESP2: an owned sibling connection subscribed to
    /// `__redis__:invalidate` feeds the cache. Held so the subscription
    /// outlives cache use.
    Sibling { _connection: Connection },
}

/// An asynchronous connection to a Redis server.
///
/// Cloning is cheap and clones share the underlying connection, its
/// pipeline and its subscriptions.
#[derive(Clone)]
pub struct Connection {
    sender: mpsc::UnboundedSender<Request>,
    protocol: ProtocolVersion,
    opentracing: bool,
    cache: Option<Arc<ClientCache>>,
    cache_channel: Arc<OnceCell<CacheChannel>>,
    config: Arc<Config>,
    events: EventSink,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl Connection {
    /// Connects to the configured server and negotiates the protocol
    /// level with `HELLO 3`, falling back to RESP2 plus explicit
    /// `AUTH`/`CLIENT SETNAME` when the server predates `HELLO`.
    pub async fn connect(config: Config) -> RedisResult<Connection> {
        Self::connect_with_invalidation_target(config, None).await
    }

    /// Connects a URI-configured connection; see [`Config::from_uri`].
    pub async fn connect_uri(uri: &str) -> RedisResult<Connection> {
        Self::connect(Config::from_uri(uri)?).await
    }

    async fn connect_with_invalidation_target(
        config: Config,
        invalidation_target: Option<Arc<ClientCache>>,
    ) -> RedisResult<Connection> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let mut framed =
            Framed::with_capacity(stream, ValueCodec::default(), config.stream_read_len);
        framed.set_backpressure_boundary(config.stream_write_len);

        let events: EventSink = Arc::new(ArcSwap::new(Arc::new(config.events.clone())));
        let cache = (config.client_side_cache_size > 0)
            .then(|| Arc::new(ClientCache::new(config.client_side_cache_size)));
        // A sibling connection evicts its parent's cache, a main RESP3
        // connection its own.
        let invalidation_cache = invalidation_target.or_else(|| cache.clone());

        let (sender, requests) = mpsc::unbounded_channel();
        let driver = Driver::new(
            framed,
            requests,
            config.pipeline_depth,
            invalidation_cache,
            events.clone(),
        );
        tokio::spawn(driver.run());

        let mut connection = Connection {
            sender,
            protocol: ProtocolVersion::Resp3,
            opentracing: config.opentracing,
            cache,
            cache_channel: Arc::new(OnceCell::new()),
            config: Arc::new(config),
            events,
            local_addr,
            peer_addr,
        };

        let protocol = connection.negotiate().await?;
        connection.protocol = protocol;
        connection.send_request(Request::SetProtocol(protocol))?;

        if connection.config.database != 0 {
            let mut select = cmd("SELECT");
            select.arg(connection.config.database);
            match connection.execute_internal(select).await? {
                Value::Okay => {}
                _ => fail!((ErrorKind::Redis, "server refused to switch database")),
            }
        }

        let guard = connection.events.load();
        if let Some(events) = guard.as_ref() {
            let _ = events.send(ConnectionEvent::Connected {
                local_addr,
                peer_addr,
            });
        }
        drop(guard);

        Ok(connection)
    }

    async fn negotiate(&self) -> RedisResult<ProtocolVersion> {
        let mut hello = cmd("HELLO");
        hello.arg(3);
        if let Some(auth) = &self.config.auth {
            hello.arg("AUTH").arg("default").arg(auth.as_str());
        }
        if let Some(name) = &self.config.client_name {
            hello.arg("SETNAME").arg(name.as_str());
        }
        match self.execute_internal(hello).await {
            Ok(_) => Ok(ProtocolVersion::Resp3),
            Err(err) if err.is_unknown_command() => {
                if let Some(auth) = &self.config.auth {
                    let mut auth_cmd = cmd("AUTH");
                    auth_cmd.arg(auth.as_str());
                    self.execute_internal(auth_cmd).await?;
                }
                if let Some(name) = &self.config.client_name {
                    let mut setname = cmd("CLIENT");
                    setname.arg("SETNAME").arg(name.as_str());
                    self.execute_internal(setname).await?;
                }
                Ok(ProtocolVersion::Resp2)
            }
            Err(err) => Err(err),
        }
    }

    /// The protocol level fixed by the handshake.
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Local endpoint of the underlying socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote endpoint of the underlying socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Replaces the connection's event sink.
    pub fn set_event_sender(&self, sender: mpsc::UnboundedSender<ConnectionEvent>) {
        self.events.store(Arc::new(Some(sender)));
    }

    /// Sends one command and resolves with its reply.
    ///
    /// This is the uniform entry point every typed wrapper is sugar
    /// over. Replies pair with requests strictly first-in first-out;
    /// when the pipeline bound is reached the command is parked and
    /// written once earlier replies drain.
    pub async fn execute(&self, command: Cmd) -> RedisResult<Value> {
        self.execute_with_flags(command, CommandFlags::default())
            .await
    }

    pub(crate) async fn execute_with_flags(
        &self,
        command: Cmd,
        flags: CommandFlags,
    ) -> RedisResult<Value> {
        if self.opentracing {
            let span = info_span!("redis.command", command = %command.label());
            self.request(command, flags).instrument(span).await
        } else {
            self.request(command, flags).await
        }
    }

    async fn execute_internal(&self, command: Cmd) -> RedisResult<Value> {
        self.execute_with_flags(
            command,
            CommandFlags {
                internal: true,
                queued: false,
            },
        )
        .await
    }

    async fn request(&self, command: Cmd, flags: CommandFlags) -> RedisResult<Value> {
        let (responder, receiver) = oneshot::channel();
        self.send_request(Request::Command {
            cmd: command,
            flags,
            responder,
        })?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(RedisError::disconnected()),
        }
    }

    /// Queues a command inside an open MULTI without awaiting; used by
    /// the transaction handle.
    pub(crate) fn queue_command(&self, command: Cmd) -> impl Future<Output = RedisResult<Value>> {
        let (responder, receiver) = oneshot::channel();
        let sent = self.send_request(Request::Command {
            cmd: command,
            flags: CommandFlags {
                internal: true,
                queued: true,
            },
            responder,
        });
        async move {
            sent?;
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(RedisError::disconnected()),
            }
        }
    }

    pub(crate) fn send_request(&self, request: Request) -> RedisResult<()> {
        self.sender
            .send(request)
            .map_err(|_| RedisError::disconnected())
    }

    /// Subscribes to the given channels, returning one message stream
    /// per channel. Resolves once the server has acknowledged every
    /// subscription.
    pub async fn subscribe<I, S>(&self, channels: I) -> RedisResult<Vec<MessageStream>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_inner(SubscriptionKind::Channel, channels)
            .await
    }

    /// Subscribes to the given patterns; see [`Connection::subscribe`].
    pub async fn psubscribe<I, S>(&self, patterns: I) -> RedisResult<Vec<MessageStream>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_inner(SubscriptionKind::Pattern, patterns)
            .await
    }

    async fn subscribe_inner<I, S>(
        &self,
        kind: SubscriptionKind,
        names: I,
    ) -> RedisResult<Vec<MessageStream>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = Vec::new();
        let mut streams = Vec::new();
        for name in names {
            let (sender, receiver) = mpsc::unbounded_channel();
            entries.push((name.into(), sender));
            streams.push(MessageStream::new(receiver));
        }
        let (responder, receiver) = oneshot::channel();
        self.send_request(Request::Subscribe {
            kind,
            entries,
            responder,
        })?;
        match receiver.await {
            Ok(Ok(())) => Ok(streams),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RedisError::disconnected()),
        }
    }

    /// Unsubscribes from the given channels. The matching message
    /// streams end once the server acknowledges.
    pub async fn unsubscribe<I, S>(&self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unsubscribe_inner(SubscriptionKind::Channel, channels)
            .await
    }

    /// Unsubscribes from the given patterns.
    pub async fn punsubscribe<I, S>(&self, patterns: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unsubscribe_inner(SubscriptionKind::Pattern, patterns)
            .await
    }

    async fn unsubscribe_inner<I, S>(&self, kind: SubscriptionKind, names: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect();
        let (responder, receiver) = oneshot::channel();
        self.send_request(Request::Unsubscribe {
            kind,
            names,
            responder,
        })?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(RedisError::disconnected()),
        }
    }

    /// Runs `body` inside a MULTI/EXEC transaction.
    ///
    /// Sessions on one connection serialize strictly first-come
    /// first-served; commands issued outside the body are deferred
    /// until every pending session finished. Each command queued by the
    /// body resolves with its element of the `EXEC` array. Returns the
    /// `(successes, failures)` counts over the queued commands.
    ///
    /// If the body fails, the transaction is discarded and every queued
    /// future fails with the discard error.
    pub async fn multi<F, Fut, T>(&self, body: F) -> RedisResult<(usize, usize)>
    where
        F: FnOnce(MultiHandle) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let (granted, grant) = oneshot::channel();
        self.send_request(Request::BeginMulti { granted })?;
        match grant.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(RedisError::disconnected()),
        }

        // The receiver stays alive until the session ends so the MULTI
        // write is not discarded as cancelled.
        let (responder, _multi_reply) = oneshot::channel();
        if let Err(err) = self.send_request(Request::Command {
            cmd: cmd("MULTI"),
            flags: CommandFlags {
                internal: true,
                queued: false,
            },
            responder,
        }) {
            let _ = self.send_request(Request::EndMulti);
            return Err(err);
        }

        let body_result = body(MultiHandle::new(self.clone())).await;
        let outcome = match body_result {
            Ok(_) => {
                let (responder, receiver) = oneshot::channel();
                match self.send_request(Request::ExecMulti { responder }) {
                    Ok(()) => match receiver.await {
                        Ok(result) => result,
                        Err(_) => Err(RedisError::disconnected()),
                    },
                    Err(err) => Err(err),
                }
            }
            Err(err) => {
                let (responder, receiver) = oneshot::channel();
                if self.send_request(Request::DiscardMulti { responder }).is_ok() {
                    let _ = receiver.await;
                }
                Err(err)
            }
        };
        let _ = self.send_request(Request::EndMulti);
        outcome
    }

    /// `GET`, consulting the client-side cache when one is configured.
    ///
    /// A cached reply is returned without touching the server; a miss
    /// performs the server `GET` and stores the reply until it is
    /// invalidated or evicted.
    pub async fn get<K: ToRedisArgs>(&self, key: K) -> RedisResult<Value> {
        let mut args = Vec::new();
        key.write_redis_args(&mut args);
        let mut command = cmd("GET");
        for arg in &args {
            command.arg(arg.as_slice());
        }

        let Some(cache) = &self.cache else {
            return self.execute(command).await;
        };
        let [key_bytes] = args.as_slice() else {
            return self.execute(command).await;
        };
        let key_bytes = key_bytes.clone();

        self.ensure_cache_channel().await?;
        if let Some(value) = cache.lookup(&key_bytes) {
            return Ok(value);
        }
        let reply = self.execute(command).await?;
        cache.store(key_bytes, reply.clone());
        Ok(reply)
    }

    /// `KEYS`, defaulting the pattern to `*`.
    pub async fn keys<P: ToRedisArgs>(&self, pattern: Option<P>) -> RedisResult<Value> {
        let mut command = cmd("KEYS");
        match pattern {
            Some(pattern) => {
                command.arg(pattern);
            }
            None => {
                command.arg("*");
            }
        }
        self.execute(command).await
    }

    async fn ensure_cache_channel(&self) -> RedisResult<()> {
        self.cache_channel
            .get_or_try_init(|| self.init_cache_channel())
            .await
            .map(|_| ())
    }

    /// First cached `GET`: wire up the invalidation channel. On RESP3
    /// the pushes arrive inline; on RESP2 an owned sibling connection
    /// subscribes to the invalidation channel and the server redirects
    /// tracking notifications at it.
    async fn init_cache_channel(&self) -> RedisResult<CacheChannel> {
        match self.protocol {
            ProtocolVersion::Resp3 => {
                let mut tracking = cmd("CLIENT");
                tracking.arg("TRACKING").arg("ON");
                match self.execute_internal(tracking).await? {
                    Value::Okay => Ok(CacheChannel::Shared),
                    other => fail!((
                        ErrorKind::Protocol,
                        "unexpected CLIENT TRACKING reply",
                        format!("{other:?}")
                    )),
                }
            }
            ProtocolVersion::Resp2 => {
                let mut sibling_config = (*self.config).clone();
                sibling_config.client_side_cache_size = 0;
                sibling_config.events = None;
                let sibling = Connection::connect_with_invalidation_target(
                    sibling_config,
                    self.cache.clone(),
                )
                .await?;

                let mut client_id = cmd("CLIENT");
                client_id.arg("ID");
                let id = match sibling.execute_internal(client_id).await? {
                    Value::Int(id) => id,
                    other => fail!((
                        ErrorKind::Protocol,
                        "unexpected CLIENT ID reply",
                        format!("{other:?}")
                    )),
                };
                // The sibling's driver feeds invalidation payloads
                // straight into the shared cache; the returned streams
                // are not needed.
                sibling.subscribe([INVALIDATION_CHANNEL]).await?;

                let mut tracking = cmd("CLIENT");
                tracking
                    .arg("TRACKING")
                    .arg("ON")
                    .arg("REDIRECT")
                    .arg(id);
                match self.execute_internal(tracking).await? {
                    Value::Okay => Ok(CacheChannel::Sibling {
                        _connection: sibling,
                    }),
                    other => fail!((
                        ErrorKind::Protocol,
                        "unexpected CLIENT TRACKING reply",
                        format!("{other:?}")
                    )),
                }
            }
        }
    }
}
