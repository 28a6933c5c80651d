//! The per-connection driver task.
//!
//! The driver exclusively owns the framed byte stream and every piece of
//! per-connection state: the pending FIFO, the pipeline admission queue,
//! the pub/sub registry and the MULTI serializer. Handles talk to it
//! through an unbounded request channel; replies travel back over
//! per-request oneshots. All state is therefore touched from a single
//! task.

use crate::cache::{ClientCache, INVALIDATION_CHANNEL};
use crate::cmd::{cmd, Cmd};
use crate::connection::{ConnectionEvent, EventSink};
use crate::parser::ValueCodec;
use crate::subscription::{Message, MessageKind, Subscription, SubscriptionKind};
use crate::types::{ErrorKind, ProtocolVersion, PushKind, RedisError, RedisResult, Value};
use futures_util::{SinkExt, StreamExt};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

pub(crate) type Responder = oneshot::Sender<RedisResult<Value>>;

/// Commands a connection may still issue on RESP2 while subscriptions
/// are active.
const SUBSCRIBER_MODE_COMMANDS: &[&str] = &[
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "UNSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
];

const SUBSCRIPTION_COMMANDS: &[&str] =
    &["SUBSCRIBE", "PSUBSCRIBE", "UNSUBSCRIBE", "PUNSUBSCRIBE"];

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CommandFlags {
    /// Internal to an active MULTI session: exempt from barrier
    /// deferral and the subscriber-mode gate.
    pub(crate) internal: bool,
    /// Queued inside a MULTI body: the reply is the matching element of
    /// the `EXEC` array, not the immediate `+QUEUED`.
    pub(crate) queued: bool,
}

pub(crate) enum Request {
    Command {
        cmd: Cmd,
        flags: CommandFlags,
        responder: Responder,
    },
    Subscribe {
        kind: SubscriptionKind,
        entries: Vec<(String, mpsc::UnboundedSender<Message>)>,
        responder: oneshot::Sender<RedisResult<()>>,
    },
    Unsubscribe {
        kind: SubscriptionKind,
        names: Vec<String>,
        responder: oneshot::Sender<RedisResult<()>>,
    },
    BeginMulti {
        granted: oneshot::Sender<RedisResult<()>>,
    },
    ExecMulti {
        responder: oneshot::Sender<RedisResult<(usize, usize)>>,
    },
    DiscardMulti {
        responder: Responder,
    },
    EndMulti,
    SetProtocol(ProtocolVersion),
}

/// What to do with the reply that resolves a pending entry.
enum PendingKind {
    /// Resolve the caller's future directly.
    Normal(Responder),
    /// The reply is `+QUEUED`; park the future until `EXEC` distributes
    /// its array.
    Queued(Responder),
    /// The `EXEC` reply: distribute and report counts.
    Exec(oneshot::Sender<RedisResult<(usize, usize)>>),
}

impl PendingKind {
    fn is_closed(&self) -> bool {
        match self {
            PendingKind::Normal(tx) | PendingKind::Queued(tx) => tx.is_closed(),
            PendingKind::Exec(tx) => tx.is_closed(),
        }
    }

    fn fail(self, err: RedisError) {
        match self {
            PendingKind::Normal(tx) | PendingKind::Queued(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingKind::Exec(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

struct PendingEntry {
    label: String,
    kind: PendingKind,
}

struct PendingSubscribe {
    wait_id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

/// Tracks one subscribe/unsubscribe call until every requested name has
/// been acknowledged.
struct AckWait {
    remaining: usize,
    responder: oneshot::Sender<RedisResult<()>>,
}

#[derive(Default)]
struct MultiState {
    active: bool,
    discarding: bool,
    waiters: VecDeque<oneshot::Sender<RedisResult<()>>>,
    queued: VecDeque<Responder>,
    deferred: VecDeque<Request>,
}

impl MultiState {
    fn holds_barrier(&self) -> bool {
        self.active || !self.waiters.is_empty()
    }
}

pub(crate) struct Driver {
    framed: Framed<TcpStream, ValueCodec>,
    requests: mpsc::UnboundedReceiver<Request>,
    protocol: ProtocolVersion,
    pipeline_depth: usize,
    pending: VecDeque<PendingEntry>,
    awaiting_pipeline: VecDeque<(Cmd, PendingKind)>,
    by_channel: HashMap<String, Subscription>,
    by_pattern: HashMap<String, Subscription>,
    channel_count: usize,
    pattern_count: usize,
    pending_subscribes: HashMap<(SubscriptionKind, String), VecDeque<PendingSubscribe>>,
    pending_unsubscribes: HashMap<(SubscriptionKind, String), VecDeque<u64>>,
    waits: HashMap<u64, AckWait>,
    next_wait_id: u64,
    multi: MultiState,
    invalidation_cache: Option<Arc<ClientCache>>,
    events: EventSink,
}

impl Driver {
    pub(crate) fn new(
        framed: Framed<TcpStream, ValueCodec>,
        requests: mpsc::UnboundedReceiver<Request>,
        pipeline_depth: usize,
        invalidation_cache: Option<Arc<ClientCache>>,
        events: EventSink,
    ) -> Driver {
        Driver {
            framed,
            requests,
            protocol: ProtocolVersion::Resp3,
            pipeline_depth,
            pending: VecDeque::new(),
            awaiting_pipeline: VecDeque::new(),
            by_channel: HashMap::new(),
            by_pattern: HashMap::new(),
            channel_count: 0,
            pattern_count: 0,
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            waits: HashMap::new(),
            next_wait_id: 0,
            multi: MultiState::default(),
            invalidation_cache,
            events,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Some(err) = self.drive().await {
            debug!(error = %err, "connection driver stopping");
        }
        self.teardown().await;
    }

    /// Processes requests and inbound frames until the stream or the
    /// request channel goes away.
    async fn drive(&mut self) -> Option<RedisError> {
        loop {
            tokio::select! {
                biased;
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if let Err(err) = self.handle_request(request).await {
                            return Some(err);
                        }
                    }
                    // Every handle is gone; nobody is left to observe
                    // replies.
                    None => return None,
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(value)) => {
                        if let Err(err) = self.dispatch(value).await {
                            return Some(err);
                        }
                    }
                    Some(Err(err)) => return Some(err),
                    None => return Some(RedisError::disconnected()),
                },
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> RedisResult<()> {
        match request {
            Request::Command {
                cmd,
                flags,
                responder,
            } => self.handle_command(cmd, flags, responder).await,
            Request::Subscribe {
                kind,
                entries,
                responder,
            } => self.handle_subscribe(kind, entries, responder).await,
            Request::Unsubscribe {
                kind,
                names,
                responder,
            } => self.handle_unsubscribe(kind, names, responder).await,
            Request::BeginMulti { granted } => {
                self.handle_begin_multi(granted);
                Ok(())
            }
            Request::ExecMulti { responder } => {
                self.submit(cmd("EXEC"), PendingKind::Exec(responder)).await
            }
            Request::DiscardMulti { responder } => {
                self.multi.discarding = true;
                let err = discard_error();
                for queued in self.multi.queued.drain(..) {
                    let _ = queued.send(Err(err.clone()));
                }
                self.submit(cmd("DISCARD"), PendingKind::Normal(responder))
                    .await
            }
            Request::EndMulti => self.handle_end_multi().await,
            Request::SetProtocol(protocol) => {
                self.protocol = protocol;
                Ok(())
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: Cmd,
        flags: CommandFlags,
        responder: Responder,
    ) -> RedisResult<()> {
        let name = cmd.name();

        if !flags.internal
            && self.protocol == ProtocolVersion::Resp2
            && self.subscriber_mode()
            && !SUBSCRIBER_MODE_COMMANDS.contains(&name.as_str())
        {
            let _ = responder.send(Err(RedisError::subscriber_lockout(
                &name,
                self.channel_count,
                self.pattern_count,
            )));
            return Ok(());
        }

        // Replies for subscription commands are delivered through the
        // subscription path and would never resolve a pending entry.
        if SUBSCRIPTION_COMMANDS.contains(&name.as_str()) {
            let _ = responder.send(Err(RedisError::from((
                ErrorKind::Usage,
                "subscription commands must go through the subscribe/unsubscribe API",
            ))));
            return Ok(());
        }

        if self.multi.holds_barrier() && !flags.internal {
            self.multi.deferred.push_back(Request::Command {
                cmd,
                flags,
                responder,
            });
            return Ok(());
        }

        let kind = if flags.queued {
            PendingKind::Queued(responder)
        } else {
            PendingKind::Normal(responder)
        };
        self.submit(cmd, kind).await
    }

    /// Writes the command or parks it until the pipeline drains.
    async fn submit(&mut self, cmd: Cmd, kind: PendingKind) -> RedisResult<()> {
        if self.pipeline_depth > 0 && self.pending.len() >= self.pipeline_depth {
            self.awaiting_pipeline.push_back((cmd, kind));
            return Ok(());
        }
        self.write_command(cmd, kind).await
    }

    async fn write_command(&mut self, cmd: Cmd, kind: PendingKind) -> RedisResult<()> {
        let label = cmd.label();
        match self.framed.send(cmd.get_packed_command()).await {
            Ok(()) => {
                self.pending.push_back(PendingEntry { label, kind });
                Ok(())
            }
            Err(err) => {
                kind.fail(err.clone());
                Err(err)
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        kind: SubscriptionKind,
        entries: Vec<(String, mpsc::UnboundedSender<Message>)>,
        responder: oneshot::Sender<RedisResult<()>>,
    ) -> RedisResult<()> {
        if entries.is_empty() {
            let _ = responder.send(Ok(()));
            return Ok(());
        }
        if self.multi.holds_barrier() {
            self.multi.deferred.push_back(Request::Subscribe {
                kind,
                entries,
                responder,
            });
            return Ok(());
        }

        let wait_id = self.new_wait(entries.len(), responder);
        let mut cmd = Cmd::new();
        cmd.arg(kind.subscribe_command());
        for (name, sender) in entries {
            cmd.arg(name.as_str());
            self.pending_subscribes
                .entry((kind, name))
                .or_default()
                .push_back(PendingSubscribe { wait_id, sender });
        }
        // Written, but intentionally not appended to `pending`: the acks
        // come back through the subscription path on both protocol
        // levels.
        self.framed.send(cmd.get_packed_command()).await
    }

    async fn handle_unsubscribe(
        &mut self,
        kind: SubscriptionKind,
        names: Vec<String>,
        responder: oneshot::Sender<RedisResult<()>>,
    ) -> RedisResult<()> {
        if names.is_empty() {
            let _ = responder.send(Ok(()));
            return Ok(());
        }
        if self.multi.holds_barrier() {
            self.multi.deferred.push_back(Request::Unsubscribe {
                kind,
                names,
                responder,
            });
            return Ok(());
        }

        let wait_id = self.new_wait(names.len(), responder);
        let mut cmd = Cmd::new();
        cmd.arg(kind.unsubscribe_command());
        for name in names {
            cmd.arg(name.as_str());
            self.pending_unsubscribes
                .entry((kind, name))
                .or_default()
                .push_back(wait_id);
        }
        self.framed.send(cmd.get_packed_command()).await
    }

    fn handle_begin_multi(&mut self, granted: oneshot::Sender<RedisResult<()>>) {
        if self.protocol == ProtocolVersion::Resp2 && self.subscriber_mode() {
            let _ = granted.send(Err(RedisError::subscriber_lockout(
                "MULTI",
                self.channel_count,
                self.pattern_count,
            )));
            return;
        }
        if self.multi.holds_barrier() {
            self.multi.waiters.push_back(granted);
        } else {
            self.multi.active = true;
            let _ = granted.send(Ok(()));
        }
    }

    async fn handle_end_multi(&mut self) -> RedisResult<()> {
        self.multi.active = false;
        self.multi.discarding = false;
        self.multi.queued.clear();

        while let Some(next) = self.multi.waiters.pop_front() {
            if next.send(Ok(())).is_ok() {
                self.multi.active = true;
                return Ok(());
            }
            // That session's caller is gone; try its successor.
        }

        let deferred = std::mem::take(&mut self.multi.deferred);
        for request in deferred {
            // Deferred requests cannot re-defer here: no session is
            // active or waiting anymore.
            match request {
                Request::Command {
                    cmd,
                    flags,
                    responder,
                } => self.handle_command(cmd, flags, responder).await?,
                Request::Subscribe {
                    kind,
                    entries,
                    responder,
                } => self.handle_subscribe(kind, entries, responder).await?,
                Request::Unsubscribe {
                    kind,
                    names,
                    responder,
                } => self.handle_unsubscribe(kind, names, responder).await?,
                _ => {}
            }
        }
        Ok(())
    }

    fn new_wait(&mut self, remaining: usize, responder: oneshot::Sender<RedisResult<()>>) -> u64 {
        let wait_id = self.next_wait_id;
        self.next_wait_id += 1;
        self.waits.insert(
            wait_id,
            AckWait {
                remaining,
                responder,
            },
        );
        wait_id
    }

    fn complete_wait(&mut self, wait_id: u64) {
        if let Some(wait) = self.waits.get_mut(&wait_id) {
            wait.remaining -= 1;
            if wait.remaining == 0 {
                if let Some(wait) = self.waits.remove(&wait_id) {
                    let _ = wait.responder.send(Ok(()));
                }
            }
        }
    }

    /// Confirmed (subscribe − unsubscribe) acks; the command lockout on
    /// RESP2 is keyed on this count alone.
    fn subscriber_mode(&self) -> bool {
        self.channel_count + self.pattern_count > 0
    }

    /// Wider window than [`subscriber_mode`](Self::subscriber_mode):
    /// subscription event frames can also arrive while acks are still
    /// outstanding, before any count is confirmed.
    fn expects_subscription_events(&self) -> bool {
        self.subscriber_mode()
            || !self.pending_subscribes.is_empty()
            || !self.pending_unsubscribes.is_empty()
    }

    /// Routes one decoded top-level frame.
    async fn dispatch(&mut self, value: Value) -> RedisResult<()> {
        // Metadata on a push frame is irrelevant for routing.
        let value = match value {
            Value::Attribute { data, .. } if matches!(*data, Value::Push { .. }) => *data,
            other => other,
        };

        if let Value::Push { kind, data } = value {
            self.pubsub_event(kind, data);
            return Ok(());
        }

        let value = if self.protocol == ProtocolVersion::Resp2 && self.expects_subscription_events()
        {
            match into_pubsub_event(value) {
                Ok((kind, data)) => {
                    self.pubsub_event(kind, data);
                    return Ok(());
                }
                Err(value) => value,
            }
        } else {
            value
        };

        let Some(PendingEntry { label, kind }) = self.pending.pop_front() else {
            warn!(?value, "dropping reply with no pending request");
            return Ok(());
        };
        match kind {
            PendingKind::Normal(tx) => {
                // A dropped receiver withdrew interest; the slot itself
                // stays consumed so FIFO pairing is preserved.
                if tx.send(value.extract_error()).is_err() {
                    debug!(label = %label, "discarding reply for a cancelled request");
                }
            }
            PendingKind::Queued(tx) => self.resolve_queued(tx, value),
            PendingKind::Exec(tx) => self.resolve_exec(tx, value),
        }
        self.promote_awaiting().await
    }

    /// A reply for a command queued inside MULTI: `+QUEUED` parks the
    /// caller's future until `EXEC`, an error fails it immediately.
    fn resolve_queued(&mut self, tx: Responder, value: Value) {
        match value {
            Value::ServerError(err) => {
                let _ = tx.send(Err(err.into()));
            }
            _ if self.multi.discarding => {
                let _ = tx.send(Err(discard_error()));
            }
            _ => self.multi.queued.push_back(tx),
        }
    }

    /// Distributes the `EXEC` array onto the queued futures, in
    /// submission order, and reports `(successes, failures)`.
    fn resolve_exec(&mut self, tx: oneshot::Sender<RedisResult<(usize, usize)>>, value: Value) {
        let queued = std::mem::take(&mut self.multi.queued);
        let outcome = match value.extract_error() {
            Err(err) => {
                for parked in queued {
                    let _ = parked.send(Err(err.clone()));
                }
                Err(err)
            }
            Ok(Value::Nil) => {
                let err = RedisError::from((ErrorKind::Redis, "transaction aborted"));
                for parked in queued {
                    let _ = parked.send(Err(err.clone()));
                }
                Err(err)
            }
            Ok(Value::Array(values)) => {
                let mut successes = 0;
                let mut failures = 0;
                let mut parked = queued.into_iter();
                for value in values {
                    let Some(tx) = parked.next() else {
                        warn!("EXEC returned more replies than queued commands");
                        break;
                    };
                    match value {
                        Value::ServerError(err) => {
                            failures += 1;
                            let _ = tx.send(Err(err.into()));
                        }
                        value => {
                            successes += 1;
                            let _ = tx.send(Ok(value));
                        }
                    }
                }
                for leftover in parked {
                    failures += 1;
                    let _ = leftover.send(Err(RedisError::from((
                        ErrorKind::Protocol,
                        "EXEC reply shorter than the queued commands",
                    ))));
                }
                Ok((successes, failures))
            }
            Ok(other) => {
                let err = RedisError::from((
                    ErrorKind::Protocol,
                    "unexpected EXEC reply",
                    format!("{other:?}"),
                ));
                for parked in queued {
                    let _ = parked.send(Err(err.clone()));
                }
                Err(err)
            }
        };
        let _ = tx.send(outcome);
    }

    /// Moves parked commands onto the wire while pipeline slots are
    /// free. Entries whose caller is gone are discarded without ever
    /// being written.
    async fn promote_awaiting(&mut self) -> RedisResult<()> {
        loop {
            if self.pipeline_depth > 0 && self.pending.len() >= self.pipeline_depth {
                return Ok(());
            }
            let Some((cmd, kind)) = self.awaiting_pipeline.pop_front() else {
                return Ok(());
            };
            if kind.is_closed() {
                debug!(label = %cmd.label(), "dropping cancelled command before write");
                continue;
            }
            self.write_command(cmd, kind).await?;
        }
    }

    fn pubsub_event(&mut self, kind: PushKind, data: Vec<Value>) {
        match kind {
            PushKind::Message => self.route_message(MessageKind::Message, data),
            PushKind::SMessage => self.route_message(MessageKind::SMessage, data),
            PushKind::PMessage => self.route_message(MessageKind::PMessage, data),
            PushKind::Subscribe => self.subscribe_ack(SubscriptionKind::Channel, data),
            PushKind::PSubscribe => self.subscribe_ack(SubscriptionKind::Pattern, data),
            PushKind::Unsubscribe => self.unsubscribe_ack(SubscriptionKind::Channel, data),
            PushKind::PUnsubscribe => self.unsubscribe_ack(SubscriptionKind::Pattern, data),
            PushKind::Invalidate => {
                if let Some(cache) = &self.invalidation_cache {
                    for payload in &data {
                        cache.apply_invalidation(payload);
                    }
                }
            }
            PushKind::SSubscribe | PushKind::SUnsubscribe => {
                warn!("ignoring sharded subscription ack");
            }
            PushKind::Other(name) => {
                debug!(name = %name, "ignoring unrecognized push frame");
            }
        }
    }

    fn route_message(&mut self, kind: MessageKind, data: Vec<Value>) {
        let (lookup_name, message) = match kind {
            MessageKind::Message | MessageKind::SMessage => {
                let (Some(channel), Some(payload)) = (data.first(), data.get(1)) else {
                    warn!("dropping malformed pub/sub message");
                    return;
                };
                let Some(channel) = channel.as_bytes() else {
                    warn!("dropping pub/sub message with non-string channel");
                    return;
                };
                if channel == INVALIDATION_CHANNEL.as_bytes() {
                    if let Some(cache) = &self.invalidation_cache {
                        cache.apply_invalidation(payload);
                        return;
                    }
                }
                let Some(payload) = payload.as_bytes() else {
                    warn!("dropping pub/sub message with non-string payload");
                    return;
                };
                (
                    String::from_utf8_lossy(channel).into_owned(),
                    Message {
                        kind,
                        channel: channel.to_vec(),
                        pattern: None,
                        payload: payload.to_vec(),
                    },
                )
            }
            MessageKind::PMessage => {
                let (Some(pattern), Some(channel), Some(payload)) =
                    (data.first(), data.get(1), data.get(2))
                else {
                    warn!("dropping malformed pattern message");
                    return;
                };
                let (Some(pattern), Some(channel), Some(payload)) =
                    (pattern.as_bytes(), channel.as_bytes(), payload.as_bytes())
                else {
                    warn!("dropping pattern message with non-string fields");
                    return;
                };
                (
                    String::from_utf8_lossy(pattern).into_owned(),
                    Message {
                        kind,
                        channel: channel.to_vec(),
                        pattern: Some(pattern.to_vec()),
                        payload: payload.to_vec(),
                    },
                )
            }
        };

        let registry = match kind {
            MessageKind::PMessage => &mut self.by_pattern,
            _ => &mut self.by_channel,
        };
        match registry.get_mut(&lookup_name) {
            Some(subscription) => subscription.deliver(message),
            None => debug!(name = %lookup_name, "dropping message without subscription"),
        }
    }

    fn subscribe_ack(&mut self, kind: SubscriptionKind, data: Vec<Value>) {
        let Some(name) = data.first().and_then(Value::as_bytes) else {
            warn!("dropping malformed subscribe ack");
            return;
        };
        let name = String::from_utf8_lossy(name).into_owned();

        let pending = match self.pending_subscribes.entry((kind, name.clone())) {
            Entry::Occupied(mut occupied) => {
                let pending = occupied.get_mut().pop_front();
                if occupied.get().is_empty() {
                    occupied.remove();
                }
                pending
            }
            Entry::Vacant(_) => None,
        };
        let Some(PendingSubscribe { wait_id, sender }) = pending else {
            debug!(name = %name, "subscribe ack without a pending request");
            return;
        };

        let registry = match kind {
            SubscriptionKind::Channel => &mut self.by_channel,
            SubscriptionKind::Pattern => &mut self.by_pattern,
        };
        let inserted = !registry.contains_key(&name);
        registry
            .entry(name)
            .or_insert_with(|| Subscription::new(kind))
            .senders
            .push(sender);
        if inserted {
            match kind {
                SubscriptionKind::Channel => self.channel_count += 1,
                SubscriptionKind::Pattern => self.pattern_count += 1,
            }
        }
        self.complete_wait(wait_id);
    }

    fn unsubscribe_ack(&mut self, kind: SubscriptionKind, data: Vec<Value>) {
        let Some(name) = data.first().and_then(Value::as_bytes) else {
            warn!("dropping malformed unsubscribe ack");
            return;
        };
        let name = String::from_utf8_lossy(name).into_owned();

        let registry = match kind {
            SubscriptionKind::Channel => &mut self.by_channel,
            SubscriptionKind::Pattern => &mut self.by_pattern,
        };
        // Dropping the entry closes every sink so consumers see
        // end-of-stream.
        if let Some(subscription) = registry.remove(&name) {
            debug!(name = %name, kind = ?subscription.kind, "subscription closed");
            match kind {
                SubscriptionKind::Channel => self.channel_count -= 1,
                SubscriptionKind::Pattern => self.pattern_count -= 1,
            }
        }

        if let Entry::Occupied(mut occupied) = self.pending_unsubscribes.entry((kind, name)) {
            if let Some(wait_id) = occupied.get_mut().pop_front() {
                if occupied.get().is_empty() {
                    occupied.remove();
                }
                self.complete_wait(wait_id);
            }
        }
    }

    /// Fails every outstanding caller, closes every sink and emits the
    /// disconnect event.
    async fn teardown(&mut self) {
        let err = RedisError::disconnected();

        for entry in self.pending.drain(..) {
            entry.kind.fail(err.clone());
        }
        for (_, kind) in self.awaiting_pipeline.drain(..) {
            kind.fail(err.clone());
        }
        for parked in self.multi.queued.drain(..) {
            let _ = parked.send(Err(err.clone()));
        }
        for waiter in self.multi.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        let deferred = std::mem::take(&mut self.multi.deferred);
        for request in deferred {
            fail_request(request, &err);
        }
        for (_, wait) in self.waits.drain() {
            let _ = wait.responder.send(Err(err.clone()));
        }
        self.pending_subscribes.clear();
        self.pending_unsubscribes.clear();
        self.by_channel.clear();
        self.by_pattern.clear();
        self.channel_count = 0;
        self.pattern_count = 0;

        // Requests already queued behind the close observe the same
        // error instead of a dead channel.
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            fail_request(request, &err);
        }

        let guard = self.events.load();
        if let Some(events) = guard.as_ref() {
            let _ = events.send(ConnectionEvent::Disconnected);
        }
        let _ = self.framed.close().await;
    }
}

fn fail_request(request: Request, err: &RedisError) {
    match request {
        Request::Command { responder, .. } => {
            let _ = responder.send(Err(err.clone()));
        }
        Request::Subscribe { responder, .. } | Request::Unsubscribe { responder, .. } => {
            let _ = responder.send(Err(err.clone()));
        }
        Request::BeginMulti { granted } => {
            let _ = granted.send(Err(err.clone()));
        }
        Request::ExecMulti { responder } => {
            let _ = responder.send(Err(err.clone()));
        }
        Request::DiscardMulti { responder } => {
            let _ = responder.send(Err(err.clone()));
        }
        Request::EndMulti | Request::SetProtocol(_) => {}
    }
}

fn discard_error() -> RedisError {
    RedisError::from((ErrorKind::Redis, "transaction discarded"))
}

/// Reinterprets a RESP2 reply as a subscription event when its first
/// element is one of the event names. Only consulted while the
/// connection is in (or entering/leaving) subscriber state.
fn into_pubsub_event(value: Value) -> Result<(PushKind, Vec<Value>), Value> {
    let Value::Array(items) = value else {
        return Err(value);
    };
    let name = match items.first().and_then(Value::as_bytes) {
        Some(name) if is_subscription_event(name) => name.to_vec(),
        _ => return Err(Value::Array(items)),
    };
    let data = items.into_iter().skip(1).collect();
    Ok((PushKind::from_name(&name), data))
}

fn is_subscription_event(name: &[u8]) -> bool {
    matches!(
        name,
        b"message"
            | b"pmessage"
            | b"subscribe"
            | b"psubscribe"
            | b"unsubscribe"
            | b"punsubscribe"
    )
}
