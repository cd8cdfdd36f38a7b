//! Native WebSocket client over `tokio-tungstenite`.
//!
//! [`PriceStream`] is a cheap handle over a background tokio task:
//! - the [`ConnectionManager`] behind a mutex decides what happens
//! - the task owns the socket, the reconnect timer and the heartbeat and
//!   executes the manager's actions
//! - handles queue each step while still holding the manager, and the task
//!   dispatches every event, so handlers see them in the order the manager
//!   produced them and never run with it locked

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{AuthMode, StreamConfig};
use crate::domain::price::PriceRecord;
use crate::error::{StreamError, TransportError};
use crate::shared::TokenSlug;
use crate::ws::connection::{Action, ConnectionManager, Step};
use crate::ws::dispatcher::{EventDispatcher, HandlerId, HandlerScope};
use crate::ws::{ConnectionState, MessageOut, StreamEvent, CLOSE_ABNORMAL, CLOSE_NORMAL};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the close handshake with an unresponsive peer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Commands from public API to background task ─────────────────────────────

enum Command {
    Execute(Step),
    Shutdown,
}

fn lock(core: &Mutex<ConnectionManager>) -> MutexGuard<'_, ConnectionManager> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Public PriceStream ──────────────────────────────────────────────────────

/// Real-time price stream over one WebSocket connection.
///
/// Every method takes `&self`; share the stream through `Arc<PriceStream>`.
/// Dropping the last handle stops the background task. Handlers that capture
/// an `Arc<PriceStream>` keep it alive; unregister them (or use a
/// [`HandlerScope`]) to let it go.
pub struct PriceStream {
    core: Arc<Mutex<ConnectionManager>>,
    dispatcher: Arc<EventDispatcher>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PriceStream {
    /// Validate `config` and spawn the background task on the current tokio
    /// runtime. Does not connect yet.
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StreamError::NoRuntime)?;

        let core = Arc::new(Mutex::new(ConnectionManager::new(&config)));
        let dispatcher = Arc::new(EventDispatcher::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            config,
            core: Arc::clone(&core),
            dispatcher: Arc::clone(&dispatcher),
            cmd_rx,
            link: None,
            pending: None,
            timer: None,
            heartbeat: None,
            stopping: false,
        };
        let task = runtime.spawn(driver.run());

        Ok(Self {
            core,
            dispatcher,
            cmd_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Shortcut for `PriceStream::new(StreamConfig::from_env()?)`.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::new(StreamConfig::from_env()?)
    }

    /// Run `input` on the manager and queue its step for the task before
    /// releasing the lock.
    fn submit<F>(&self, input: F) -> Result<(), StreamError>
    where
        F: FnOnce(&mut ConnectionManager) -> Result<Step, StreamError>,
    {
        if self.cmd_tx.is_closed() {
            return Err(StreamError::ChannelClosed);
        }
        let mut core = lock(&self.core);
        let step = input(&mut *core)?;
        if step.is_empty() {
            return Ok(());
        }
        self.cmd_tx
            .send(Command::Execute(step))
            .map_err(|_| StreamError::ChannelClosed)
    }

    // ── Connection ──────────────────────────────────────────────────────

    /// Open the connection. No-op while connected or connecting.
    ///
    /// If the background task is gone, fires [`StreamError::ChannelClosed`]
    /// on the error channel and leaves the state untouched.
    pub fn connect(&self) {
        if let Err(e) = self.submit(|core| Ok(core.connect())) {
            tracing::error!("Cannot connect: {}", e);
            self.dispatcher.dispatch(&StreamEvent::Error(e));
        }
    }

    /// Close the connection and forget all subscriptions.
    pub fn disconnect(&self) {
        if self.submit(|core| Ok(core.disconnect())).is_err() {
            // No task and no socket left; settle the state here.
            let step = lock(&self.core).disconnect();
            for event in &step.events {
                self.dispatcher.dispatch(event);
            }
        }
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.core).state()
    }

    /// Whether the link is open.
    pub fn is_connected(&self) -> bool {
        lock(&self.core).is_connected()
    }

    /// Disconnect and wait (up to five seconds) for the task to stop.
    pub async fn shutdown(self) {
        self.disconnect();
        let _ = self.cmd_tx.send(Command::Shutdown);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                tracing::warn!("Stream task did not stop within 5s");
            }
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Replace (`append = false`) or extend (`append = true`) the token set.
    ///
    /// Fails with [`StreamError::NotConnected`] without a live connection;
    /// the set is still recorded and sent on the next connect. Fails with
    /// [`StreamError::ChannelClosed`], recording nothing, once the
    /// background task has stopped.
    pub fn subscribe<I, T>(&self, tokens: I, append: bool) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = T>,
        T: Into<TokenSlug>,
    {
        let tokens: Vec<TokenSlug> = tokens.into_iter().map(Into::into).collect();
        self.submit(|core| core.subscribe(tokens, append))
    }

    /// Subscribe to exactly `tokens`.
    pub fn subscribe_to_tokens<I, T>(&self, tokens: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = T>,
        T: Into<TokenSlug>,
    {
        self.subscribe(tokens, false)
    }

    /// Same as [`subscribe_to_tokens`](Self::subscribe_to_tokens).
    pub fn replace_tokens<I, T>(&self, tokens: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = T>,
        T: Into<TokenSlug>,
    {
        self.subscribe(tokens, false)
    }

    /// Extend the set; only the new tokens go on the wire.
    pub fn add_tokens<I, T>(&self, tokens: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = T>,
        T: Into<TokenSlug>,
    {
        self.subscribe(tokens, true)
    }

    /// Unsubscribe from `tokens`, keeping the rest.
    pub fn remove_tokens<I, T>(&self, tokens: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = T>,
        T: Into<TokenSlug>,
    {
        let tokens: Vec<TokenSlug> = tokens.into_iter().map(Into::into).collect();
        self.submit(|core| core.remove_tokens(tokens))
    }

    /// The tracked subscription set, in insertion order.
    pub fn subscribed_tokens(&self) -> Vec<TokenSlug> {
        lock(&self.core).subscribed_tokens()
    }

    // ── Prices ──────────────────────────────────────────────────────────

    /// Latest record by slug, or by ticker symbol.
    pub fn get_price(&self, key: &str) -> Option<PriceRecord> {
        lock(&self.core).get_price(key)
    }

    /// Batch lookup keyed by the requested key; misses are left out.
    pub fn get_prices<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> std::collections::HashMap<String, PriceRecord> {
        lock(&self.core).get_prices(keys)
    }

    /// Every record, sorted by slug.
    pub fn prices(&self) -> Vec<PriceRecord> {
        lock(&self.core).prices()
    }

    /// Empty the price table. The connection and subscriptions are kept.
    pub fn clear(&self) {
        lock(&self.core).clear_prices();
    }

    // ── Handlers ────────────────────────────────────────────────────────

    /// Handlers run on the stream's task, one event at a time.
    pub fn on_price_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&PriceRecord) + Send + Sync + 'static,
    {
        self.dispatcher.on_price_update(handler)
    }

    /// Fires on every state transition.
    pub fn on_connection_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.dispatcher.on_connection_change(handler)
    }

    /// Fires for transient and terminal errors alike.
    pub fn on_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        self.dispatcher.on_error(handler)
    }

    /// Fires with the whole set after each change that reached the wire.
    pub fn on_subscription_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&[TokenSlug]) + Send + Sync + 'static,
    {
        self.dispatcher.on_subscription_update(handler)
    }

    /// Unregister one handler. Returns whether it was registered.
    pub fn off(&self, id: HandlerId) -> bool {
        self.dispatcher.off(id)
    }

    /// Handlers registered through the scope go away when it is dropped.
    pub fn scope(&self) -> HandlerScope {
        self.dispatcher.scope()
    }

    /// The underlying dispatcher, for `clear(channel)` and handler counts.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }
}

impl fmt::Debug for PriceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriceStream")
            .field("core", &*lock(&self.core))
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl Drop for PriceStream {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

struct Link {
    generation: u64,
    sink: SplitSink<WsStream, Message>,
    source: SplitStream<WsStream>,
}

struct PendingOpen {
    generation: u64,
    future: BoxFuture<'static, Result<WsStream, TransportError>>,
}

struct ReconnectTimer {
    ticket: u64,
    sleep: std::pin::Pin<Box<Sleep>>,
}

struct Heartbeat {
    interval: Interval,
    awaiting_pong: bool,
}

struct Driver {
    config: StreamConfig,
    core: Arc<Mutex<ConnectionManager>>,
    dispatcher: Arc<EventDispatcher>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    link: Option<Link>,
    pending: Option<PendingOpen>,
    timer: Option<ReconnectTimer>,
    heartbeat: Option<Heartbeat>,
    stopping: bool,
}

impl Driver {
    async fn run(mut self) {
        while !self.stopping {
            tokio::select! {
                // ── a) Command from public API ───────────────────────────────
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Execute(step)) => self.apply(vec![step]).await,
                        // Shutdown requested or every handle dropped.
                        Some(Command::Shutdown) | None => self.stopping = true,
                    }
                }

                // ── b) Pending open resolved ─────────────────────────────────
                (generation, result) = wait_open(&mut self.pending) => {
                    self.pending = None;
                    let steps = match result {
                        Ok(ws) => {
                            let (sink, source) = ws.split();
                            self.link = Some(Link { generation, sink, source });
                            self.start_heartbeat();
                            self.step_with(|core| core.on_open(generation))
                        }
                        Err(e) => self.step_with(|core| core.on_transport_error(generation, e)),
                    };
                    self.apply(steps).await;
                }

                // ── c) Incoming WS frame ─────────────────────────────────────
                (generation, frame) = next_frame(&mut self.link) => {
                    if let Some(heartbeat) = self.heartbeat.as_mut() {
                        heartbeat.awaiting_pong = false;
                    }
                    let steps = match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.step_with(|core| core.on_message(generation, text.as_str()))
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = extract_close(frame.as_ref());
                            self.drop_link();
                            self.step_with(|core| core.on_close(generation, code, &reason))
                        }
                        // Pings are answered by tungstenite; binary is unused.
                        Some(Ok(_)) => Vec::new(),
                        Some(Err(e)) => {
                            self.drop_link();
                            let error = TransportError::from(e);
                            self.step_with(|core| core.on_transport_error(generation, error))
                        }
                        None => {
                            self.drop_link();
                            self.step_with(|core| {
                                core.on_close(generation, CLOSE_ABNORMAL, "Stream ended")
                            })
                        }
                    };
                    self.apply(steps).await;
                }

                // ── d) Reconnect timer ───────────────────────────────────────
                ticket = wait_timer(&mut self.timer) => {
                    self.timer = None;
                    let steps = self.step_with(|core| core.on_reconnect_timer(ticket));
                    self.apply(steps).await;
                }

                // ── e) Heartbeat ─────────────────────────────────────────────
                () = wait_heartbeat(&mut self.heartbeat) => {
                    self.on_heartbeat().await;
                }
            }
        }

        if let Some(mut link) = self.link.take() {
            close_sink(&mut link.sink, close_message(CLOSE_NORMAL, "Client shutdown"), CLOSE_TIMEOUT)
                .await;
        }
        tracing::debug!("Stream task stopped");
    }

    /// Run a transport input on the manager. Steps the handles queued
    /// before it are returned ahead of its own, so the task applies every
    /// step in the order the manager produced it.
    fn step_with<F>(&mut self, input: F) -> Vec<Step>
    where
        F: FnOnce(&mut ConnectionManager) -> Step,
    {
        let mut core = lock(&self.core);
        let mut steps = Vec::new();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Execute(step) => steps.push(step),
                Command::Shutdown => self.stopping = true,
            }
        }
        steps.push(input(&mut *core));
        steps
    }

    /// Execute each step's actions, then dispatch its events. A failed send
    /// becomes a transport error for its link, applied after the rest.
    async fn apply(&mut self, steps: Vec<Step>) {
        let mut queue = VecDeque::from(steps);
        while let Some(step) = queue.pop_front() {
            let failure = self.execute(step.actions).await;
            for event in &step.events {
                self.dispatcher.dispatch(event);
            }
            if let Some((generation, error)) = failure {
                queue.extend(self.step_with(|core| core.on_transport_error(generation, error)));
            }
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) -> Option<(u64, TransportError)> {
        let mut failure = None;
        for action in actions {
            match action {
                Action::Open { generation } => {
                    let header_key = (self.config.auth_mode == AuthMode::Header)
                        .then(|| self.config.api_key.clone());
                    let future =
                        open_link(self.config.url.clone(), header_key, self.config.connect_timeout());
                    self.pending = Some(PendingOpen {
                        generation,
                        future: future.boxed(),
                    });
                }
                Action::Send {
                    generation,
                    message,
                } => {
                    if let Err(e) = self.send(generation, &message).await {
                        tracing::warn!("Send failed: {}", e);
                        self.drop_link();
                        failure.get_or_insert((generation, e));
                    }
                }
                Action::Close {
                    generation,
                    code,
                    reason,
                } => {
                    if self.pending.as_ref().is_some_and(|p| p.generation == generation) {
                        self.pending = None;
                    }
                    if self.link.as_ref().is_some_and(|l| l.generation == generation) {
                        if let Some(mut link) = self.link.take() {
                            let closed =
                                close_sink(&mut link.sink, close_message(code, &reason), CLOSE_TIMEOUT)
                                    .await;
                            if !closed {
                                tracing::warn!("Close handshake on link {} timed out", generation);
                            }
                        }
                        self.heartbeat = None;
                    }
                }
                Action::ArmTimer { ticket, delay } => {
                    self.timer = Some(ReconnectTimer {
                        ticket,
                        sleep: Box::pin(tokio::time::sleep(delay)),
                    });
                }
                Action::CancelTimer { ticket } => {
                    if self.timer.as_ref().is_some_and(|t| t.ticket == ticket) {
                        self.timer = None;
                    }
                }
            }
        }
        failure
    }

    async fn send(&mut self, generation: u64, message: &MessageOut) -> Result<(), TransportError> {
        let Some(link) = self.link.as_mut().filter(|l| l.generation == generation) else {
            tracing::debug!("Dropping {} for closed link {}", message, generation);
            return Ok(());
        };
        let json = message
            .to_json()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        link.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(TransportError::from)
    }

    async fn on_heartbeat(&mut self) {
        let Some(generation) = self.link.as_ref().map(|l| l.generation) else {
            self.heartbeat = None;
            return;
        };

        let timed_out = self.heartbeat.as_ref().is_some_and(|h| h.awaiting_pong);
        if timed_out {
            tracing::warn!("Heartbeat timeout: no frame since the last ping");
            self.drop_link();
            let steps =
                self.step_with(|core| core.on_close(generation, CLOSE_ABNORMAL, "Heartbeat timeout"));
            self.apply(steps).await;
            return;
        }

        let sent = match self.link.as_mut() {
            Some(link) => link.sink.send(Message::Ping(Vec::new().into())).await,
            None => return,
        };
        match sent {
            Ok(()) => {
                if let Some(heartbeat) = self.heartbeat.as_mut() {
                    heartbeat.awaiting_pong = true;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to send ping: {}", e);
                self.drop_link();
                let error = TransportError::from(e);
                let steps = self.step_with(|core| core.on_transport_error(generation, error));
                self.apply(steps).await;
            }
        }
    }

    fn start_heartbeat(&mut self) {
        self.heartbeat = self.config.heartbeat_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Heartbeat {
                interval,
                awaiting_pong: false,
            }
        });
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.heartbeat = None;
    }
}

// ─── Select helpers (pend forever when there is nothing to wait on) ──────────

async fn wait_open(pending: &mut Option<PendingOpen>) -> (u64, Result<WsStream, TransportError>) {
    match pending {
        Some(p) => {
            let result = p.future.as_mut().await;
            (p.generation, result)
        }
        None => std::future::pending().await,
    }
}

async fn next_frame(
    link: &mut Option<Link>,
) -> (
    u64,
    Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) {
    match link {
        Some(l) => {
            let frame = l.source.next().await;
            (l.generation, frame)
        }
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: &mut Option<ReconnectTimer>) -> u64 {
    match timer {
        Some(t) => {
            t.sleep.as_mut().await;
            t.ticket
        }
        None => std::future::pending().await,
    }
}

async fn wait_heartbeat(heartbeat: &mut Option<Heartbeat>) {
    match heartbeat {
        Some(h) => {
            h.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Build the upgrade request and connect, bounded by `timeout`.
async fn open_link(
    url: String,
    header_key: Option<String>,
    timeout: Duration,
) -> Result<WsStream, TransportError> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(key) = header_key {
        let value = HeaderValue::from_str(&key)
            .map_err(|e| TransportError::Io(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert("x-api-key", value);
    }

    let (ws, _) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| TransportError::Timeout)??;
    Ok(ws)
}

/// Send `message` and close `sink`, giving up after `limit`. Returns whether
/// both finished in time.
async fn close_sink<S>(sink: &mut S, message: Message, limit: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    let closing = async {
        let _ = sink.send(message).await;
        let _ = sink.close().await;
    };
    tokio::time::timeout(limit, closing).await.is_ok()
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.into(),
        reason: reason.to_string().into(),
    }))
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (CLOSE_ABNORMAL, "No close frame".into()),
    }
}
