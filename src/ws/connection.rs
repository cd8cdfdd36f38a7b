//! Connection manager: the transport-agnostic core of the stream.
//!
//! Every input (consumer call, transport callback, timer) returns a [`Step`]:
//! the transport [`Action`]s to execute and the [`StreamEvent`]s to dispatch.
//! The caller executes actions and dispatches events after releasing the
//! manager, so handlers never run under its lock.
//!
//! Transport inputs and actions carry the link generation they belong to.
//! An input for any generation other than the current one is ignored, and
//! the driver drops actions addressed to a link it no longer holds.

use crate::config::{AuthMode, StreamConfig};
use crate::domain::price::{PriceRecord, PriceTable};
use crate::error::{StreamError, TransportError};
use crate::shared::TokenSlug;
use crate::ws::reconnect::ReconnectPolicy;
use crate::ws::subscriptions::SubscriptionTracker;
use crate::ws::{ConnectionState, Inbound, MessageOut, StreamEvent, CLOSE_NORMAL};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// ─── Actions / steps ─────────────────────────────────────────────────────────

/// Work for the transport driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Start opening link `generation`.
    Open { generation: u64 },
    /// Send on link `generation`, if it is still the live one.
    Send { generation: u64, message: MessageOut },
    /// Close (or abandon, if still opening) link `generation`.
    Close {
        generation: u64,
        code: u16,
        reason: String,
    },
    /// Arm the reconnect timer; it reports back with `ticket`.
    ArmTimer { ticket: u64, delay: Duration },
    /// Cancel the timer armed with `ticket`.
    CancelTimer { ticket: u64 },
}

/// Output of one input to the manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    pub actions: Vec<Action>,
    pub events: Vec<StreamEvent>,
}

impl Step {
    fn action(&mut self, action: Action) {
        self.actions.push(action);
    }

    fn event(&mut self, event: StreamEvent) {
        self.events.push(event);
    }

    /// Nothing to execute and nothing to dispatch.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Idle,
    Opening(u64),
    Open(u64),
}

impl Link {
    fn generation(&self) -> Option<u64> {
        match self {
            Link::Idle => None,
            Link::Opening(g) | Link::Open(g) => Some(*g),
        }
    }
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

/// Owns the connection state, reconnect bookkeeping, the subscription set
/// and the price table.
pub struct ConnectionManager {
    state: ConnectionState,
    link: Link,
    next_generation: u64,
    /// Automatic attempts made since the last successful open or `connect()`.
    attempt: u32,
    /// Ticket of the armed reconnect timer; at most one.
    timer: Option<u64>,
    next_ticket: u64,
    /// Set by `connect()`, cleared by `disconnect()` and terminal failures.
    wants_connection: bool,
    tracker: SubscriptionTracker,
    table: PriceTable,
    policy: ReconnectPolicy,
    auth_mode: AuthMode,
    api_key: String,
    auth_rejection_codes: Vec<u16>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state)
            .field("link", &self.link)
            .field("attempt", &self.attempt)
            .field("timer", &self.timer)
            .field("wants_connection", &self.wants_connection)
            .field("subscriptions", &self.tracker.tokens())
            .field("prices", &self.table.len())
            .finish()
    }
}

impl ConnectionManager {
    /// A disconnected manager with an empty set and table.
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            link: Link::Idle,
            next_generation: 1,
            attempt: 0,
            timer: None,
            next_ticket: 1,
            wants_connection: false,
            tracker: SubscriptionTracker::with_symbol_limit(config.plan.limits().symbols),
            table: PriceTable::new(),
            policy: config.reconnect_policy(),
            auth_mode: config.auth_mode,
            api_key: config.api_key.clone(),
            auth_rejection_codes: config.auth_rejection_codes.clone(),
        }
    }

    // ── Consumer inputs ─────────────────────────────────────────────────

    /// Open a link. No-op while one is open or opening.
    pub fn connect(&mut self) -> Step {
        let mut step = Step::default();
        if self.link != Link::Idle {
            tracing::debug!("connect() ignored: link already {:?}", self.link);
            return step;
        }

        self.wants_connection = true;
        self.attempt = 0;
        self.cancel_timer(&mut step);
        self.open_link(&mut step);
        step
    }

    /// Close the link, forget subscriptions and stop reconnecting.
    pub fn disconnect(&mut self) -> Step {
        let mut step = Step::default();
        self.wants_connection = false;
        self.attempt = 0;
        self.cancel_timer(&mut step);

        if let Some(generation) = self.link.generation() {
            step.action(Action::Close {
                generation,
                code: CLOSE_NORMAL,
                reason: "Client disconnect".to_string(),
            });
        }
        self.link = Link::Idle;

        if self.tracker.clear() {
            step.event(StreamEvent::SubscriptionUpdate(Vec::new()));
        }
        self.set_state(ConnectionState::Disconnected, &mut step);
        tracing::info!("Disconnected by client");
        step
    }

    /// Set (`append = false`) or extend (`append = true`) the subscriptions.
    ///
    /// The tracked set is updated either way and replayed on the next open;
    /// without a live link the call reports [`StreamError::NotConnected`].
    pub fn subscribe<I>(&mut self, tokens: I, append: bool) -> Result<Step, StreamError>
    where
        I: IntoIterator<Item = TokenSlug>,
    {
        let message = if append {
            self.tracker.append(tokens)
        } else {
            self.tracker.replace(tokens)
        };
        self.send_subscription(message)
    }

    /// Replace the whole set with `tokens`.
    pub fn replace_tokens<I>(&mut self, tokens: I) -> Result<Step, StreamError>
    where
        I: IntoIterator<Item = TokenSlug>,
    {
        self.subscribe(tokens, false)
    }

    /// Add `tokens` to the set; only the new ones go on the wire.
    pub fn add_tokens<I>(&mut self, tokens: I) -> Result<Step, StreamError>
    where
        I: IntoIterator<Item = TokenSlug>,
    {
        self.subscribe(tokens, true)
    }

    /// Drop `tokens` from the set and send the remainder as a replace.
    pub fn remove_tokens<I>(&mut self, tokens: I) -> Result<Step, StreamError>
    where
        I: IntoIterator<Item = TokenSlug>,
    {
        let message = self.tracker.remove(tokens);
        self.send_subscription(message)
    }

    // ── Transport inputs ────────────────────────────────────────────────

    /// Link `generation` finished its handshake: authenticate and replay.
    pub fn on_open(&mut self, generation: u64) -> Step {
        let mut step = Step::default();
        if self.link == Link::Open(generation) {
            return step;
        }
        if self.link != Link::Opening(generation) {
            tracing::debug!("Closing stale link {}", generation);
            step.action(Action::Close {
                generation,
                code: CLOSE_NORMAL,
                reason: "Stale connection".to_string(),
            });
            return step;
        }

        self.link = Link::Open(generation);
        self.attempt = 0;
        tracing::info!("WebSocket connected");

        if self.auth_mode == AuthMode::Message {
            step.action(Action::Send {
                generation,
                message: MessageOut::auth(self.api_key.clone()),
            });
        }
        self.set_state(ConnectionState::Connected, &mut step);

        if let Some(message) = self.tracker.replay() {
            tracing::info!("Resubscribing to {} token(s)", self.tracker.len());
            step.action(Action::Send {
                generation,
                message,
            });
            step.event(StreamEvent::SubscriptionUpdate(self.tracker.tokens().to_vec()));
        }
        step
    }

    /// A text frame arrived on link `generation`.
    pub fn on_message(&mut self, generation: u64, text: &str) -> Step {
        let mut step = Step::default();
        if self.link != Link::Open(generation) {
            return step;
        }

        match Inbound::parse(text, Utc::now()) {
            Inbound::Price(record) => {
                self.table.upsert(record.clone());
                step.event(StreamEvent::PriceUpdate(record));
            }
            Inbound::AuthResponse { success: true, .. } => {
                tracing::info!("Authenticated");
            }
            Inbound::AuthResponse {
                success: false,
                message,
            } => {
                let reason = message.unwrap_or_else(|| "API key rejected".to_string());
                tracing::error!("Authentication failed: {}", reason);
                step.action(Action::Close {
                    generation,
                    code: CLOSE_NORMAL,
                    reason: "Authentication failed".to_string(),
                });
                self.fail_auth(reason, &mut step);
            }
            Inbound::Unknown(why) => {
                tracing::warn!("Dropping inbound frame ({}): {}", why, truncate(text, 200));
            }
        }
        step
    }

    /// Link `generation` closed with `code`.
    pub fn on_close(&mut self, generation: u64, code: u16, reason: &str) -> Step {
        let mut step = Step::default();
        if self.link.generation() != Some(generation) {
            return step;
        }
        self.link = Link::Idle;

        if code == CLOSE_NORMAL {
            tracing::info!("Connection closed normally");
            self.wants_connection = false;
            self.set_state(ConnectionState::Disconnected, &mut step);
        } else if self.auth_rejection_codes.contains(&code) {
            tracing::error!("Connection closed with auth rejection code {}: {}", code, reason);
            self.fail_auth(format!("closed with code {code}: {reason}"), &mut step);
        } else {
            tracing::warn!("Connection closed: code={} reason={}", code, reason);
            self.set_state(ConnectionState::Disconnected, &mut step);
            step.event(StreamEvent::Error(StreamError::Closed {
                code,
                reason: reason.to_string(),
            }));
            self.schedule_reconnect(&mut step);
        }
        step
    }

    /// Link `generation` failed to open or broke mid-stream.
    pub fn on_transport_error(&mut self, generation: u64, error: TransportError) -> Step {
        let mut step = Step::default();
        if self.link.generation() != Some(generation) {
            return step;
        }
        self.link = Link::Idle;

        match error {
            TransportError::AuthRejected(reason) => {
                tracing::error!("Handshake rejected: {}", reason);
                self.fail_auth(reason, &mut step);
            }
            other => {
                tracing::error!("WebSocket error: {}", other);
                self.set_state(ConnectionState::Error, &mut step);
                step.event(StreamEvent::Error(StreamError::ConnectionFailed(
                    other.to_string(),
                )));
                self.schedule_reconnect(&mut step);
            }
        }
        step
    }

    /// The timer armed with `ticket` fired.
    pub fn on_reconnect_timer(&mut self, ticket: u64) -> Step {
        let mut step = Step::default();
        if self.timer != Some(ticket) {
            return step;
        }
        self.timer = None;

        if !self.wants_connection || self.link != Link::Idle {
            tracing::debug!("Reconnect timer fired with nothing to do");
            return step;
        }

        self.attempt += 1;
        tracing::info!(
            "Reconnecting (attempt {}/{})",
            self.attempt,
            self.policy.max_attempts
        );
        self.open_link(&mut step);
        step
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the link is open.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The tracked subscription set, in insertion order.
    pub fn subscribed_tokens(&self) -> Vec<TokenSlug> {
        self.tracker.tokens().to_vec()
    }

    /// Latest record by slug, or by ticker symbol.
    pub fn get_price(&self, key: &str) -> Option<PriceRecord> {
        self.table.get(key).cloned()
    }

    /// Batch lookup keyed by the requested key.
    pub fn get_prices<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, PriceRecord> {
        self.table.get_many(keys)
    }

    /// Every record, sorted by slug.
    pub fn prices(&self) -> Vec<PriceRecord> {
        self.table.records()
    }

    /// Empty the price table; link and subscriptions are untouched.
    pub fn clear_prices(&mut self) {
        self.table.clear();
    }

    /// Automatic reconnect attempts made since the last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempt
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn set_state(&mut self, state: ConnectionState, step: &mut Step) {
        if self.state != state {
            self.state = state;
            step.event(StreamEvent::ConnectionChange(state));
        }
    }

    fn open_link(&mut self, step: &mut Step) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.link = Link::Opening(generation);
        self.set_state(ConnectionState::Connecting, step);
        step.action(Action::Open { generation });
    }

    fn cancel_timer(&mut self, step: &mut Step) {
        if let Some(ticket) = self.timer.take() {
            step.action(Action::CancelTimer { ticket });
        }
    }

    fn send_subscription(&mut self, message: MessageOut) -> Result<Step, StreamError> {
        match self.link {
            Link::Open(generation) => {
                let mut step = Step::default();
                tracing::debug!("Sending {}", message);
                step.action(Action::Send {
                    generation,
                    message,
                });
                step.event(StreamEvent::SubscriptionUpdate(self.tracker.tokens().to_vec()));
                Ok(step)
            }
            _ => {
                tracing::debug!(
                    "Not connected; {} recorded for the next connection",
                    message
                );
                Err(StreamError::NotConnected)
            }
        }
    }

    fn fail_auth(&mut self, reason: String, step: &mut Step) {
        self.link = Link::Idle;
        self.wants_connection = false;
        self.cancel_timer(step);
        self.set_state(ConnectionState::Error, step);
        step.event(StreamEvent::Error(StreamError::AuthenticationFailed(reason)));
    }

    fn schedule_reconnect(&mut self, step: &mut Step) {
        if !self.wants_connection {
            return;
        }
        if self.timer.is_some() {
            tracing::debug!("Reconnect already scheduled");
            return;
        }
        if !self.policy.allows(self.attempt) {
            tracing::error!("Giving up after {} reconnect attempts", self.attempt);
            self.wants_connection = false;
            self.set_state(ConnectionState::Error, step);
            step.event(StreamEvent::Error(StreamError::ReconnectExhausted {
                attempts: self.attempt,
            }));
            return;
        }

        let delay = self.policy.delay_for_attempt(self.attempt);
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.timer = Some(ticket);
        tracing::info!("Reconnecting in {}ms", delay.as_millis());
        step.action(Action::ArmTimer { ticket, delay });
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRICE_BTC: &str = r#"{"token_symbol":"BTC","cg_id":"bitcoin","price":42000.0,"timestamp":"2024-01-01T00:00:00Z"}"#;

    fn config() -> StreamConfig {
        StreamConfig::new("test-key")
    }

    fn slugs(names: &[&str]) -> Vec<TokenSlug> {
        names.iter().map(|n| TokenSlug::new(n)).collect()
    }

    fn open_generation(step: &Step) -> u64 {
        step.actions
            .iter()
            .find_map(|a| match a {
                Action::Open { generation } => Some(*generation),
                _ => None,
            })
            .expect("step has no Open action")
    }

    fn armed_timer(step: &Step) -> (u64, Duration) {
        step.actions
            .iter()
            .find_map(|a| match a {
                Action::ArmTimer { ticket, delay } => Some((*ticket, *delay)),
                _ => None,
            })
            .expect("step has no ArmTimer action")
    }

    fn sent(step: &Step) -> Vec<MessageOut> {
        step.actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn errors(step: &Step) -> Vec<StreamError> {
        step.events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    /// connect() + on_open(); returns the live generation.
    fn connected(mgr: &mut ConnectionManager) -> u64 {
        let generation = open_generation(&mgr.connect());
        mgr.on_open(generation);
        generation
    }

    #[test]
    fn test_connect_opens_and_authenticates() {
        let mut mgr = ConnectionManager::new(&config());
        let step = mgr.connect();
        assert_eq!(
            step.events,
            vec![StreamEvent::ConnectionChange(ConnectionState::Connecting)]
        );

        let step = mgr.on_open(open_generation(&step));
        assert_eq!(sent(&step), vec![MessageOut::auth("test-key")]);
        assert_eq!(
            step.events,
            vec![StreamEvent::ConnectionChange(ConnectionState::Connected)]
        );
        assert!(mgr.is_connected());
    }

    #[test]
    fn test_header_auth_sends_no_auth_message() {
        let config = StreamConfig {
            auth_mode: AuthMode::Header,
            ..config()
        };
        let mut mgr = ConnectionManager::new(&config);
        let step = mgr.connect();
        assert!(sent(&mgr.on_open(open_generation(&step))).is_empty());
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut mgr = ConnectionManager::new(&config());
        let first = mgr.connect();
        assert_eq!(first.actions.len(), 1);

        assert!(mgr.connect().is_empty());
        mgr.on_open(open_generation(&first));
        assert!(mgr.connect().is_empty());
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_subscribe_requires_link() {
        let mut mgr = ConnectionManager::new(&config());
        assert_eq!(
            mgr.subscribe(slugs(&["bitcoin"]), false),
            Err(StreamError::NotConnected)
        );
        // The intent is kept for the next open.
        assert_eq!(mgr.subscribed_tokens(), slugs(&["bitcoin"]));

        let generation = open_generation(&mgr.connect());
        let step = mgr.on_open(generation);
        assert_eq!(
            sent(&step),
            vec![
                MessageOut::auth("test-key"),
                MessageOut::replace(slugs(&["bitcoin"]))
            ]
        );
    }

    #[test]
    fn test_subscribe_append_and_replace() {
        let mut mgr = ConnectionManager::new(&config());
        connected(&mut mgr);

        let step = mgr.subscribe(slugs(&["bitcoin"]), false).unwrap();
        assert_eq!(sent(&step), vec![MessageOut::replace(slugs(&["bitcoin"]))]);
        assert_eq!(
            step.events,
            vec![StreamEvent::SubscriptionUpdate(slugs(&["bitcoin"]))]
        );

        let step = mgr.add_tokens(slugs(&["ethereum"])).unwrap();
        assert_eq!(sent(&step), vec![MessageOut::append(slugs(&["ethereum"]))]);
        assert_eq!(
            step.events,
            vec![StreamEvent::SubscriptionUpdate(slugs(&["bitcoin", "ethereum"]))]
        );
    }

    #[test]
    fn test_remove_tokens_replaces_with_remainder() {
        let mut mgr = ConnectionManager::new(&config());
        connected(&mut mgr);
        mgr.replace_tokens(slugs(&["bitcoin", "ethereum", "solana"]))
            .unwrap();

        let step = mgr.remove_tokens(slugs(&["ethereum"])).unwrap();
        assert_eq!(
            sent(&step),
            vec![MessageOut::replace(slugs(&["bitcoin", "solana"]))]
        );
        assert_eq!(mgr.subscribed_tokens(), slugs(&["bitcoin", "solana"]));
    }

    #[test]
    fn test_subscriptions_survive_abnormal_close() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);
        mgr.subscribe(slugs(&["bitcoin", "ethereum"]), false)
            .unwrap();

        let step = mgr.on_close(generation, 1006, "");
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(
            errors(&step),
            vec![StreamError::Closed {
                code: 1006,
                reason: String::new()
            }]
        );

        let (ticket, _) = armed_timer(&step);
        let step = mgr.on_reconnect_timer(ticket);
        let step = mgr.on_open(open_generation(&step));
        assert_eq!(
            sent(&step),
            vec![
                MessageOut::auth("test-key"),
                MessageOut::replace(slugs(&["bitcoin", "ethereum"]))
            ]
        );
        assert!(step
            .events
            .contains(&StreamEvent::SubscriptionUpdate(slugs(&["bitcoin", "ethereum"]))));
    }

    #[test]
    fn test_remove_while_disconnected_is_replayed() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);
        mgr.subscribe(slugs(&["a", "b", "c"]), false).unwrap();

        let (ticket, _) = armed_timer(&mgr.on_close(generation, 1006, ""));
        assert_eq!(
            mgr.remove_tokens(slugs(&["b"])),
            Err(StreamError::NotConnected)
        );

        let step = mgr.on_reconnect_timer(ticket);
        let step = mgr.on_open(open_generation(&step));
        assert_eq!(
            sent(&step),
            vec![
                MessageOut::auth("test-key"),
                MessageOut::replace(slugs(&["a", "c"]))
            ]
        );
        assert_eq!(mgr.subscribed_tokens(), slugs(&["a", "c"]));
    }

    #[test]
    fn test_disconnect_clears_subscriptions() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);
        mgr.subscribe(slugs(&["bitcoin"]), false).unwrap();

        let step = mgr.disconnect();
        assert!(step.actions.contains(&Action::Close {
            generation,
            code: CLOSE_NORMAL,
            reason: "Client disconnect".to_string()
        }));
        assert!(step
            .events
            .contains(&StreamEvent::SubscriptionUpdate(Vec::new())));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        // Late close for the old link changes nothing and arms no timer.
        assert!(mgr.on_close(generation, 1000, "").is_empty());

        let connect_step = mgr.connect();
        let step = mgr.on_open(open_generation(&connect_step));
        assert_eq!(sent(&step), vec![MessageOut::auth("test-key")]);
    }

    #[test]
    fn test_normal_close_does_not_reconnect() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);

        let step = mgr.on_close(generation, 1000, "bye");
        assert!(step.actions.is_empty());
        assert!(errors(&step).is_empty());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_auth_rejection_close_is_terminal() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);

        let step = mgr.on_close(generation, 1003, "invalid key");
        assert_eq!(mgr.state(), ConnectionState::Error);
        assert!(step.actions.is_empty());
        let errs = errors(&step);
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], StreamError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_failed_auth_response_closes_without_reconnect() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);

        let step = mgr.on_message(
            generation,
            r#"{"type":"auth_response","success":false,"message":"bad key"}"#,
        );
        assert_eq!(mgr.state(), ConnectionState::Error);
        assert!(matches!(step.actions[..], [Action::Close { .. }]));
        assert_eq!(
            errors(&step),
            vec![StreamError::AuthenticationFailed("bad key".to_string())]
        );

        // The close that follows is stale.
        assert!(mgr.on_close(generation, 1000, "").is_empty());
    }

    #[test]
    fn test_handshake_rejection_is_terminal() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = open_generation(&mgr.connect());

        let step = mgr.on_transport_error(
            generation,
            TransportError::AuthRejected("handshake returned 401".to_string()),
        );
        assert!(step.actions.is_empty());
        assert_eq!(mgr.state(), ConnectionState::Error);
        assert!(errors(&step)[0].is_terminal());
    }

    #[test]
    fn test_backoff_doubles_and_exhausts_after_five_attempts() {
        let mut mgr = ConnectionManager::new(&config());
        let mut generation = open_generation(&mgr.connect());
        let mut delays = Vec::new();

        loop {
            let step =
                mgr.on_transport_error(generation, TransportError::Io("refused".to_string()));
            match step
                .actions
                .iter()
                .find(|a| matches!(a, Action::ArmTimer { .. }))
            {
                Some(_) => {
                    let (ticket, delay) = armed_timer(&step);
                    delays.push(delay.as_millis());
                    generation = open_generation(&mgr.on_reconnect_timer(ticket));
                }
                None => {
                    assert_eq!(
                        errors(&step).last(),
                        Some(&StreamError::ReconnectExhausted { attempts: 5 })
                    );
                    break;
                }
            }
        }

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(mgr.state(), ConnectionState::Error);

        // connect() resets the budget.
        let generation = open_generation(&mgr.connect());
        mgr.on_open(generation);
        assert_eq!(mgr.reconnect_attempts(), 0);
        assert!(mgr.is_connected());
    }

    #[test]
    fn test_successful_open_resets_attempts() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);

        let step = mgr.on_close(generation, 1006, "");
        let (ticket, delay) = armed_timer(&step);
        assert_eq!(delay, Duration::from_millis(1_000));
        let generation = open_generation(&mgr.on_reconnect_timer(ticket));
        assert_eq!(mgr.reconnect_attempts(), 1);

        mgr.on_open(generation);
        assert_eq!(mgr.reconnect_attempts(), 0);

        let (_, delay) = armed_timer(&mgr.on_close(generation, 1006, ""));
        assert_eq!(delay, Duration::from_millis(1_000));
    }

    #[test]
    fn test_cancelled_timer_is_ignored() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);
        let (ticket, _) = armed_timer(&mgr.on_close(generation, 1006, ""));

        let step = mgr.disconnect();
        assert!(step.actions.contains(&Action::CancelTimer { ticket }));
        assert!(mgr.on_reconnect_timer(ticket).is_empty());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_only_one_timer_armed() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);
        let first = mgr.on_close(generation, 1006, "");
        armed_timer(&first);

        // A late error for the same link is stale.
        let again = mgr.on_transport_error(generation, TransportError::Timeout);
        assert!(again.is_empty());
    }

    #[test]
    fn test_stale_open_is_closed() {
        let mut mgr = ConnectionManager::new(&config());
        let old = open_generation(&mgr.connect());
        mgr.disconnect();
        let new = open_generation(&mgr.connect());

        let step = mgr.on_open(old);
        assert!(matches!(
            step.actions[..],
            [Action::Close { generation, .. }] if generation == old
        ));
        assert_eq!(mgr.state(), ConnectionState::Connecting);

        mgr.on_open(new);
        assert!(mgr.is_connected());
    }

    #[test]
    fn test_price_frames_update_table() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);

        let step = mgr.on_message(generation, PRICE_BTC);
        assert!(matches!(step.events[..], [StreamEvent::PriceUpdate(_)]));

        let step = mgr.on_message(
            generation,
            r#"{"token_symbol":"BTC","cg_id":"bitcoin","price":43000.0,"timestamp":"2024-01-01T00:00:01Z"}"#,
        );
        assert_eq!(step.events.len(), 1);
        assert_eq!(mgr.get_price("bitcoin").unwrap().price, 43000.0);
        assert_eq!(mgr.get_price("BTC").unwrap().price, 43000.0);
        assert_eq!(mgr.prices().len(), 1);
        assert_eq!(mgr.get_prices(&["btc", "eth"]).len(), 1);

        mgr.clear_prices();
        assert!(mgr.get_price("bitcoin").is_none());
        assert!(mgr.is_connected());
    }

    #[test]
    fn test_odd_optional_fields_still_update_table() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);

        let step = mgr.on_message(
            generation,
            r#"{"token_symbol":"SOL","cg_id":"solana","price":150.0,"timestamp":"2024-01-01T00:00:00Z","sequence":"17","exchange_rank":null}"#,
        );
        assert!(matches!(step.events[..], [StreamEvent::PriceUpdate(_)]));
        let record = mgr.get_price("solana").unwrap();
        assert_eq!(record.sequence, 17);
        assert_eq!(record.exchange_rank, 0);
    }

    #[test]
    fn test_malformed_frames_are_dropped_silently() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);
        mgr.on_message(generation, PRICE_BTC);
        let before = mgr.get_price("bitcoin");

        for text in [
            "{not json",
            r#"{"type":"heartbeat"}"#,
            r#"{"token_symbol":"BTC","cg_id":"bitcoin","price":"x","timestamp":"2024-01-01T00:00:00Z"}"#,
            r#"{"token_symbol":"BTC","cg_id":"bitcoin","price":1.0,"timestamp":"soon"}"#,
            r#"{"type":"auth_response","success":true}"#,
        ] {
            assert!(mgr.on_message(generation, text).is_empty(), "{text}");
        }

        assert_eq!(mgr.get_price("bitcoin"), before);
        assert!(mgr.is_connected());
    }

    #[test]
    fn test_messages_for_stale_link_are_ignored() {
        let mut mgr = ConnectionManager::new(&config());
        let generation = connected(&mut mgr);
        mgr.disconnect();

        assert!(mgr.on_message(generation, PRICE_BTC).is_empty());
        assert!(mgr.get_price("bitcoin").is_none());
    }

    #[test]
    fn test_state_change_fires_only_on_change() {
        let mut mgr = ConnectionManager::new(&config());
        let step = mgr.disconnect();
        assert!(step.events.is_empty());
    }
}
