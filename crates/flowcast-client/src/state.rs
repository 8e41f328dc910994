//! Subscriber connection state machine.
//!
//! [`SubscriberMachine`] does no I/O. Every input returns the [`Command`]s
//! the driver must carry out. Connect attempts and reconnect timers are
//! tagged with a generation number; inputs from an older generation are
//! ignored, so a superseded transport or cancelled timer can never cause a
//! transition.

use std::time::Duration;

use flowcast_core::{BackoffPolicy, ClientMessage, ServerMessage, Subscription};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::buffer::EventBuffer;

/// Where the subscriber is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No transport and no pending reconnect.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Transport open and subscribed.
    Open,
    /// Waiting out a backoff delay before the next attempt.
    ReconnectScheduled,
    /// Reconnect attempts used up. Only `enable` leaves this state.
    Exhausted,
}

impl ConnectionState {
    /// Lowercase label for logs and display.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::ReconnectScheduled => "reconnect_scheduled",
            Self::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a transport; report its outcome with `generation`.
    Connect {
        /// Generation of this attempt.
        generation: u64,
    },
    /// Send a frame on the open transport.
    Send(ClientMessage),
    /// Close the open or connecting transport.
    CloseTransport,
    /// Fire a reconnect timer after `delay`.
    ScheduleReconnect {
        /// Backoff delay.
        delay: Duration,
        /// Generation the timer must report.
        generation: u64,
    },
    /// Cancel the pending reconnect timer.
    CancelReconnect,
}

/// Pure subscriber state: connection lifecycle, filter and buffer.
#[derive(Debug)]
pub struct SubscriberMachine {
    state: ConnectionState,
    enabled: bool,
    attempt: u32,
    generation: u64,
    desired_coin: Option<String>,
    policy: BackoffPolicy,
    buffer: EventBuffer,
}

impl SubscriberMachine {
    /// New disabled machine.
    pub fn new(policy: BackoffPolicy, buffer_capacity: usize, desired_coin: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            enabled: false,
            attempt: 0,
            generation: 0,
            desired_coin: normalize_coin(desired_coin),
            policy,
            buffer: EventBuffer::new(buffer_capacity),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the subscriber wants to be connected.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Reconnect attempts made since the last successful open.
    pub fn attempt_count(&self) -> u32 {
        self.attempt
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Instrument filter; `None` is every instrument.
    pub fn desired_coin(&self) -> Option<&str> {
        self.desired_coin.as_deref()
    }

    /// Buffered events.
    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    /// Start connecting from `Disconnected` or `Exhausted`.
    pub fn enable(&mut self) -> Vec<Command> {
        self.enabled = true;
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Exhausted => {
                self.attempt = 0;
                self.begin_connect()
            }
            _ => Vec::new(),
        }
    }

    /// Cancel any pending reconnect, close any transport, go `Disconnected`.
    pub fn disable(&mut self) -> Vec<Command> {
        self.enabled = false;
        let commands = match self.state {
            ConnectionState::ReconnectScheduled => vec![Command::CancelReconnect],
            ConnectionState::Connecting | ConnectionState::Open => vec![Command::CloseTransport],
            ConnectionState::Disconnected | ConnectionState::Exhausted => Vec::new(),
        };
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        commands
    }

    /// The transport for `generation` opened.
    pub fn on_open(&mut self, generation: u64) -> Vec<Command> {
        if !self.is_current(generation, ConnectionState::Connecting) {
            return Vec::new();
        }
        self.state = ConnectionState::Open;
        self.attempt = 0;
        info!(coin = self.desired_coin.as_deref().unwrap_or("*"), "subscriber connected");
        vec![Command::Send(ClientMessage::Subscribe(self.subscription()))]
    }

    /// A text frame arrived. Returns `true` if the buffer changed.
    pub fn on_message(&mut self, generation: u64, text: &str) -> bool {
        if !self.is_current(generation, ConnectionState::Open) {
            return false;
        }
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable frame");
                return false;
            }
        };
        match message {
            ServerMessage::Flow { data } => {
                if !self.subscription().matches(&data) {
                    return false;
                }
                self.buffer.insert(data)
            }
            ServerMessage::Error { message } => {
                warn!(reason = %message, "server rejected a frame");
                false
            }
            other => {
                debug!(kind = other.kind(), "server message");
                false
            }
        }
    }

    /// The transport (or connect attempt) for `generation` ended.
    pub fn on_closed(&mut self, generation: u64) -> Vec<Command> {
        if generation != self.generation
            || !matches!(self.state, ConnectionState::Connecting | ConnectionState::Open)
        {
            return Vec::new();
        }
        self.state = ConnectionState::Disconnected;
        if !self.enabled {
            return Vec::new();
        }
        if !self.policy.allows(self.attempt) {
            self.state = ConnectionState::Exhausted;
            warn!(attempts = self.attempt, "reconnect attempts exhausted");
            return Vec::new();
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        self.generation += 1;
        self.state = ConnectionState::ReconnectScheduled;
        info!(
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        vec![Command::ScheduleReconnect {
            delay,
            generation: self.generation,
        }]
    }

    /// The reconnect timer for `generation` fired.
    pub fn on_reconnect_timer(&mut self, generation: u64) -> Vec<Command> {
        if !self.is_current(generation, ConnectionState::ReconnectScheduled) {
            return Vec::new();
        }
        self.begin_connect()
    }

    /// Change the instrument filter.
    ///
    /// The buffer is cleared. While open, the old subscription is dropped and
    /// the new one sent on the same transport; otherwise the filter is used
    /// on the next open.
    pub fn set_coin(&mut self, coin: Option<String>) -> Vec<Command> {
        let coin = normalize_coin(coin);
        if coin == self.desired_coin {
            return Vec::new();
        }
        let previous = Subscription::flow(std::mem::replace(&mut self.desired_coin, coin));
        self.buffer.clear();
        if self.state != ConnectionState::Open {
            return Vec::new();
        }
        vec![
            Command::Send(ClientMessage::Unsubscribe(previous)),
            Command::Send(ClientMessage::Subscribe(self.subscription())),
        ]
    }

    fn subscription(&self) -> Subscription {
        Subscription::flow(self.desired_coin.clone())
    }

    fn is_current(&self, generation: u64, state: ConnectionState) -> bool {
        generation == self.generation && self.state == state
    }

    fn begin_connect(&mut self) -> Vec<Command> {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        vec![Command::Connect {
            generation: self.generation,
        }]
    }
}

fn normalize_coin(coin: Option<String>) -> Option<String> {
    coin.filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use flowcast_core::protocol::encode_flow;
    use flowcast_core::test_utils::flow_event;

    fn machine(coin: Option<&str>) -> SubscriberMachine {
        SubscriberMachine::new(BackoffPolicy::default(), 100, coin.map(str::to_string))
    }

    /// Enable and complete the handshake; returns the open generation.
    fn open(m: &mut SubscriberMachine) -> u64 {
        let cmds = m.enable();
        let [Command::Connect { generation }] = cmds[..] else {
            panic!("expected connect, got {cmds:?}");
        };
        let _ = m.on_open(generation);
        generation
    }

    fn flow_frame(id: &str, symbol: &str) -> String {
        encode_flow(&flow_event(id, symbol)).unwrap()
    }

    #[test]
    fn starts_disabled_and_disconnected() {
        let m = machine(None);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.enabled());
        assert_eq!(m.attempt_count(), 0);
    }

    #[test]
    fn enable_connects() {
        let mut m = machine(None);
        let cmds = m.enable();
        assert_matches!(cmds[..], [Command::Connect { .. }]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(m.enable().is_empty());
    }

    #[test]
    fn open_subscribes_with_current_filter() {
        let mut m = machine(Some("BTC"));
        let cmds = m.enable();
        let [Command::Connect { generation }] = cmds[..] else {
            panic!("expected connect");
        };
        let cmds = m.on_open(generation);
        assert_eq!(
            cmds,
            vec![Command::Send(ClientMessage::Subscribe(Subscription::coin("BTC")))]
        );
        assert_eq!(m.state(), ConnectionState::Open);
    }

    #[test]
    fn open_without_coin_subscribes_wildcard() {
        let mut m = machine(Some(""));
        assert_eq!(m.desired_coin(), None);
        let cmds = m.enable();
        let [Command::Connect { generation }] = cmds[..] else {
            panic!("expected connect");
        };
        assert_eq!(
            m.on_open(generation),
            vec![Command::Send(ClientMessage::Subscribe(Subscription::all()))]
        );
    }

    #[test]
    fn buffer_never_exceeds_hundred_events() {
        let mut m = SubscriberMachine::new(BackoffPolicy::default(), 500, Some("BTC".into()));
        let generation = open(&mut m);
        for i in 0..300 {
            let _ = m.on_message(generation, &flow_frame(&format!("btc-{i}"), "BTC"));
        }
        assert_eq!(m.buffer().len(), 100);
    }

    #[test]
    fn matching_flow_is_buffered() {
        let mut m = machine(Some("BTC"));
        let generation = open(&mut m);
        assert!(m.on_message(generation, &flow_frame("e1", "BTC")));
        assert!(!m.on_message(generation, &flow_frame("e2", "ETH")));
        assert_eq!(m.buffer().len(), 1);
        assert_eq!(m.buffer().snapshot()[0].id, "e1");
    }

    #[test]
    fn duplicate_flow_is_ignored() {
        let mut m = machine(None);
        let generation = open(&mut m);
        assert!(m.on_message(generation, &flow_frame("e1", "BTC")));
        assert!(!m.on_message(generation, &flow_frame("e1", "BTC")));
        assert_eq!(m.buffer().len(), 1);
    }

    #[test]
    fn garbage_and_control_frames_are_ignored() {
        let mut m = machine(None);
        let generation = open(&mut m);
        assert!(!m.on_message(generation, "not json"));
        assert!(!m.on_message(generation, r#"{"type":"pong","timestamp":1}"#));
        assert!(!m.on_message(generation, r#"{"type":"error","message":"nope"}"#));
        assert!(!m.on_message(generation, r#"{"type":"subscribed","channel":"flow","coin":null}"#));
        assert_eq!(m.state(), ConnectionState::Open);
        assert!(m.buffer().is_empty());
    }

    #[test]
    fn abnormal_close_schedules_first_reconnect_at_base_delay() {
        let mut m = machine(Some("BTC"));
        let generation = open(&mut m);
        let cmds = m.on_closed(generation);
        assert_matches!(
            cmds[..],
            [Command::ScheduleReconnect { delay, .. }] if delay == Duration::from_millis(1000)
        );
        assert_eq!(m.state(), ConnectionState::ReconnectScheduled);
        assert_eq!(m.attempt_count(), 1);
    }

    #[test]
    fn reconnect_resubscribes() {
        let mut m = machine(Some("BTC"));
        let generation = open(&mut m);
        let cmds = m.on_closed(generation);
        let [Command::ScheduleReconnect { generation: timer, .. }] = cmds[..] else {
            panic!("expected schedule");
        };
        let cmds = m.on_reconnect_timer(timer);
        let [Command::Connect { generation }] = cmds[..] else {
            panic!("expected connect");
        };
        assert_eq!(
            m.on_open(generation),
            vec![Command::Send(ClientMessage::Subscribe(Subscription::coin("BTC")))]
        );
        assert_eq!(m.attempt_count(), 0);
    }

    #[test]
    fn backoff_schedule_then_exhausted() {
        let mut m = machine(None);
        let cmds = m.enable();
        let [Command::Connect { mut generation }] = cmds[..] else {
            panic!("expected connect");
        };
        let mut delays = Vec::new();
        loop {
            let cmds = m.on_closed(generation);
            let Some(Command::ScheduleReconnect { delay, generation: timer }) = cmds.first().cloned()
            else {
                break;
            };
            delays.push(delay.as_millis());
            let cmds = m.on_reconnect_timer(timer);
            let [Command::Connect { generation: next }] = cmds[..] else {
                panic!("expected connect");
            };
            generation = next;
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(m.state(), ConnectionState::Exhausted);
        assert_eq!(m.attempt_count(), 5);
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = BackoffPolicy {
            max_attempts: 10,
            ..BackoffPolicy::default()
        };
        let mut m = SubscriberMachine::new(policy, 100, None);
        let cmds = m.enable();
        let [Command::Connect { mut generation }] = cmds[..] else {
            panic!("expected connect");
        };
        let mut last = Duration::ZERO;
        for _ in 0..8 {
            let cmds = m.on_closed(generation);
            let [Command::ScheduleReconnect { delay, generation: timer }] = cmds[..] else {
                panic!("expected schedule");
            };
            last = delay;
            let cmds = m.on_reconnect_timer(timer);
            let [Command::Connect { generation: next }] = cmds[..] else {
                panic!("expected connect");
            };
            generation = next;
        }
        assert_eq!(last, Duration::from_millis(30_000));
    }

    #[test]
    fn enable_from_exhausted_resets_attempts() {
        let policy = BackoffPolicy {
            max_attempts: 0,
            ..BackoffPolicy::default()
        };
        let mut m = SubscriberMachine::new(policy, 100, None);
        let cmds = m.enable();
        let [Command::Connect { generation }] = cmds[..] else {
            panic!("expected connect");
        };
        assert!(m.on_closed(generation).is_empty());
        assert_eq!(m.state(), ConnectionState::Exhausted);

        assert_matches!(m.enable()[..], [Command::Connect { .. }]);
        assert_eq!(m.attempt_count(), 0);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn disable_cancels_pending_timer() {
        let mut m = machine(None);
        let generation = open(&mut m);
        let cmds = m.on_closed(generation);
        let [Command::ScheduleReconnect { generation: timer, .. }] = cmds[..] else {
            panic!("expected schedule");
        };
        assert_eq!(m.disable(), vec![Command::CancelReconnect]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        // A timer that fires anyway is stale.
        assert!(m.on_reconnect_timer(timer).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn disable_closes_open_transport() {
        let mut m = machine(None);
        let generation = open(&mut m);
        assert_eq!(m.disable(), vec![Command::CloseTransport]);
        // The close notification for that transport does not reconnect.
        assert!(m.on_closed(generation).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.disable().is_empty());
    }

    #[test]
    fn disable_during_connect_ignores_late_open() {
        let mut m = machine(None);
        let cmds = m.enable();
        let [Command::Connect { generation }] = cmds[..] else {
            panic!("expected connect");
        };
        assert_eq!(m.disable(), vec![Command::CloseTransport]);
        assert!(m.on_open(generation).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stale_frames_are_ignored() {
        let mut m = machine(None);
        let old = open(&mut m);
        let _ = m.disable();
        let _ = open(&mut m);
        assert!(!m.on_message(old, &flow_frame("e1", "BTC")));
        assert!(m.on_closed(old).is_empty());
        assert_eq!(m.state(), ConnectionState::Open);
    }

    #[test]
    fn set_coin_while_open_switches_on_same_transport() {
        let mut m = machine(Some("BTC"));
        let generation = open(&mut m);
        let _ = m.on_message(generation, &flow_frame("e1", "BTC"));

        let cmds = m.set_coin(Some("ETH".into()));
        assert_eq!(
            cmds,
            vec![
                Command::Send(ClientMessage::Unsubscribe(Subscription::coin("BTC"))),
                Command::Send(ClientMessage::Subscribe(Subscription::coin("ETH"))),
            ]
        );
        assert!(m.buffer().is_empty());
        assert_eq!(m.state(), ConnectionState::Open);

        // Late BTC frames no longer match.
        assert!(!m.on_message(generation, &flow_frame("e2", "BTC")));
        assert!(m.on_message(generation, &flow_frame("e3", "ETH")));
    }

    #[test]
    fn set_coin_to_wildcard() {
        let mut m = machine(Some("BTC"));
        let _ = open(&mut m);
        let cmds = m.set_coin(None);
        assert_eq!(
            cmds,
            vec![
                Command::Send(ClientMessage::Unsubscribe(Subscription::coin("BTC"))),
                Command::Send(ClientMessage::Subscribe(Subscription::all())),
            ]
        );
    }

    #[test]
    fn set_same_coin_is_noop() {
        let mut m = machine(Some("BTC"));
        let generation = open(&mut m);
        let _ = m.on_message(generation, &flow_frame("e1", "BTC"));
        assert!(m.set_coin(Some("BTC".into())).is_empty());
        assert_eq!(m.buffer().len(), 1);
    }

    #[test]
    fn set_coin_while_disconnected_applies_on_next_open() {
        let mut m = machine(Some("BTC"));
        assert!(m.set_coin(Some("SOL".into())).is_empty());
        let cmds = m.enable();
        let [Command::Connect { generation }] = cmds[..] else {
            panic!("expected connect");
        };
        assert_eq!(
            m.on_open(generation),
            vec![Command::Send(ClientMessage::Subscribe(Subscription::coin("SOL")))]
        );
    }

    #[test]
    fn never_both_transport_and_timer() {
        let mut m = machine(None);
        let generation = open(&mut m);
        let _ = m.on_closed(generation);
        // While a timer is pending, enable does not start a second connect.
        assert!(m.enable().is_empty());
        assert_eq!(m.state(), ConnectionState::ReconnectScheduled);
    }
}
