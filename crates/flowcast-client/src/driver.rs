//! Tokio driver that runs a [`SubscriberMachine`] against a real `WebSocket`.
//!
//! One task owns the machine. Callers talk to it through a cloneable
//! [`SubscriberHandle`] and observe it through `watch` channels. Connect
//! attempts, the socket reader and the reconnect timer are helper tasks that
//! report back tagged with the generation they were started for.

use std::sync::Arc;
use std::time::Duration;

use flowcast_core::{BackoffPolicy, ClientMessage, FlowEvent};
use flowcast_settings::ClientSettings;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, warn};

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::errors::{ClientError, Result};
use crate::state::{Command, ConnectionState, SubscriberMachine};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscriber runtime configuration.
#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Initial instrument filter; `None` for every instrument.
    pub desired_coin: Option<String>,
    /// Reconnect schedule.
    pub policy: BackoffPolicy,
    /// Events retained in the buffer.
    pub buffer_capacity: usize,
    /// Time allowed for one handshake.
    pub connect_timeout: Duration,
}

impl SubscriberConfig {
    /// Config for `url` with default policy and limits.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            desired_coin: None,
            policy: BackoffPolicy::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Build a config from loaded settings.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            url: settings.server_url.clone(),
            desired_coin: None,
            policy: settings.reconnect.clone(),
            buffer_capacity: settings.buffer_capacity,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        }
    }

    /// Set the initial instrument filter.
    #[must_use]
    pub fn with_coin(mut self, coin: Option<String>) -> Self {
        self.desired_coin = coin;
        self
    }

    /// Reject URLs the `WebSocket` client cannot use.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ClientError::InvalidUrl {
            url: self.url.clone(),
            reason,
        };
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| invalid(e.to_string()))?;
        let uri = request.uri();
        if !matches!(uri.scheme_str(), Some("ws" | "wss")) {
            return Err(invalid("scheme must be ws or wss".into()));
        }
        if uri.host().is_none_or(str::is_empty) {
            return Err(invalid("missing host".into()));
        }
        Ok(())
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self::from_settings(&ClientSettings::default())
    }
}

/// Observable subscriber status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStatus {
    /// Connection lifecycle state.
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful open.
    pub attempt_count: u32,
    /// Instrument filter.
    pub desired_coin: Option<String>,
    /// Whether the subscriber wants to be connected.
    pub enabled: bool,
}

impl SubscriberStatus {
    fn of(machine: &SubscriberMachine) -> Self {
        Self {
            state: machine.state(),
            attempt_count: machine.attempt_count(),
            desired_coin: machine.desired_coin().map(str::to_string),
            enabled: machine.enabled(),
        }
    }
}

#[derive(Debug)]
enum Control {
    Enable,
    Disable,
    SetCoin(Option<String>),
    Shutdown,
}

enum DriverEvent {
    Connected { generation: u64, ws: Box<WsStream> },
    ConnectFailed { generation: u64, error: ClientError },
    Inbound { generation: u64, text: String },
    Closed { generation: u64 },
    TimerFired { generation: u64 },
}

/// Cloneable handle to a running subscriber.
#[derive(Clone, Debug)]
pub struct SubscriberHandle {
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<SubscriberStatus>,
    events: watch::Receiver<Arc<Vec<FlowEvent>>>,
}

impl SubscriberHandle {
    /// Start (or restart after exhaustion) connecting.
    pub fn enable(&self) -> Result<()> {
        self.send(Control::Enable)
    }

    /// Stop: cancel any reconnect and close any transport.
    pub fn disable(&self) -> Result<()> {
        self.send(Control::Disable)
    }

    /// Change the instrument filter. `None` or `""` means every instrument.
    pub fn set_coin(&self, coin: Option<String>) -> Result<()> {
        self.send(Control::SetCoin(coin))
    }

    /// Disable and stop the driver task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Control::Shutdown)
    }

    /// Latest status.
    pub fn status(&self) -> SubscriberStatus {
        self.status.borrow().clone()
    }

    /// Status receiver for change notifications.
    pub fn watch_status(&self) -> watch::Receiver<SubscriberStatus> {
        self.status.clone()
    }

    /// Latest buffer contents, newest first.
    pub fn events(&self) -> Arc<Vec<FlowEvent>> {
        self.events.borrow().clone()
    }

    /// Buffer receiver for change notifications.
    pub fn watch_events(&self) -> watch::Receiver<Arc<Vec<FlowEvent>>> {
        self.events.clone()
    }

    fn send(&self, control: Control) -> Result<()> {
        self.control.send(control).map_err(|_| ClientError::Closed)
    }
}

/// Validate `config` and spawn the driver task. The subscriber starts
/// disabled; call [`SubscriberHandle::enable`] to connect.
pub fn spawn_subscriber(config: SubscriberConfig) -> Result<(SubscriberHandle, JoinHandle<()>)> {
    config.validate()?;
    let machine = SubscriberMachine::new(
        config.policy.clone(),
        config.buffer_capacity,
        config.desired_coin.clone(),
    );
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SubscriberStatus::of(&machine));
    let (events_tx, events_rx) = watch::channel(Arc::new(Vec::new()));
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let driver = Driver {
        url: config.url,
        connect_timeout: config.connect_timeout,
        buffer_revision: machine.buffer().revision(),
        machine,
        control_rx,
        internal_tx,
        internal_rx,
        status_tx,
        events_tx,
        sink: None,
        reader: None,
        connecting: None,
        timer: None,
    };
    let task = tokio::spawn(driver.run());
    let handle = SubscriberHandle {
        control: control_tx,
        status: status_rx,
        events: events_rx,
    };
    Ok((handle, task))
}

struct Driver {
    url: String,
    connect_timeout: Duration,
    machine: SubscriberMachine,
    buffer_revision: u64,
    control_rx: mpsc::UnboundedReceiver<Control>,
    internal_tx: mpsc::UnboundedSender<DriverEvent>,
    internal_rx: mpsc::UnboundedReceiver<DriverEvent>,
    status_tx: watch::Sender<SubscriberStatus>,
    events_tx: watch::Sender<Arc<Vec<FlowEvent>>>,
    sink: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
    connecting: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl Driver {
    #[instrument(skip_all, name = "subscriber", fields(url = %self.url))]
    async fn run(mut self) {
        loop {
            let commands = tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Enable) => self.machine.enable(),
                    Some(Control::Disable) => self.machine.disable(),
                    Some(Control::SetCoin(coin)) => self.machine.set_coin(coin),
                    Some(Control::Shutdown) | None => {
                        let commands = self.machine.disable();
                        self.execute(commands).await;
                        self.publish();
                        break;
                    }
                },
                Some(event) = self.internal_rx.recv() => self.on_event(event),
            };
            self.execute(commands).await;
            self.publish();
        }
        debug!("subscriber driver stopped");
    }

    fn on_event(&mut self, event: DriverEvent) -> Vec<Command> {
        match event {
            DriverEvent::Connected { generation, ws } => {
                self.connecting = None;
                let commands = self.machine.on_open(generation);
                if commands.is_empty() {
                    debug!(generation, "discarding superseded connection");
                    drop(ws);
                    return commands;
                }
                let (sink, stream) = (*ws).split();
                self.sink = Some(sink);
                self.reader = Some(spawn_reader(stream, generation, self.internal_tx.clone()));
                commands
            }
            DriverEvent::ConnectFailed { generation, error } => {
                self.connecting = None;
                warn!(generation, error = %error, "connect attempt failed");
                self.machine.on_closed(generation)
            }
            DriverEvent::Inbound { generation, text } => {
                let _ = self.machine.on_message(generation, &text);
                Vec::new()
            }
            DriverEvent::Closed { generation } => {
                if generation == self.machine.generation() {
                    self.sink = None;
                    self.reader = None;
                }
                self.machine.on_closed(generation)
            }
            DriverEvent::TimerFired { generation } => {
                self.timer = None;
                self.machine.on_reconnect_timer(generation)
            }
        }
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Connect { generation } => self.connect(generation),
                Command::Send(message) => self.send(&message).await,
                Command::CloseTransport => self.close_transport().await,
                Command::ScheduleReconnect { delay, generation } => {
                    self.schedule_reconnect(delay, generation);
                }
                Command::CancelReconnect => {
                    if let Some(timer) = self.timer.take() {
                        timer.abort();
                    }
                }
            }
        }
    }

    fn connect(&mut self, generation: u64) {
        if let Some(previous) = self.connecting.take() {
            previous.abort();
        }
        debug!(generation, "connecting");
        let url = self.url.clone();
        let limit = self.connect_timeout;
        let tx = self.internal_tx.clone();
        self.connecting = Some(tokio::spawn(async move {
            let event = match tokio::time::timeout(limit, connect_async(url.as_str())).await {
                Ok(Ok((ws, _response))) => DriverEvent::Connected {
                    generation,
                    ws: Box::new(ws),
                },
                Ok(Err(e)) => DriverEvent::ConnectFailed {
                    generation,
                    error: ClientError::Connect(e.to_string()),
                },
                Err(_) => DriverEvent::ConnectFailed {
                    generation,
                    error: ClientError::ConnectTimeout(limit),
                },
            };
            let _ = tx.send(event);
        }));
    }

    async fn send(&mut self, message: &ClientMessage) {
        let Some(sink) = self.sink.as_mut() else {
            debug!(kind = message.kind(), "no open transport, dropping frame");
            return;
        };
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize client message");
                return;
            }
        };
        if let Err(e) = sink.send(Message::text(json)).await {
            // The reader sees the same failure and reports the close.
            debug!(error = %e, kind = message.kind(), "send failed");
        }
    }

    async fn close_transport(&mut self) {
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration, generation: u64) {
        if let Some(previous) = self.timer.take() {
            previous.abort();
        }
        let tx = self.internal_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(DriverEvent::TimerFired { generation });
        }));
    }

    fn publish(&mut self) {
        let status = SubscriberStatus::of(&self.machine);
        let _ = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if current.state != status.state {
                info!(from = %current.state, to = %status.state, "subscriber state");
            }
            *current = status;
            true
        });

        let revision = self.machine.buffer().revision();
        if revision != self.buffer_revision {
            self.buffer_revision = revision;
            let _ = self
                .events_tx
                .send_replace(Arc::new(self.machine.buffer().snapshot()));
        }
    }
}

fn spawn_reader(
    mut stream: SplitStream<WsStream>,
    generation: u64,
    tx: mpsc::UnboundedSender<DriverEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let _ = tx.send(DriverEvent::Inbound {
                        generation,
                        text: text.as_str().to_owned(),
                    });
                }
                Ok(Message::Close(frame)) => {
                    debug!(generation, ?frame, "server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(generation, error = %e, "transport error");
                    break;
                }
            }
        }
        let _ = tx.send(DriverEvent::Closed { generation });
    })
}
