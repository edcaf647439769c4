//! Daemon driver
//!
//! The protocol engines are plain state machines: they consume [`Event`]s
//! and answer with an [`Action`]. This module owns the sockets and the
//! expiry timer and feeds both into a single engine, one event at a time,
//! so the engine's state never needs a lock.

use crate::{
    error::HarborError,
    network::{self, InterfaceId, LocalInterface},
    v4::{codec, message::Message},
};
use std::{
    collections::HashMap,
    future::Future,
    net::{SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};

const EVENT_QUEUE_DEPTH: usize = 256;
const MAX_DATAGRAM_SIZE: usize = 1500;

/// What an engine wants done in response to an event.
#[derive(Debug)]
pub enum Action {
    Send {
        message: Message,
        destination: SocketAddrV4,
        interface: InterfaceId,
    },
    /// Nothing to send. Used for silent drops as well as bookkeeping events.
    Ignore,
}

/// Inputs an engine reacts to.
#[derive(Debug)]
pub enum Event {
    Received {
        message: Message,
        source: SocketAddrV4,
        interface: InterfaceId,
    },
    Tick,
}

/// Common interface of the server and relay state machines.
pub trait DhcpEngine {
    /// Processes one event to completion and returns the next action.
    fn handle_event(&mut self, event: Event) -> Action;
    /// Name used in logs.
    fn role(&self) -> &'static str;
    /// Interfaces and UDP ports the engine listens on.
    fn bindings(&self) -> Vec<(InterfaceId, u16)>;
    /// Period of [`Event::Tick`], if the engine wants one.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}

/// A repeating timer. Dropping or cancelling the handle stops it.
#[derive(Debug)]
pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Runs `callback` every `period`, starting one period from now, until
    /// it returns `false` or the task is cancelled.
    pub fn start<F, Fut>(period: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                if !callback().await {
                    break;
                }
            }
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct Daemon<E> {
    engine: E,
    sockets: HashMap<InterfaceId, Arc<UdpSocket>>,
    receivers: Vec<JoinHandle<()>>,
    ticker: Option<PeriodicTask>,
}

impl<E: DhcpEngine> Daemon<E> {
    /// Binds one device-bound socket per engine binding.
    pub fn new(engine: E, interfaces: &[LocalInterface]) -> Result<Self, HarborError> {
        let mut sockets = HashMap::new();
        for (id, port) in engine.bindings() {
            if sockets.contains_key(&id) {
                continue;
            }
            let iface = interfaces
                .iter()
                .find(|iface| iface.id == id)
                .ok_or_else(|| HarborError::InterfaceInvalid(id.to_string()))?;
            let socket = network::new_tokio_socket_bound_to_device(&iface.name, port)?;
            tracing::info!(
                "{} listening on {} ({}) port {}",
                engine.role(),
                iface.name,
                iface.address,
                port
            );
            sockets.insert(id, socket);
        }
        Ok(Self::with_sockets(engine, sockets))
    }

    /// Wraps already bound sockets, one per interface the engine uses.
    pub fn with_sockets(engine: E, sockets: HashMap<InterfaceId, UdpSocket>) -> Self {
        Self {
            engine,
            sockets: sockets
                .into_iter()
                .map(|(id, socket)| (id, Arc::new(socket)))
                .collect(),
            receivers: Vec::new(),
            ticker: None,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Processes datagrams and ticks until every event source is gone.
    pub async fn run(&mut self) -> Result<(), HarborError> {
        self.stop();
        let (sender, mut events) = mpsc::channel(EVENT_QUEUE_DEPTH);

        for (&interface, socket) in &self.sockets {
            self.receivers
                .push(spawn_receiver(interface, socket.clone(), sender.clone()));
        }

        if let Some(period) = self.engine.tick_interval() {
            let ticks = sender.clone();
            self.ticker = Some(PeriodicTask::start(period, move || {
                let ticks = ticks.clone();
                async move { ticks.send(Event::Tick).await.is_ok() }
            }));
        }
        drop(sender);

        tracing::info!(
            "{} running on {} socket(s)",
            self.engine.role(),
            self.sockets.len()
        );

        while let Some(event) = events.recv().await {
            let action = self.engine.handle_event(event);
            self.execute(action).await;
        }
        Ok(())
    }

    async fn execute(&self, action: Action) {
        let Action::Send {
            message,
            destination,
            interface,
        } = action
        else {
            return;
        };

        let Some(socket) = self.sockets.get(&interface) else {
            tracing::warn!(
                "No socket on {} for {} to {}",
                interface,
                message.message_type,
                destination
            );
            return;
        };

        let packet = match codec::encode(&message) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Failed to encode {}: {}", message.message_type, e);
                return;
            }
        };

        match socket.send_to(&packet, SocketAddr::V4(destination)).await {
            Ok(sent) => tracing::debug!(
                "Sent {} ({} bytes) to {} via {}",
                message.message_type,
                sent,
                destination,
                interface
            ),
            Err(e) => tracing::warn!("Error while sending {}: {}", message.message_type, e),
        }
    }
}

impl<E> Daemon<E> {
    /// Stops receiving datagrams and cancels the pending tick.
    pub fn stop(&mut self) {
        for receiver in self.receivers.drain(..) {
            receiver.abort();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel();
        }
    }
}

impl<E> Drop for Daemon<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_receiver(
    interface: InterfaceId,
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier sends surface here; keep listening.
                    tracing::warn!("Socket receive error on {}: {}", interface, e);
                    continue;
                }
            };

            let SocketAddr::V4(source) = from else {
                continue;
            };

            let message = match codec::decode(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("Dropping datagram from {}: {}", source, e);
                    continue;
                }
            };
            tracing::debug!(
                "Received {} from {} on {}",
                message.message_type,
                source,
                interface
            );

            let event = Event::Received {
                message,
                source,
                interface,
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    })
}
