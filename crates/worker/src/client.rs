//! The worker's relay connection.
//!
//! One socket per session. Inbound text frames go to the [`Dispatcher`];
//! events it produces are framed for the [`LinkMode`] and written back in
//! the order they were emitted. Events produced while disconnected wait in
//! the channel and are sent after the next connect.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lims_protocol::{local_timestamp, DeviceStatus, WorkerEvent};
use lims_storage::TaskStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::WorkerError;
use crate::link::LinkMode;
use crate::station::StationHandle;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Full websocket url, e.g. `ws://127.0.0.1:8000/ws/room/gcms`.
    pub url: String,
    pub link: LinkMode,
    /// Name announced in `worker_connected`.
    pub station_name: String,
    /// Period of device status reports; `None` disables them.
    pub status_interval: Option<Duration>,
    pub reconnect_delay: Duration,
}

pub struct WorkerClient {
    config: WorkerConfig,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig, station: Arc<dyn StationHandle>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            dispatcher: Dispatcher::new(station, tx),
            events: rx,
        }
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.dispatcher = self.dispatcher.with_task_store(store);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve sessions until `shutdown` resolves, reconnecting after every
    /// lost or refused connection.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let url = self.config.url.clone();
        let delay = self.config.reconnect_delay;
        loop {
            tokio::select! {
                result = self.run_session() => match result {
                    Ok(()) => info!(%url, "relay closed the connection"),
                    Err(e) => warn!(error = %e, "relay session ended"),
                },
                _ = &mut shutdown => {
                    info!("worker shutting down");
                    return;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => return,
            }
        }
    }

    /// One connection, until the relay closes it or it fails.
    pub async fn run_session(&mut self) -> Result<(), WorkerError> {
        let (socket, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|source| WorkerError::Connect {
                url: self.config.url.clone(),
                source,
            })?;
        info!(url = %self.config.url, station = %self.config.station_name, "connected to relay");
        let (mut sink, mut stream) = socket.split();

        let hello = WorkerEvent::WorkerConnected {
            station: self.config.station_name.clone(),
            timestamp: local_timestamp(),
        };
        sink.send(Message::text(self.config.link.encode_event(&hello))).await?;

        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let reporter = self
            .config
            .status_interval
            .map(|every| spawn_status_reporter(Arc::clone(self.dispatcher.station()), every, status_tx));

        let result = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatcher.handle_frame(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(other)) => debug!(?other, "non-text frame ignored"),
                    Some(Err(e)) => break Err(e.into()),
                },
                Some(event) = self.events.recv() => {
                    let frame = self.config.link.encode_event(&event);
                    if let Err(e) = sink.send(Message::text(frame)).await {
                        warn!(error = %e, "event not delivered");
                        break Err(e.into());
                    }
                }
                Some(status) = status_rx.recv() => {
                    let frame = self.config.link.encode_device_status(&status);
                    if let Err(e) = sink.send(Message::text(frame)).await {
                        break Err(e.into());
                    }
                }
            }
        };

        if let Some(reporter) = reporter {
            reporter.abort();
        }
        result
    }
}

/// Probe the station's devices every `every` on the blocking pool. Stops
/// when the station has nothing to report or the session ends.
fn spawn_status_reporter(
    station: Arc<dyn StationHandle>,
    every: Duration,
    out: mpsc::UnboundedSender<DeviceStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let probe = Arc::clone(&station);
            let status = match tokio::task::spawn_blocking(move || probe.device_status()).await {
                Ok(Some(status)) => status,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "device status probe failed");
                    continue;
                }
            };
            debug!(?status, "device status");
            if out.send(status).is_err() {
                return;
            }
        }
    })
}
