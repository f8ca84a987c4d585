use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::StreamExt;
use tokio::{net::TcpListener, select, sync::oneshot};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    hub::{Hub, HubHandle},
    participant::{Participant, ParticipantId},
    pump::{read_pump, write_pump},
    trace::Tracer,
};

/// Per-connection limits applied by the `/room` endpoint.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Outbound messages a participant may have pending before it is evicted.
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout: Duration::from_secs(10),
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    hub: HubHandle,
    config: Arc<RoomConfig>,
}

impl AppState {
    pub fn new(hub: HubHandle, config: RoomConfig) -> Self {
        Self {
            hub,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/room", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A request that is not a valid upgrade is rejected by the extractor and
/// only that request fails.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|error: axum::Error| warn!(%error, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (participant, outbox) = Participant::new(state.config.queue_capacity);
    let span = info_span!("participant", id = %participant.id());

    async move {
        let id = participant.id().clone();
        if let Err(error) = state.hub.join(participant) {
            warn!(%error, "could not join room");
            return;
        }
        let leave = LeaveGuard::new(state.hub.clone(), id);
        info!("participant connected");

        let (sink, stream) = socket.split();
        let mut writer = tokio::spawn(
            write_pump(sink, outbox, state.config.write_timeout).in_current_span(),
        );

        let writer_finished = select! {
            _ = read_pump(stream, &state.hub) => false,
            _ = &mut writer => true,
        };

        drop(leave);
        if !writer_finished {
            if let Err(error) = writer.await {
                warn!(%error, "write pump task failed");
            }
        }
        info!("participant disconnected");
    }
    .instrument(span)
    .await;
}

/// Sends the participant's leave exactly once, however the connection task
/// ends.
struct LeaveGuard {
    hub: HubHandle,
    id: ParticipantId,
}

impl LeaveGuard {
    fn new(hub: HubHandle, id: ParticipantId) -> Self {
        Self { hub, id }
    }
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        if let Err(error) = self.hub.leave(&self.id) {
            debug!(%error, "leave not delivered");
        }
    }
}

pub struct ChatServer {
    listener: TcpListener,
    config: RoomConfig,
    tracer: Arc<dyn Tracer>,
}

impl ChatServer {
    pub fn new(listener: TcpListener, config: RoomConfig, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            listener,
            config,
            tracer,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves the room until `shutdown` resolves, then stops the hub, which
    /// closes every participant's queue and with it their connections.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ChatServer {
            listener,
            config,
            tracer,
        } = self;

        let (hub, handle) = Hub::new(tracer);
        let (stop_hub, hub_stopped) = oneshot::channel::<()>();
        let hub_task = tokio::spawn(hub.run_until(async move {
            let _ = hub_stopped.await;
        }));

        let app = router(AppState::new(handle, config));
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("http server failed");

        info!("chat room shutting down");
        let _ = stop_hub.send(());
        hub_task.await.context("hub task panicked")?;

        served
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}
