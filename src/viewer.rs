//! Viewer orchestrator
//!
//! Dials a master over a signaling channel and drives a single
//! [`PeerSession`]. Local media is acquired and the offer created only
//! once signaling reports `Open`, so a slow or failing connection never
//! holds a camera open for nothing.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{MediaRequest, ViewerConfig};
use crate::directory::ChannelDirectory;
use crate::error::{AppError, Result};
use crate::ice::{build_ice_server_set, IceServerSet};
use crate::media::{LocalTrackSet, MediaSource, MediaStreamHandle, RenderSink};
use crate::session::{PeerSession, SessionState};
use crate::signaling::{
    ConnectRequest, Role, SignalingBridge, SignalingConnector, SignalingEvent,
};
use crate::transport::{PeerEvent, PeerTransportFactory};

struct Running {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Viewer-side session orchestrator
pub struct ViewerOrchestrator {
    directory: Arc<dyn ChannelDirectory>,
    connector: Arc<dyn SignalingConnector>,
    media_source: Arc<dyn MediaSource>,
    transport_factory: Arc<dyn PeerTransportFactory>,
    running: Mutex<Option<Running>>,
}

impl ViewerOrchestrator {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        connector: Arc<dyn SignalingConnector>,
        media_source: Arc<dyn MediaSource>,
        transport_factory: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        Self {
            directory,
            connector,
            media_source,
            transport_factory,
            running: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Resolve the channel, connect the signaling bridge and negotiate
    /// with the master once the bridge opens.
    pub async fn start(&self, config: ViewerConfig) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(AppError::Signaling(
                "Viewer already started".to_string(),
            ));
        }

        let client_id = config.effective_client_id();
        info!(
            "[VIEWER] Starting for channel: {} as client: {}",
            config.channel_name, client_id
        );

        let resolution = self
            .directory
            .resolve(
                &config.region,
                &config.credentials,
                &config.channel_name,
                Role::Viewer,
            )
            .await?;

        let ice = build_ice_server_set(
            config.nat_traversal,
            &config.region,
            &resolution.turn_credentials,
        );

        let (bridge, signaling_rx) = self
            .connector
            .connect(ConnectRequest {
                channel_id: resolution.channel_id,
                endpoints: resolution.endpoints,
                role: Role::Viewer,
                client_id: Some(client_id),
                region: config.region.clone(),
                credentials: config.credentials.clone(),
            })
            .await?;

        let (peer_tx, peer_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let run = ViewerRun {
            media: config.media,
            trickle_ice: config.trickle_ice,
            ice,
            bridge,
            media_source: self.media_source.clone(),
            transport_factory: self.transport_factory.clone(),
            local_tracks: None,
            local_sink: config.local_sink,
            remote_sink: config.remote_sink,
            session: None,
            peer_tx,
        };
        let handle = tokio::spawn(run.run(shutdown_rx, signaling_rx, peer_rx));

        *running = Some(Running {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the run and tear everything down. Safe to call when not
    /// started, or more than once.
    pub async fn stop(&self) -> Result<()> {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            if let Err(e) = running.handle.await {
                warn!("[VIEWER] Run task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

/// State owned by the spawned event loop
struct ViewerRun {
    media: MediaRequest,
    trickle_ice: bool,
    ice: IceServerSet,
    bridge: Arc<dyn SignalingBridge>,
    media_source: Arc<dyn MediaSource>,
    transport_factory: Arc<dyn PeerTransportFactory>,
    local_tracks: Option<LocalTrackSet>,
    local_sink: Arc<dyn RenderSink>,
    remote_sink: Arc<dyn RenderSink>,
    session: Option<PeerSession>,
    /// Kept alive so the peer receiver never closes while we run
    peer_tx: mpsc::Sender<PeerEvent>,
}

impl ViewerRun {
    async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
        mut signaling_rx: mpsc::Receiver<SignalingEvent>,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("[VIEWER] Shutdown requested");
                    break;
                }
                event = signaling_rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_signaling_event(event).await {
                                break;
                            }
                        }
                        None => {
                            warn!("[VIEWER] Signaling event stream ended");
                            break;
                        }
                    }
                }
                Some(event) = peer_rx.recv() => {
                    if self.handle_peer_event(event).await {
                        break;
                    }
                }
            }
        }
        self.teardown().await;
    }

    /// Returns `true` when the run should stop
    async fn handle_signaling_event(&mut self, event: SignalingEvent) -> bool {
        match event {
            SignalingEvent::Open => {
                if self.session.is_some() {
                    warn!("[VIEWER] Ignoring duplicate signaling open");
                    return false;
                }
                info!("[VIEWER] Signaling connected");
                if let Err(e) = self.begin_negotiation().await {
                    warn!("[VIEWER] Failed to start negotiation: {}", e);
                    return true;
                }
                false
            }
            SignalingEvent::SdpAnswer { description } => {
                match self.session.as_mut() {
                    Some(session) => {
                        info!("[VIEWER] Received SDP answer");
                        if let Err(e) = session.apply_remote_description(description).await {
                            warn!("[VIEWER] Failed to apply answer: {}", e);
                        }
                    }
                    None => {
                        warn!("[VIEWER] Dropping SDP answer received before negotiation started");
                    }
                }
                false
            }
            SignalingEvent::SdpOffer { remote_client_id, .. } => {
                warn!("[VIEWER] Dropping SDP offer from {}; viewers send the offer", remote_client_id);
                false
            }
            SignalingEvent::IceCandidate { candidate, .. } => {
                match self.session.as_mut() {
                    Some(session) => {
                        if let Err(e) = session.apply_remote_candidate(candidate).await {
                            warn!("[VIEWER] Failed to apply candidate: {}", e);
                        }
                    }
                    None => {
                        warn!("[VIEWER] Dropping ICE candidate received before negotiation started");
                    }
                }
                false
            }
            SignalingEvent::Close => {
                info!("[VIEWER] Signaling channel closed");
                true
            }
            SignalingEvent::Error { detail } => {
                warn!("[VIEWER] Signaling error: {}", detail);
                true
            }
        }
    }

    /// Acquire local media, create the transport and send the offer
    async fn begin_negotiation(&mut self) -> Result<()> {
        // Local capture failure degrades to a receive-only run
        if !self.media.is_empty() {
            match self.media_source.acquire(&self.media).await {
                Ok(tracks) => {
                    self.local_sink.attach(MediaStreamHandle::local(&tracks));
                    self.local_tracks = Some(tracks);
                }
                Err(e) => {
                    warn!("[VIEWER] Could not acquire local media, continuing without: {}", e);
                }
            }
        }

        let transport = self
            .transport_factory
            .create(&self.ice, self.peer_tx.clone())
            .await?;
        let mut session = PeerSession::new(
            transport,
            self.bridge.clone(),
            self.remote_sink.clone(),
            None,
            self.trickle_ice,
        );
        session.start_as_viewer(self.local_tracks.as_ref()).await?;
        self.session = Some(session);
        Ok(())
    }

    /// Returns `true` when the run should stop
    async fn handle_peer_event(&mut self, event: PeerEvent) -> bool {
        let Some(session) = self.session.as_mut() else {
            debug!("Peer event before negotiation started");
            return false;
        };
        if let Err(e) = session.handle_peer_event(event).await {
            warn!("[VIEWER] Peer event handling failed: {}", e);
        }
        if session.state() == SessionState::Failed {
            warn!("[VIEWER] Peer connection failed, stopping");
            return true;
        }
        false
    }

    /// Best-effort cleanup; every step runs even when earlier ones fail
    async fn teardown(mut self) {
        info!("[VIEWER] Stopping");

        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!("[VIEWER] Failed to close peer session: {}", e);
            }
        }
        if let Err(e) = self.bridge.close().await {
            warn!("[VIEWER] Failed to close signaling bridge: {}", e);
        }
        if let Some(tracks) = self.local_tracks.take() {
            tracks.release();
        }
        self.local_sink.detach();
        self.remote_sink.detach();
        info!("[VIEWER] Stopped");
    }
}
