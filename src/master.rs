//! Master orchestrator
//!
//! Listens on a signaling channel and answers viewer offers, keeping
//! one [`PeerSession`] per remote client id. A second offer from the
//! same client replaces that client's session. All signaling and
//! transport events are funneled into a single event loop so handling
//! for any one client is serialized.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MasterConfig;
use crate::directory::ChannelDirectory;
use crate::error::{AppError, Result};
use crate::ice::{build_ice_server_set, IceServerSet};
use crate::media::{LocalTrackSet, MediaSource, MediaStreamHandle, RenderSink};
use crate::session::{PeerSession, SessionState};
use crate::signaling::{
    ConnectRequest, IceCandidate, Role, SessionDescription, SignalingBridge, SignalingConnector,
    SignalingEvent,
};
use crate::transport::{PeerEvent, PeerTransportFactory};

struct Running {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Master-side session orchestrator
pub struct MasterOrchestrator {
    directory: Arc<dyn ChannelDirectory>,
    connector: Arc<dyn SignalingConnector>,
    media_source: Arc<dyn MediaSource>,
    transport_factory: Arc<dyn PeerTransportFactory>,
    running: Mutex<Option<Running>>,
}

impl MasterOrchestrator {
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

    /// Resolve the channel, acquire local media, connect the signaling
    /// bridge and start answering offers.
    pub async fn start(&self, config: MasterConfig) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(AppError::Signaling(
                "Master already started".to_string(),
            ));
        }

        info!("[MASTER] Starting for channel: {}", config.channel_name);

        let resolution = self
            .directory
            .resolve(
                &config.region,
                &config.credentials,
                &config.channel_name,
                Role::Master,
            )
            .await?;

        let ice = build_ice_server_set(
            config.nat_traversal,
            &config.region,
            &resolution.turn_credentials,
        );

        // Local capture failure degrades to a receive-only run
        let mut local_tracks = if config.media.is_empty() {
            None
        } else {
            match self.media_source.acquire(&config.media).await {
                Ok(tracks) => {
                    config.local_sink.attach(MediaStreamHandle::local(&tracks));
                    Some(tracks)
                }
                Err(e) => {
                    warn!("[MASTER] Could not acquire local media, continuing without: {}", e);
                    None
                }
            }
        };

        let connected = self
            .connector
            .connect(ConnectRequest {
                channel_id: resolution.channel_id,
                endpoints: resolution.endpoints,
                role: Role::Master,
                client_id: None,
                region: config.region.clone(),
                credentials: config.credentials.clone(),
            })
            .await;
        // Media was acquired before the bridge; a failed connect must
        // not strand it, since no run loop exists yet to tear it down
        let (bridge, signaling_rx) = match connected {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(tracks) = local_tracks.take() {
                    tracks.release();
                }
                config.local_sink.detach();
                return Err(e);
            }
        };

        let (peer_tx, peer_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let run = MasterRun {
            trickle_ice: config.trickle_ice,
            ice,
            bridge,
            transport_factory: self.transport_factory.clone(),
            local_tracks,
            local_sink: config.local_sink,
            remote_sink: config.remote_sink,
            sessions: HashMap::new(),
            peer_tx,
            forwarders: vec![],
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
                warn!("[MASTER] Run task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

/// State owned by the spawned event loop
struct MasterRun {
    trickle_ice: bool,
    ice: IceServerSet,
    bridge: Arc<dyn SignalingBridge>,
    transport_factory: Arc<dyn PeerTransportFactory>,
    local_tracks: Option<LocalTrackSet>,
    local_sink: Arc<dyn RenderSink>,
    remote_sink: Arc<dyn RenderSink>,
    sessions: HashMap<String, PeerSession>,
    /// Kept alive so the peer receiver never closes while we run
    peer_tx: mpsc::Sender<(String, PeerEvent)>,
    forwarders: Vec<JoinHandle<()>>,
}

impl MasterRun {
    async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
        mut signaling_rx: mpsc::Receiver<SignalingEvent>,
        mut peer_rx: mpsc::Receiver<(String, PeerEvent)>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("[MASTER] Shutdown requested");
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
                            warn!("[MASTER] Signaling event stream ended");
                            break;
                        }
                    }
                }
                Some((client_id, event)) = peer_rx.recv() => {
                    self.handle_peer_event(client_id, event).await;
                }
            }
        }
        self.teardown().await;
    }

    /// Returns `true` when the run should stop
    async fn handle_signaling_event(&mut self, event: SignalingEvent) -> bool {
        match event {
            SignalingEvent::Open => {
                info!("[MASTER] Signaling connected, waiting for viewers");
                false
            }
            SignalingEvent::SdpOffer {
                description,
                remote_client_id,
            } => {
                info!("[MASTER] Received SDP offer from client: {}", remote_client_id);
                if let Err(e) = self.accept_offer(remote_client_id.clone(), description).await {
                    warn!("[MASTER] Failed to answer offer from {}: {}", remote_client_id, e);
                }
                false
            }
            SignalingEvent::SdpAnswer { .. } => {
                warn!("[MASTER] Dropping SDP answer; masters do not send offers");
                false
            }
            SignalingEvent::IceCandidate {
                candidate,
                remote_client_id,
            } => {
                self.apply_candidate(candidate, remote_client_id).await;
                false
            }
            SignalingEvent::Close => {
                info!("[MASTER] Signaling channel closed");
                true
            }
            SignalingEvent::Error { detail } => {
                warn!("[MASTER] Signaling error: {}", detail);
                true
            }
        }
    }

    /// Create (or replace) the session for `client_id` and answer the
    /// offer.
    async fn accept_offer(&mut self, client_id: String, offer: SessionDescription) -> Result<()> {
        if let Some(mut old) = self.sessions.remove(&client_id) {
            info!("[MASTER] Replacing existing session for client: {}", client_id);
            if let Err(e) = old.close().await {
                warn!("[MASTER] Failed to close replaced session for {}: {}", client_id, e);
            }
        }

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let transport = self.transport_factory.create(&self.ice, events_tx).await?;

        // Tag this session's transport events with its client id before
        // they reach the shared loop
        let peer_tx = self.peer_tx.clone();
        let tag = client_id.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if peer_tx.send((tag.clone(), event)).await.is_err() {
                    break;
                }
            }
        }));

        let mut session = PeerSession::new(
            transport,
            self.bridge.clone(),
            self.remote_sink.clone(),
            Some(client_id.clone()),
            self.trickle_ice,
        );
        if let Err(e) = session
            .start_as_master(offer, self.local_tracks.as_ref())
            .await
        {
            if let Err(close_err) = session.close().await {
                warn!("[MASTER] Failed to close session for {}: {}", client_id, close_err);
            }
            return Err(e);
        }

        self.sessions.insert(client_id, session);
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate, remote_client_id: Option<String>) {
        let Some(client_id) = remote_client_id else {
            warn!("[MASTER] Dropping ICE candidate without a client id");
            return;
        };
        match self.sessions.get_mut(&client_id) {
            Some(session) => {
                if let Err(e) = session.apply_remote_candidate(candidate).await {
                    warn!("[MASTER] Failed to apply candidate from {}: {}", client_id, e);
                }
            }
            None => {
                warn!("[MASTER] Dropping ICE candidate from unknown client: {}", client_id);
            }
        }
    }

    async fn handle_peer_event(&mut self, client_id: String, event: PeerEvent) {
        let failed = match self.sessions.get_mut(&client_id) {
            Some(session) => {
                if let Err(e) = session.handle_peer_event(event).await {
                    warn!("[MASTER] Peer event handling failed for {}: {}", client_id, e);
                }
                session.state() == SessionState::Failed
            }
            None => {
                debug!("Peer event for unknown client: {}", client_id);
                return;
            }
        };

        if failed {
            warn!("[MASTER] Session failed, removing client: {}", client_id);
            if let Some(mut session) = self.sessions.remove(&client_id) {
                if let Err(e) = session.close().await {
                    warn!("[MASTER] Failed to close failed session for {}: {}", client_id, e);
                }
            }
        }
    }

    /// Best-effort cleanup; every step runs even when earlier ones fail
    async fn teardown(mut self) {
        info!("[MASTER] Stopping, {} peer session(s) open", self.sessions.len());

        for (client_id, mut session) in self.sessions.drain() {
            if let Err(e) = session.close().await {
                warn!("[MASTER] Failed to close session for {}: {}", client_id, e);
            }
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        if let Err(e) = self.bridge.close().await {
            warn!("[MASTER] Failed to close signaling bridge: {}", e);
        }
        if let Some(tracks) = self.local_tracks.take() {
            tracks.release();
        }
        self.local_sink.detach();
        self.remote_sink.detach();
        info!("[MASTER] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{Credentials, MediaRequest, VideoConstraints};
    use crate::ice::NatTraversalPolicy;
    use crate::media::SharedSink;
    use crate::testing::{
        init_tracing, BridgeSend, CapturingMediaSource, FailingConnector, FailingMediaSource,
        MockConnector, MockDirectory, MockTransportFactory, NullMediaSource, RecordingBridge,
    };

    struct Harness {
        orchestrator: MasterOrchestrator,
        factory: Arc<MockTransportFactory>,
        signaling_tx: mpsc::Sender<SignalingEvent>,
        bridge: Arc<RecordingBridge>,
        local_sink: Arc<SharedSink>,
        remote_sink: Arc<SharedSink>,
    }

    fn harness() -> (Harness, MasterConfig) {
        harness_with_media(Arc::new(NullMediaSource), MediaRequest::default())
    }

    fn harness_with_media(
        media_source: Arc<dyn MediaSource>,
        media: MediaRequest,
    ) -> (Harness, MasterConfig) {
        init_tracing();
        let factory = MockTransportFactory::new();
        let (connector, signaling_tx, bridge) = MockConnector::new();
        let local_sink = SharedSink::new();
        let remote_sink = SharedSink::new();

        let orchestrator = MasterOrchestrator::new(
            MockDirectory::new(),
            connector,
            media_source,
            factory.clone(),
        );
        let config = MasterConfig {
            region: "us-west-2".to_string(),
            credentials: Credentials::new("AKID", "secret"),
            channel_name: "demo-channel".to_string(),
            media,
            nat_traversal: NatTraversalPolicy::StunTurn,
            trickle_ice: true,
            local_sink: local_sink.clone(),
            remote_sink: remote_sink.clone(),
        };

        (
            Harness {
                orchestrator,
                factory,
                signaling_tx,
                bridge,
                local_sink,
                remote_sink,
            },
            config,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn offer_from(client_id: &str) -> SignalingEvent {
        SignalingEvent::SdpOffer {
            description: SessionDescription::offer("v=0 viewer-offer"),
            remote_client_id: client_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (h, config) = harness();

        h.orchestrator.start(config.clone()).await.unwrap();
        let err = h.orchestrator.start(config).await.unwrap_err();
        assert!(matches!(err, AppError::Signaling(_)));

        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_releases_acquired_media() {
        let (h, mut config) = harness();
        config.media = MediaRequest {
            video: Some(VideoConstraints::new(1280, 720)),
            audio: true,
        };
        let media_source = CapturingMediaSource::new();
        let orchestrator = MasterOrchestrator::new(
            MockDirectory::new(),
            FailingConnector::new(),
            media_source.clone(),
            h.factory.clone(),
        );

        let err = orchestrator.start(config).await.unwrap_err();
        assert!(matches!(err, AppError::Signaling(_)));

        // The capture handed out before the connect attempt is stopped
        // and the local sink detached again
        let tracks = media_source.last_acquired().unwrap();
        assert!(*tracks.stopped().borrow());
        assert!(!h.local_sink.is_attached());

        // Nothing is left running; a later stop stays a no-op
        assert!(!orchestrator.is_running().await);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_directory_failure_aborts_start() {
        let factory = MockTransportFactory::new();
        let (connector, _signaling_tx, _bridge) = MockConnector::new();
        let orchestrator = MasterOrchestrator::new(
            MockDirectory::failing(),
            connector.clone(),
            Arc::new(NullMediaSource),
            factory,
        );
        let (_h, config) = harness();

        let err = orchestrator.start(config).await.unwrap_err();
        assert!(matches!(err, AppError::Discovery(_)));
        // No signaling connection was attempted
        assert!(connector.last_request().is_none());
        assert!(!orchestrator.is_running().await);
    }

    #[tokio::test]
    async fn test_offers_create_independent_sessions() {
        let (h, config) = harness();
        h.orchestrator.start(config).await.unwrap();

        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        h.signaling_tx.send(offer_from("client2")).await.unwrap();
        settle().await;

        assert_eq!(h.factory.created_count(), 2);
        assert_eq!(h.bridge.sends_for("client1").len(), 1);
        assert_eq!(h.bridge.sends_for("client2").len(), 1);
        assert!(matches!(&h.bridge.sends_for("client1")[0], BridgeSend::Answer(_, _)));

        // Candidates generated by client1's transport go out tagged
        // with client1 only
        let candidate = IceCandidate::new("candidate:0 1 udp 2122260223 10.0.0.2 50000 typ host");
        h.factory
            .event_sender(0)
            .send(PeerEvent::CandidateReady(candidate))
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.bridge.sends_for("client1").len(), 2);
        assert_eq!(h.bridge.sends_for("client2").len(), 1);

        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_offer_replaces_session() {
        let (h, config) = harness();
        h.orchestrator.start(config).await.unwrap();

        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        settle().await;
        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        settle().await;

        assert_eq!(h.factory.created_count(), 2);
        assert!(h.factory.transport(0).is_closed());
        assert!(!h.factory.transport(1).is_closed());
        assert_eq!(
            h.bridge
                .sends_for("client1")
                .iter()
                .filter(|s| matches!(s, BridgeSend::Answer(_, _)))
                .count(),
            2
        );

        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_candidate_routed_to_its_session() {
        let (h, config) = harness();
        h.orchestrator.start(config).await.unwrap();

        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        settle().await;

        let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.9 50001 typ host");
        h.signaling_tx
            .send(SignalingEvent::IceCandidate {
                candidate,
                remote_client_id: Some("client1".to_string()),
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.factory.transport(0).remote_candidates().len(), 1);

        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_from_unknown_client_is_dropped() {
        let (h, config) = harness();
        h.orchestrator.start(config).await.unwrap();

        let candidate = IceCandidate::new("candidate:2 1 udp 2122260223 10.0.0.9 50002 typ host");
        h.signaling_tx
            .send(SignalingEvent::IceCandidate {
                candidate,
                remote_client_id: Some("ghost".to_string()),
            })
            .await
            .unwrap();
        settle().await;

        // The loop survives and keeps serving offers
        assert_eq!(h.factory.created_count(), 0);
        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        settle().await;
        assert_eq!(h.factory.created_count(), 1);

        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_sessions_and_bridge() {
        let (h, config) = harness();
        h.orchestrator.start(config).await.unwrap();

        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        settle().await;

        h.orchestrator.stop().await.unwrap();
        assert!(h.factory.transport(0).is_closed());
        assert!(h.bridge.is_closed());
        assert!(!h.local_sink.is_attached());
        assert!(!h.remote_sink.is_attached());

        // Idempotent
        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_signaling_close_tears_down() {
        let (h, config) = harness();
        h.orchestrator.start(config).await.unwrap();

        h.signaling_tx.send(SignalingEvent::Close).await.unwrap();
        settle().await;

        assert!(h.bridge.is_closed());
        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_media_failure_degrades_to_receive_only() {
        let (h, config) = harness_with_media(
            Arc::new(FailingMediaSource),
            MediaRequest {
                video: Some(VideoConstraints::new(1280, 720)),
                audio: true,
            },
        );

        // Start succeeds without local media
        h.orchestrator.start(config).await.unwrap();
        assert!(!h.local_sink.is_attached());

        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        settle().await;
        // No local tracks were attached to the transport
        assert_eq!(h.factory.transport(0).attach_calls(), 0);

        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_session_is_removed() {
        let (h, config) = harness();
        h.orchestrator.start(config).await.unwrap();

        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        settle().await;

        h.factory
            .event_sender(0)
            .send(PeerEvent::TransportError("dtls handshake failed".to_string()))
            .await
            .unwrap();
        settle().await;

        assert!(h.factory.transport(0).is_closed());

        // A fresh offer from the same client starts over
        h.signaling_tx.send(offer_from("client1")).await.unwrap();
        settle().await;
        assert_eq!(h.factory.created_count(), 2);

        h.orchestrator.stop().await.unwrap();
    }
}
