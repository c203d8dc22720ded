//! Shared test doubles for the collaborator seams

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{Credentials, MediaRequest};
use crate::directory::{ChannelDirectory, ChannelResolution, SignalingEndpoints, TurnCredential};
use crate::error::{AppError, Result};
use crate::ice::IceServerSet;
use crate::media::{LocalTrackSet, MediaSource};
use crate::signaling::{
    BridgeHandle, ConnectRequest, IceCandidate, Role, SessionDescription, SignalingBridge,
    SignalingConnector, SignalingEvent,
};
use crate::transport::{PeerEvent, PeerTransport, PeerTransportFactory};

/// Install a process-wide test subscriber once; `RUST_LOG` controls
/// verbosity
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Everything a bridge was asked to send, in order
#[derive(Debug, Clone)]
pub(crate) enum BridgeSend {
    Offer(SessionDescription),
    Answer(SessionDescription, String),
    Candidate(IceCandidate, Option<String>),
}

#[derive(Default)]
pub(crate) struct RecordingBridge {
    sends: Mutex<Vec<BridgeSend>>,
    closed: AtomicBool,
}

impl RecordingBridge {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn sends(&self) -> Vec<BridgeSend> {
        self.sends.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends carrying the given client id tag (answers and candidates)
    pub(crate) fn sends_for(&self, client_id: &str) -> Vec<BridgeSend> {
        self.sends()
            .into_iter()
            .filter(|s| match s {
                BridgeSend::Answer(_, id) => id == client_id,
                BridgeSend::Candidate(_, Some(id)) => id == client_id,
                _ => false,
            })
            .collect()
    }
}

#[async_trait]
impl SignalingBridge for RecordingBridge {
    async fn send_sdp_offer(&self, description: SessionDescription) -> Result<()> {
        self.sends.lock().push(BridgeSend::Offer(description));
        Ok(())
    }

    async fn send_sdp_answer(
        &self,
        description: SessionDescription,
        remote_client_id: &str,
    ) -> Result<()> {
        self.sends
            .lock()
            .push(BridgeSend::Answer(description, remote_client_id.to_string()));
        Ok(())
    }

    async fn send_ice_candidate(
        &self,
        candidate: IceCandidate,
        remote_client_id: Option<&str>,
    ) -> Result<()> {
        self.sends.lock().push(BridgeSend::Candidate(
            candidate,
            remote_client_id.map(str::to_string),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport double recording descriptions and candidates
#[derive(Default)]
pub(crate) struct MockTransport {
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    attach_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub(crate) fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub(crate) fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_calls.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn attach_local_tracks(&self, _tracks: &LocalTrackSet) -> Result<()> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out mock transports, keeping each transport and its
/// event sender so tests can inject peer events
#[derive(Default)]
pub(crate) struct MockTransportFactory {
    created: Mutex<Vec<(Arc<MockTransport>, mpsc::Sender<PeerEvent>)>>,
}

impl MockTransportFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub(crate) fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.created.lock()[index].0.clone()
    }

    pub(crate) fn event_sender(&self, index: usize) -> mpsc::Sender<PeerEvent> {
        self.created.lock()[index].1.clone()
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _ice: &IceServerSet,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = MockTransport::new();
        self.created.lock().push((transport.clone(), events));
        Ok(transport)
    }
}

/// Directory double with a canned resolution
pub(crate) struct MockDirectory {
    fail: bool,
}

impl MockDirectory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { fail: false })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self { fail: true })
    }
}

#[async_trait]
impl ChannelDirectory for MockDirectory {
    async fn resolve(
        &self,
        _region: &str,
        _credentials: &Credentials,
        channel_name: &str,
        _role: Role,
    ) -> Result<ChannelResolution> {
        if self.fail {
            return Err(AppError::Discovery(format!(
                "Channel not found: {}",
                channel_name
            )));
        }
        Ok(ChannelResolution {
            channel_id: format!("channel/{}", channel_name),
            endpoints: SignalingEndpoints {
                control: "wss://signal.test.example.com".to_string(),
                ice_config: "https://ice.test.example.com".to_string(),
            },
            turn_credentials: vec![TurnCredential::new(
                vec!["turn:turn.test.example.com:443".to_string()],
                "user",
                "pass",
            )],
        })
    }
}

/// Connector double returning a recording bridge and a test-fed event
/// stream
pub(crate) struct MockConnector {
    bridge: Arc<RecordingBridge>,
    handle: Mutex<Option<BridgeHandle>>,
    last_request: Mutex<Option<ConnectRequest>>,
}

impl MockConnector {
    /// Returns the connector, the sender feeding signaling events, and
    /// the recording bridge it hands out.
    pub(crate) fn new() -> (Arc<Self>, mpsc::Sender<SignalingEvent>, Arc<RecordingBridge>) {
        let bridge = RecordingBridge::new();
        let (tx, rx) = mpsc::channel(64);
        let connector = Arc::new(Self {
            bridge: bridge.clone(),
            handle: Mutex::new(Some((bridge.clone() as Arc<dyn SignalingBridge>, rx))),
            last_request: Mutex::new(None),
        });
        (connector, tx, bridge)
    }

    pub(crate) fn last_request(&self) -> Option<ConnectRequest> {
        self.last_request.lock().clone()
    }

    #[allow(dead_code)]
    pub(crate) fn bridge(&self) -> Arc<RecordingBridge> {
        self.bridge.clone()
    }
}

#[async_trait]
impl SignalingConnector for MockConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<BridgeHandle> {
        *self.last_request.lock() = Some(request);
        self.handle
            .lock()
            .take()
            .ok_or_else(|| AppError::Signaling("Bridge already connected".to_string()))
    }
}

/// Connector whose connection attempt always fails, for start-error
/// tests
pub(crate) struct FailingConnector;

impl FailingConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl SignalingConnector for FailingConnector {
    async fn connect(&self, _request: ConnectRequest) -> Result<BridgeHandle> {
        Err(AppError::Signaling("Connection refused".to_string()))
    }
}

/// Media source returning an empty track set
pub(crate) struct NullMediaSource;

#[async_trait]
impl MediaSource for NullMediaSource {
    async fn acquire(&self, _request: &MediaRequest) -> Result<LocalTrackSet> {
        Ok(LocalTrackSet::new("local-capture", vec![]))
    }
}

/// Media source that always fails, for degraded-start tests
pub(crate) struct FailingMediaSource;

#[async_trait]
impl MediaSource for FailingMediaSource {
    async fn acquire(&self, _request: &MediaRequest) -> Result<LocalTrackSet> {
        Err(AppError::Media("Could not find webcam".to_string()))
    }
}

/// Media source that keeps a handle to the track set it handed out so
/// tests can observe its release
#[derive(Default)]
pub(crate) struct CapturingMediaSource {
    handed_out: Mutex<Option<LocalTrackSet>>,
}

impl CapturingMediaSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn last_acquired(&self) -> Option<LocalTrackSet> {
        self.handed_out.lock().clone()
    }
}

#[async_trait]
impl MediaSource for CapturingMediaSource {
    async fn acquire(&self, _request: &MediaRequest) -> Result<LocalTrackSet> {
        let tracks = LocalTrackSet::new("local-capture", vec![]);
        *self.handed_out.lock() = Some(tracks.clone());
        Ok(tracks)
    }
}
