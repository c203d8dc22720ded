//! Media boundary: local capture request/track set and render sinks
//!
//! Local capture and on-screen rendering live outside this crate. The
//! orchestrators only hold the track set handed back by a
//! [`MediaSource`] and attach inbound streams to a [`RenderSink`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MediaRequest;
use crate::error::Result;

/// Local capture track set, owned by the orchestrator
///
/// Shared read-only into every peer session; only the orchestrator may
/// release it. Release is signaled to the capture implementation via a
/// watch channel so it can stop feeding samples.
#[derive(Clone)]
pub struct LocalTrackSet {
    stream_id: String,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl LocalTrackSet {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stream_id: stream_id.into(),
            tracks,
            stop_tx: Arc::new(stop_tx),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Watch that flips to `true` when the set is released
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Stop all tracks. Safe to call more than once.
    pub fn release(&self) {
        let _ = self.stop_tx.send(true);
        debug!("Local track set {} released", self.stream_id);
    }
}

/// Local media acquisition collaborator
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local tracks matching the request. Called at most once
    /// per run, and never with an empty request.
    async fn acquire(&self, request: &MediaRequest) -> Result<LocalTrackSet>;
}

/// Track reference carried by a stream handle
#[derive(Clone)]
pub enum MediaTrackHandle {
    Local(Arc<dyn TrackLocal + Send + Sync>),
    Remote(Arc<TrackRemote>),
}

impl std::fmt::Debug for MediaTrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaTrackHandle::Local(track) => write!(f, "Local({})", track.id()),
            MediaTrackHandle::Remote(track) => write!(f, "Remote({})", track.id()),
        }
    }
}

/// A media stream attachable to a render sink
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    /// Stream identity (msid for remote streams)
    pub stream_id: String,
    /// Tracks belonging to the stream
    pub tracks: Vec<MediaTrackHandle>,
}

impl MediaStreamHandle {
    /// Handle over a local capture set
    pub fn local(set: &LocalTrackSet) -> Self {
        Self {
            stream_id: set.stream_id().to_string(),
            tracks: set
                .tracks()
                .iter()
                .map(|t| MediaTrackHandle::Local(t.clone()))
                .collect(),
        }
    }

    /// Handle over an inbound remote track
    pub fn remote(track: Arc<TrackRemote>) -> Self {
        Self {
            stream_id: track.stream_id(),
            tracks: vec![MediaTrackHandle::Remote(track)],
        }
    }
}

/// Render sink collaborator (a video element, a file writer, ...)
///
/// Attachment is write-once per negotiation: callers check
/// `is_attached` and keep the first stream. `detach` is called
/// unconditionally on stop.
pub trait RenderSink: Send + Sync {
    fn attach(&self, stream: MediaStreamHandle);
    fn detach(&self);
    fn is_attached(&self) -> bool;
}

/// Default in-memory sink holding the currently attached stream
#[derive(Default)]
pub struct SharedSink {
    current: Mutex<Option<MediaStreamHandle>>,
}

impl SharedSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Currently attached stream, if any
    pub fn current(&self) -> Option<MediaStreamHandle> {
        self.current.lock().clone()
    }
}

impl RenderSink for SharedSink {
    fn attach(&self, stream: MediaStreamHandle) {
        debug!("Sink attached to stream {}", stream.stream_id);
        *self.current.lock() = Some(stream);
    }

    fn detach(&self) {
        *self.current.lock() = None;
    }

    fn is_attached(&self) -> bool {
        self.current.lock().is_some()
    }
}
