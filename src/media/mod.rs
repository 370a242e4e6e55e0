//! Live media containers shared between the peer mesh, the liveness monitor
//! and the incident recorder.
//!
//! A [`MediaTrack`] is a cheap handle: clones share the same enabled flag and
//! packet fan-out, so gating a local track affects every consumer at once.
//! A [`MediaStream`] is an ordered set of tracks with a stable id.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const PACKET_BUFFER: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    packets: broadcast::Sender<Bytes>,
}

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        let (packets, _) = broadcast::channel(PACKET_BUFFER);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                enabled: AtomicBool::new(true),
                packets,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Publish one encoded packet. Disabled tracks drop it.
    /// Returns true when at least one consumer received the packet.
    pub fn push(&self, packet: Bytes) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.inner.packets.send(packet).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inner.packets.subscribe()
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.id == other.inner.id
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Empty stream with a random id.
    pub fn empty() -> Self {
        Self::new(random_id(12))
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn first_of(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks_of(kind).next()
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.contains(&track) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, track_id: &str) -> Option<MediaTrack> {
        let pos = self.tracks.iter().position(|t| t.id() == track_id)?;
        Some(self.tracks.remove(pos))
    }

    /// Drop every track of the incoming track's kind, then add it.
    pub fn replace_kind(&mut self, track: MediaTrack) {
        let kind = track.kind();
        self.tracks.retain(|t| t.kind() != kind);
        self.tracks.push(track);
    }

    /// Merge remote tracks in place, keeping at most one track per kind.
    pub fn merge_from(&mut self, incoming: &MediaStream) {
        for track in &incoming.tracks {
            self.replace_kind(track.clone());
        }
    }

    /// Gate every track of `kind`.
    pub fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn av_stream(id: &str) -> MediaStream {
        MediaStream::with_tracks(
            id,
            vec![
                MediaTrack::new(format!("{id}-audio"), TrackKind::Audio),
                MediaTrack::new(format!("{id}-video"), TrackKind::Video),
            ],
        )
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut target = MediaStream::new("remote-s1");
        let incoming = av_stream("call-1");

        target.merge_from(&incoming);
        target.merge_from(&incoming);

        assert_eq!(target.id(), "remote-s1");
        assert_eq!(target.tracks_of(TrackKind::Audio).count(), 1);
        assert_eq!(target.tracks_of(TrackKind::Video).count(), 1);
    }

    #[test]
    fn test_merge_replaces_previous_track_of_same_kind() {
        let mut target = MediaStream::new("remote-s1");
        target.merge_from(&av_stream("call-1"));
        target.merge_from(&av_stream("call-2"));

        assert_eq!(target.tracks().len(), 2);
        assert_eq!(target.first_of(TrackKind::Video).unwrap().id(), "call-2-video");
        assert_eq!(target.first_of(TrackKind::Audio).unwrap().id(), "call-2-audio");
    }

    #[test]
    fn test_disabled_track_drops_packets() {
        let track = MediaTrack::new("mic", TrackKind::Audio);
        let mut rx = track.subscribe();

        assert!(track.push(Bytes::from_static(b"a")));
        track.set_enabled(false);
        assert!(!track.push(Bytes::from_static(b"b")));

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clones_share_enabled_flag() {
        let stream = av_stream("local");
        let clone = stream.clone();
        stream.set_kind_enabled(TrackKind::Video, false);
        assert!(!clone.first_of(TrackKind::Video).unwrap().is_enabled());
        assert!(clone.first_of(TrackKind::Audio).unwrap().is_enabled());
    }
}
