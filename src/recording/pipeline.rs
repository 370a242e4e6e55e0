//! GStreamer backends for capture and frame decoding.
//!
//! Both consume the RTP packets fanned out by local [`MediaTrack`]s
//! (VP8 video, Opus audio).

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::capture::{CaptureOptions, CaptureSession, MediaCapture};
use crate::error::{ProctorError, Result};
use crate::face::Frame;
use crate::liveness::FrameSource;
use crate::media::{MediaStream, MediaTrack, TrackKind};

fn capture_err(msg: impl Into<String>) -> ProctorError {
    ProctorError::CaptureFailed(msg.into())
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| capture_err(format!("Failed to create {}: {}", factory, e)))
}

fn rtp_appsrc(name: &str, kind: TrackKind) -> Result<gst_app::AppSrc> {
    let appsrc = gst::ElementFactory::make("appsrc")
        .name(name)
        .build()
        .map_err(|e| capture_err(format!("Failed to create {} appsrc: {}", kind, e)))?
        .dynamic_cast::<gst_app::AppSrc>()
        .map_err(|_| capture_err("Failed to cast to AppSrc"))?;

    appsrc.set_format(gst::Format::Time);
    appsrc.set_is_live(true);
    appsrc.set_do_timestamp(true);

    let caps = match kind {
        TrackKind::Video => gst::Caps::builder("application/x-rtp")
            .field("media", "video")
            .field("encoding-name", "VP8")
            .field("clock-rate", 90000i32)
            .field("payload", 96i32)
            .build(),
        TrackKind::Audio => gst::Caps::builder("application/x-rtp")
            .field("media", "audio")
            .field("encoding-name", "OPUS")
            .field("clock-rate", 48000i32)
            .field("payload", 111i32)
            .build(),
    };
    appsrc.set_caps(Some(&caps));
    Ok(appsrc)
}

/// Feed a track's packets into an appsrc until the track goes away.
fn forward_track(track: &MediaTrack, appsrc: gst_app::AppSrc) -> JoinHandle<()> {
    let mut packets = track.subscribe();
    let track_id = track.id().to_string();
    tokio::spawn(async move {
        loop {
            match packets.recv().await {
                Ok(packet) => {
                    if let Err(e) = appsrc.push_buffer(gst::Buffer::from_slice(packet)) {
                        tracing::debug!(track_id = %track_id, error = ?e, "appsrc refused buffer");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(track_id = %track_id, skipped, "Capture lagging behind track");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

struct Codecs {
    video_encoder: &'static str,
    audio_encoder: &'static str,
    muxer: &'static str,
}

fn codecs_for(mime_type: &str) -> Option<Codecs> {
    let (container, codecs) = mime_type.split_once(';').unwrap_or((mime_type, ""));
    let codecs = codecs.trim().trim_start_matches("codecs=");
    let video = codecs.split(',').next().unwrap_or("vp8").trim();

    let video_encoder = match video {
        "vp9" => "vp9enc",
        "h264" => "x264enc",
        "vp8" | "" => "vp8enc",
        _ => return None,
    };
    let (audio_encoder, muxer) = match container.trim() {
        "video/webm" => ("opusenc", "webmmux"),
        "video/mp4" => ("avenc_aac", "mp4mux"),
        _ => return None,
    };
    Some(Codecs {
        video_encoder,
        audio_encoder,
        muxer,
    })
}

/// Encodes local tracks into WebM/MP4 chunks with GStreamer.
pub struct GstCapture;

impl GstCapture {
    pub fn new() -> Result<Self> {
        gst::init().map_err(|e| capture_err(format!("GStreamer init failed: {}", e)))?;
        Ok(Self)
    }

    fn build_encoder(codecs: &Codecs, bitrate: u32) -> Result<gst::Element> {
        let builder = gst::ElementFactory::make(codecs.video_encoder);
        let builder = match codecs.video_encoder {
            "x264enc" => builder
                .property("bitrate", (bitrate / 1000).max(1))
                .property_from_str("tune", "zerolatency"),
            _ => builder
                .property("target-bitrate", bitrate as i32)
                .property("deadline", 1i64)
                .property("cpu-used", 4i32),
        };
        builder
            .build()
            .map_err(|e| capture_err(format!("Failed to create {}: {}", codecs.video_encoder, e)))
    }
}

#[async_trait]
impl MediaCapture for GstCapture {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        let Some(codecs) = codecs_for(mime_type) else {
            return false;
        };
        [codecs.video_encoder, codecs.audio_encoder, codecs.muxer]
            .iter()
            .all(|factory| gst::ElementFactory::find(factory).is_some())
    }

    async fn start(
        &self,
        stream: &MediaStream,
        options: CaptureOptions,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn CaptureSession>> {
        let codecs = codecs_for(&options.mime_type)
            .ok_or_else(|| capture_err(format!("Unsupported mime type {}", options.mime_type)))?;

        let pipeline = gst::Pipeline::new();
        let muxer = make(codecs.muxer)?;
        if codecs.muxer == "mp4mux" {
            muxer.set_property("fragment-duration", 1000u32);
        }

        let appsink = gst_app::AppSink::builder().sync(false).build();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let _ = chunks.send(Bytes::copy_from_slice(map.as_slice()));
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .add_many([&muxer, appsink.upcast_ref()])
            .map_err(|e| capture_err(format!("Failed to add muxer: {}", e)))?;
        muxer
            .link(&appsink)
            .map_err(|e| capture_err(format!("Failed to link muxer to sink: {}", e)))?;

        let mut sources = Vec::new();
        let mut forwarders = Vec::new();

        if let Some(track) = stream.first_of(TrackKind::Video) {
            let appsrc = rtp_appsrc("video_src", TrackKind::Video)?;
            let chain = [
                make("rtpvp8depay")?,
                make("vp8dec")?,
                make("videoconvert")?,
                Self::build_encoder(&codecs, options.video_bitrate)?,
            ];
            link_branch(&pipeline, &appsrc, &chain, &muxer, "video_%u")?;
            forwarders.push(forward_track(track, appsrc.clone()));
            sources.push(appsrc);
        }

        if let Some(track) = stream.first_of(TrackKind::Audio) {
            let appsrc = rtp_appsrc("audio_src", TrackKind::Audio)?;
            let chain = [
                make("rtpopusdepay")?,
                make("opusdec")?,
                make("audioconvert")?,
                make("audioresample")?,
                make(codecs.audio_encoder)?,
            ];
            link_branch(&pipeline, &appsrc, &chain, &muxer, "audio_%u")?;
            forwarders.push(forward_track(track, appsrc.clone()));
            sources.push(appsrc);
        }

        if sources.is_empty() {
            return Err(ProctorError::NoStream);
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| capture_err(format!("Failed to start pipeline: {}", e)))?;

        tracing::info!(
            stream_id = %stream.id(),
            mime_type = %options.mime_type,
            "Capture pipeline playing"
        );

        Ok(Box::new(GstCaptureSession {
            pipeline,
            sources,
            forwarders,
        }))
    }
}

fn link_branch(
    pipeline: &gst::Pipeline,
    appsrc: &gst_app::AppSrc,
    chain: &[gst::Element],
    muxer: &gst::Element,
    pad_template: &str,
) -> Result<()> {
    pipeline
        .add(appsrc)
        .map_err(|e| capture_err(format!("Failed to add appsrc: {}", e)))?;
    pipeline
        .add_many(chain)
        .map_err(|e| capture_err(format!("Failed to add elements: {}", e)))?;

    let mut elements: Vec<&gst::Element> = vec![appsrc.upcast_ref()];
    elements.extend(chain.iter());
    gst::Element::link_many(elements)
        .map_err(|e| capture_err(format!("Failed to link branch: {}", e)))?;

    let last = chain
        .last()
        .ok_or_else(|| capture_err("Empty element chain"))?;
    let mux_pad = muxer
        .request_pad_simple(pad_template)
        .ok_or_else(|| capture_err(format!("Failed to get {} pad", pad_template)))?;
    let src_pad = last
        .static_pad("src")
        .ok_or_else(|| capture_err("Failed to get encoder src pad"))?;
    src_pad
        .link(&mux_pad)
        .map_err(|e| capture_err(format!("Failed to link to muxer: {}", e)))?;
    Ok(())
}

struct GstCaptureSession {
    pipeline: gst::Pipeline,
    sources: Vec<gst_app::AppSrc>,
    forwarders: Vec<JoinHandle<()>>,
}

#[async_trait]
impl CaptureSession for GstCaptureSession {
    async fn stop(self: Box<Self>) -> Result<()> {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        for source in &self.sources {
            let _ = source.end_of_stream();
        }

        let pipeline = self.pipeline.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(bus) = pipeline.bus() {
                for msg in bus.iter_timed(gst::ClockTime::from_seconds(5)) {
                    match msg.view() {
                        gst::MessageView::Eos(_) => break,
                        gst::MessageView::Error(err) => {
                            tracing::warn!(error = %err.error(), "Pipeline error while draining");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| capture_err(format!("Failed to stop pipeline: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| ProctorError::internal(format!("Drain task failed: {}", e)))??;

        tracing::info!("Capture pipeline stopped");
        Ok(())
    }
}

/// Decodes a VP8 video track into the latest RGB frame for liveness checks.
pub struct GstFrameSource {
    pipeline: gst::Pipeline,
    latest: Arc<StdMutex<Option<Frame>>>,
    forwarder: JoinHandle<()>,
}

impl GstFrameSource {
    pub fn new(stream: &MediaStream) -> Result<Self> {
        gst::init().map_err(|e| capture_err(format!("GStreamer init failed: {}", e)))?;
        let track = stream.first_of(TrackKind::Video).ok_or(ProctorError::NoStream)?;

        let pipeline = gst::Pipeline::new();
        let appsrc = rtp_appsrc("frame_src", TrackKind::Video)?;
        let rgb_caps = gst::Caps::builder("video/x-raw").field("format", "RGB").build();
        let filter = gst::ElementFactory::make("capsfilter")
            .property("caps", &rgb_caps)
            .build()
            .map_err(|e| capture_err(format!("Failed to create capsfilter: {}", e)))?;
        let appsink = gst_app::AppSink::builder()
            .sync(false)
            .max_buffers(1)
            .drop(true)
            .build();

        let latest = Arc::new(StdMutex::new(None));
        let slot = latest.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let info =
                        gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let frame = pack_rgb(&info, map.as_slice()).ok_or(gst::FlowError::Error)?;
                    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let depay = make("rtpvp8depay")?;
        let decoder = make("vp8dec")?;
        let convert = make("videoconvert")?;
        let elements: [&gst::Element; 6] = [
            appsrc.upcast_ref(),
            &depay,
            &decoder,
            &convert,
            &filter,
            appsink.upcast_ref(),
        ];
        pipeline
            .add_many(elements)
            .map_err(|e| capture_err(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many(elements)
            .map_err(|e| capture_err(format!("Failed to link decoder: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| capture_err(format!("Failed to start decoder: {}", e)))?;

        let forwarder = forward_track(track, appsrc);
        Ok(Self {
            pipeline,
            latest,
            forwarder,
        })
    }
}

/// Copy RGB rows without stride padding.
fn pack_rgb(info: &gst_video::VideoInfo, data: &[u8]) -> Option<Frame> {
    let width = info.width();
    let height = info.height();
    let stride = usize::try_from(*info.stride().first()?).ok()?;
    let row_len = width as usize * 3;

    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(data.get(start..start + row_len)?);
    }
    Some(Frame::new(width, height, pixels))
}

#[async_trait]
impl FrameSource for GstFrameSource {
    async fn current_frame(&self) -> Result<Option<Frame>> {
        Ok(self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        self.forwarder.abort();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codecs_for_candidates() {
        let webm = codecs_for("video/webm;codecs=vp9,opus").unwrap();
        assert_eq!(webm.video_encoder, "vp9enc");
        assert_eq!(webm.muxer, "webmmux");

        let mp4 = codecs_for("video/mp4;codecs=h264,aac").unwrap();
        assert_eq!(mp4.video_encoder, "x264enc");
        assert_eq!(mp4.audio_encoder, "avenc_aac");

        assert!(codecs_for("video/ogg;codecs=theora").is_none());
    }
}
