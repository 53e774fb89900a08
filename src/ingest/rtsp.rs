//! Network stream source.
//!
//! `StreamSource` ingests frames from a network camera. Supported locations:
//! - `rtsp://` / `rtsps://` decoded with GStreamer (feature: rtsp-gstreamer)
//! - `http://` / `https://` MJPEG or JPEG snapshots (feature: stream-mjpeg)
//! - `stub://` synthetic frames for tests
//!
//! Before a real backend is built the endpoint is probed with a bounded TCP
//! connect, so an unreachable camera fails at open instead of on the first read.
//! A stream that has delivered frames and then drops ends the stream; it is not
//! reconnected.

use anyhow::{anyhow, Context, Result};
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Instant;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use url::{Host, Url};

#[cfg(feature = "stream-mjpeg")]
use super::mjpeg::MjpegStreamSource;
use super::synthetic::{is_stub, Pacer, StubParams, SyntheticScene};
use super::SourceStats;
use crate::frame::Frame;

/// Configuration for a network stream source.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Stream URL (e.g., "rtsp://192.168.1.100:554/stream").
    pub url: String,
    /// Target frame rate (frames per second). Source will decimate to this rate.
    pub target_fps: u32,
    /// Upper bound for host name resolution, for the reachability probe, and for
    /// connection setup. Each step gets the full budget.
    pub connect_timeout: Duration,
    /// Upper bound for waiting on a single frame.
    pub read_timeout: Duration,
    /// Frame width for synthetic streams.
    pub width: u32,
    /// Frame height for synthetic streams.
    pub height: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 10,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            width: 640,
            height: 480,
        }
    }
}

/// Network stream frame source.
pub struct StreamSource {
    backend: StreamBackend,
}

enum StreamBackend {
    Synthetic(SyntheticStreamSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
    #[cfg(feature = "stream-mjpeg")]
    Mjpeg(MjpegStreamSource),
}

impl StreamSource {
    pub fn new(config: StreamConfig) -> Result<Self> {
        if is_stub(&config.url) {
            return Ok(Self {
                backend: StreamBackend::Synthetic(SyntheticStreamSource::new(config)?),
            });
        }

        let url = Url::parse(&config.url).with_context(|| format!("parse stream url {}", config.url))?;
        match url.scheme() {
            "rtsp" | "rtsps" => {
                probe_endpoint(&url, config.connect_timeout)?;
                #[cfg(feature = "rtsp-gstreamer")]
                {
                    Ok(Self {
                        backend: StreamBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                    })
                }
                #[cfg(not(feature = "rtsp-gstreamer"))]
                {
                    Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
                }
            }
            "http" | "https" => {
                probe_endpoint(&url, config.connect_timeout)?;
                #[cfg(feature = "stream-mjpeg")]
                {
                    Ok(Self {
                        backend: StreamBackend::Mjpeg(MjpegStreamSource::new(config)),
                    })
                }
                #[cfg(not(feature = "stream-mjpeg"))]
                {
                    Err(anyhow!("HTTP streams require the stream-mjpeg feature"))
                }
            }
            other => Err(anyhow!(
                "unsupported stream scheme '{}'; expected rtsp(s) or http(s)",
                other
            )),
        }
    }

    /// Start receiving frames.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            StreamBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            StreamBackend::Gstreamer(source) => source.connect(),
            #[cfg(feature = "stream-mjpeg")]
            StreamBackend::Mjpeg(source) => source.connect(),
        }
    }

    /// Receive the next frame.
    pub fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            StreamBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            StreamBackend::Gstreamer(source) => source.next_frame(),
            #[cfg(feature = "stream-mjpeg")]
            StreamBackend::Mjpeg(source) => source.next_frame(),
        }
    }

    /// Frame size, when the stream announces it before the first frame.
    pub fn resolution(&self) -> Option<String> {
        match &self.backend {
            StreamBackend::Synthetic(source) => Some(source.scene.resolution()),
            #[cfg(feature = "rtsp-gstreamer")]
            StreamBackend::Gstreamer(_) => None,
            #[cfg(feature = "stream-mjpeg")]
            StreamBackend::Mjpeg(_) => None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            StreamBackend::Synthetic(source) => !source.dropped,
            #[cfg(feature = "rtsp-gstreamer")]
            StreamBackend::Gstreamer(source) => source.is_healthy(),
            #[cfg(feature = "stream-mjpeg")]
            StreamBackend::Mjpeg(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            StreamBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            StreamBackend::Gstreamer(source) => source.stats(),
            #[cfg(feature = "stream-mjpeg")]
            StreamBackend::Mjpeg(source) => source.stats(),
        }
    }

    /// Tear down the connection.
    pub fn close(&mut self) {
        match &mut self.backend {
            StreamBackend::Synthetic(source) => source.dropped = true,
            #[cfg(feature = "rtsp-gstreamer")]
            StreamBackend::Gstreamer(source) => source.close(),
            #[cfg(feature = "stream-mjpeg")]
            StreamBackend::Mjpeg(source) => source.close(),
        }
    }
}

/// Bounded TCP reachability check against the stream's host.
fn probe_endpoint(url: &Url, timeout: Duration) -> Result<()> {
    let addrs = resolve_bounded(url, timeout)?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(err) => last_err = Some((addr, err)),
        }
    }
    match last_err {
        Some((addr, err)) => Err(anyhow::Error::new(err).context(format!("connect to {}", addr))),
        None => Err(anyhow!("stream host for {} resolved to no addresses", url)),
    }
}

/// Resolve the stream host, giving up after `timeout`.
///
/// The system resolver blocks without a deadline, so names are looked up on a
/// detached thread. A lookup that outlives the timeout finishes in the
/// background and its result is discarded.
fn resolve_bounded(url: &Url, timeout: Duration) -> Result<Vec<SocketAddr>> {
    let port = url
        .port()
        .or_else(|| default_port(url.scheme()))
        .ok_or_else(|| anyhow!("no port for {}", url))?;
    let ip = match url.host() {
        Some(Host::Ipv4(ip)) => Some(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => Some(IpAddr::V6(ip)),
        Some(Host::Domain(_)) => None,
        None => return Err(anyhow!("stream url {} has no host", url)),
    };
    if let Some(ip) = ip {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    let target = url.clone();
    thread::Builder::new()
        .name("stream-resolve".to_string())
        .spawn(move || {
            let _ = tx.send(target.socket_addrs(|| Some(port)));
        })
        .context("spawn resolver thread")?;
    match rx.recv_timeout(timeout) {
        Ok(addrs) => addrs.with_context(|| format!("resolve stream host for {}", url)),
        Err(_) => Err(anyhow!(
            "resolving stream host for {} took longer than {:?}",
            url,
            timeout
        )),
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "rtsp" => Some(554),
        "rtsps" => Some(322),
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticStreamSource {
    config: StreamConfig,
    scene: SyntheticScene,
    pacer: Pacer,
    /// The connection drops after this many frames.
    fail_after: Option<u64>,
    dropped: bool,
}

impl SyntheticStreamSource {
    fn new(config: StreamConfig) -> Result<Self> {
        let params = StubParams::parse(&config.url)?;
        let fps = params.u32_or("fps", config.target_fps)?;
        let fail_after = params.u64_opt("fail_after")?;
        let scene = SyntheticScene::from_params(&params, config.width, config.height)?;
        log::debug!("synthetic stream '{}' at {} fps", params.name, fps);
        Ok(Self {
            config,
            scene,
            pacer: Pacer::new(fps),
            fail_after,
            dropped: false,
        })
    }

    fn connect(&mut self) -> Result<()> {
        log::info!("StreamSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if let Some(limit) = self.fail_after {
            if self.scene.frames_generated() >= limit {
                self.dropped = true;
            }
        }
        if self.dropped {
            return Err(anyhow!("connection to {} reset", self.config.url));
        }
        self.pacer.wait();
        self.scene.next_frame()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.scene.frames_generated(),
            location: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: StreamConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB).
    fn new(config: StreamConfig) -> Result<Self> {
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let timeout_us = config.connect_timeout.as_micros() as u64;
        let pipeline_description = format!(
            "rtspsrc location={} latency=0 tcp-timeout={} ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url, timeout_us
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        use gstreamer::prelude::*;

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.connected_at = Some(Instant::now());
        log::info!("StreamSource: connected to {} (gstreamer)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let timeout = gstreamer::ClockTime::from_nseconds(self.config.read_timeout.as_nanos() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;

        let index = self.frame_count;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(Frame::from_rgb_unchecked(pixels, width, height, index))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= self.config.connect_timeout;
        };
        last_frame_at.elapsed() <= self.config.read_timeout
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            location: self.config.url.clone(),
        }
    }

    fn close(&mut self) {
        use gstreamer::prelude::*;

        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("StreamSource: failed to stop {}: {}", self.config.url, err);
        }
    }

    fn poll_bus(&mut self) {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("RTSP stream reached end of stream".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(url: &str) -> StreamConfig {
        StreamConfig {
            url: url.to_string(),
            target_fps: 200,
            width: 16,
            height: 8,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn stream_source_produces_frames() -> Result<()> {
        let mut source = StreamSource::new(stub_config("stub://lobby"))?;
        source.connect()?;

        let frame = source.next_frame()?;
        assert_eq!(frame.width, 16);
        assert_eq!(frame.height, 8);
        assert!(source.is_healthy());

        Ok(())
    }

    #[test]
    fn synthetic_stream_drops_after_limit() -> Result<()> {
        let mut source = StreamSource::new(stub_config("stub://lobby?fail_after=2"))?;
        source.connect()?;
        source.next_frame()?;
        source.next_frame()?;
        assert!(source.next_frame().is_err());
        assert!(!source.is_healthy());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }

    #[test]
    fn literal_hosts_resolve_without_lookup() -> Result<()> {
        let url = Url::parse("rtsp://127.0.0.1/live")?;
        let addrs = resolve_bounded(&url, Duration::from_millis(1))?;
        assert_eq!(addrs, vec!["127.0.0.1:554".parse::<SocketAddr>()?]);

        let url = Url::parse("http://[::1]:8080/mjpeg")?;
        let addrs = resolve_bounded(&url, Duration::from_millis(1))?;
        assert_eq!(addrs, vec!["[::1]:8080".parse::<SocketAddr>()?]);
        Ok(())
    }

    #[test]
    fn host_names_resolve_within_timeout() -> Result<()> {
        let url = Url::parse("rtsp://localhost:8554/live")?;
        let addrs = resolve_bounded(&url, Duration::from_secs(5))?;
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|addr| addr.port() == 8554));
        Ok(())
    }

    #[test]
    fn unreachable_endpoint_fails_at_open() {
        let config = StreamConfig {
            connect_timeout: Duration::from_millis(500),
            ..stub_config("rtsp://127.0.0.1:1/stream")
        };
        let err = match StreamSource::new(config) {
            Ok(_) => panic!("port 1 should refuse connections"),
            Err(err) => err,
        };
        assert!(format!("{:#}", err).contains("127.0.0.1:1"));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(StreamSource::new(stub_config("ftp://camera/stream")).is_err());
    }

    #[test]
    fn default_ports_follow_scheme() {
        assert_eq!(default_port("rtsp"), Some(554));
        assert_eq!(default_port("https"), Some(443));
        assert_eq!(default_port("udp"), None);
    }
}
