//! Camera service: renders frames from state snapshots.
//!
//! Every acquisition takes its own snapshot, then renders on the blocking pool with
//! the store unlocked, so a slow frame never delays TEM commands. Movies are streamed:
//! each header and payload pair is written as soon as that frame is rendered.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, Instrument, Span};

use super::{Outbound, Reply, Service};
use crate::error::{AppResult, EmulatorError};
use crate::limits::{validate_frame_size, MAX_MOVIE_FRAMES};
use crate::protocol::{RawRequest, Response};
use crate::render::{
    AcquisitionParams, Image, PixelFormat, Renderer, SensorSettings, SUPPORTED_BINNINGS,
};
use crate::state::{MicroscopeState, StateStore};

/// Describes the raw payload frame that follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Frame width in binned pixels.
    pub width: u32,
    /// Frame height in binned pixels.
    pub height: u32,
    /// Pixel encoding of the payload.
    pub dtype: PixelFormat,
    /// Always `"little"`.
    pub byte_order: String,
    /// Exact length of the payload frame.
    pub payload_bytes: usize,
    /// Requested exposure in seconds.
    pub exposure_s: f64,
    /// Binning factor applied on both axes.
    pub binning: u32,
    /// Position within a movie; 0 for single acquisitions.
    pub frame_index: u32,
    /// Wall-clock time the snapshot was taken.
    pub acquired_at: DateTime<Utc>,
    /// The snapshot this frame was rendered from.
    pub state: MicroscopeState,
}

/// Reply to `get_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Unbinned sensor width.
    pub width: u32,
    /// Unbinned sensor height.
    pub height: u32,
    /// Longest accepted exposure.
    pub max_exposure_s: f64,
    /// Mean count of an unexposed pixel.
    pub dark_level: u16,
    /// Accepted binning factors.
    pub binnings: Vec<u32>,
    /// Accepted pixel encodings.
    pub dtypes: Vec<PixelFormat>,
    /// Encoding used when a request names none.
    pub default_dtype: PixelFormat,
    /// Physical pixel pitch on the detector.
    pub pixel_size_um: f64,
    /// Largest `n_frames` accepted by `acquire_movie`.
    pub max_movie_frames: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum CameraRequest {
    Acquire(AcquisitionParams),
    Movie {
        params: AcquisitionParams,
        n_frames: u32,
    },
    Info,
    Exit,
}

impl CameraRequest {
    fn parse(raw: &RawRequest) -> AppResult<Self> {
        let request = match raw.name().as_str() {
            "acquire" | "get_image" => CameraRequest::Acquire(raw.params()?),
            "acquire_movie" | "get_movie" => {
                let (params, n_frames) = movie_params(raw)?;
                CameraRequest::Movie { params, n_frames }
            }
            "get_info" | "get_camera_dimensions" => CameraRequest::Info,
            "exit" | "kill" => CameraRequest::Exit,
            _ => return Err(EmulatorError::UnknownCommand(raw.command.clone())),
        };
        Ok(request)
    }
}

/// Split `n_frames` off the movie params; the rest is an ordinary acquisition.
fn movie_params(raw: &RawRequest) -> AppResult<(AcquisitionParams, u32)> {
    let mut params = match &raw.params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        _ => return Err(EmulatorError::invalid("params", "expected an object")),
    };
    let n_frames = params
        .remove("n_frames")
        .ok_or_else(|| EmulatorError::invalid("n_frames", "missing"))?
        .as_u64()
        .ok_or_else(|| EmulatorError::invalid("n_frames", "expected a positive integer"))?;
    if n_frames == 0 || n_frames > u64::from(MAX_MOVIE_FRAMES) {
        return Err(EmulatorError::invalid(
            "n_frames",
            format!("{n_frames} outside 1..={MAX_MOVIE_FRAMES}"),
        ));
    }
    let acquisition = serde_json::from_value(Value::Object(params))
        .map_err(|e| EmulatorError::invalid("params", e.to_string()))?;
    Ok((acquisition, n_frames as u32))
}

/// Serves frames rendered from the shared state.
#[derive(Clone)]
pub struct CameraService {
    store: Arc<StateStore>,
    renderer: Arc<dyn Renderer>,
    sensor: SensorSettings,
    simulate_exposure: bool,
}

impl CameraService {
    /// A camera reading from `store` and drawing with `renderer`.
    ///
    /// With `simulate_exposure`, each acquisition waits out its exposure before
    /// rendering.
    pub fn new(
        store: Arc<StateStore>,
        renderer: Arc<dyn Renderer>,
        sensor: SensorSettings,
        simulate_exposure: bool,
    ) -> Self {
        Self {
            store,
            renderer,
            sensor,
            simulate_exposure,
        }
    }

    fn info(&self) -> CameraInfo {
        CameraInfo {
            width: self.sensor.width,
            height: self.sensor.height,
            max_exposure_s: self.sensor.max_exposure_s,
            dark_level: self.sensor.dark_level,
            binnings: SUPPORTED_BINNINGS.to_vec(),
            dtypes: PixelFormat::ALL.to_vec(),
            default_dtype: PixelFormat::default(),
            pixel_size_um: self.store.calibration().pixel_size_um,
            max_movie_frames: MAX_MOVIE_FRAMES,
        }
    }

    /// Exposures outside `(0, max_exposure_s]` are refused before any waiting.
    fn check_exposure(&self, params: &AcquisitionParams) -> AppResult<Duration> {
        let exposure = params.exposure_s;
        if !exposure.is_finite() || exposure <= 0.0 || exposure > self.sensor.max_exposure_s {
            return Err(EmulatorError::RenderFailure(format!(
                "exposure {exposure}s outside (0, {}]",
                self.sensor.max_exposure_s
            )));
        }
        Duration::try_from_secs_f64(exposure)
            .map_err(|e| EmulatorError::RenderFailure(format!("exposure {exposure}s: {e}")))
    }

    /// Snapshot, expose, render, encode.
    async fn acquire(
        &self,
        params: AcquisitionParams,
        frame_index: u32,
    ) -> AppResult<(FrameHeader, Bytes)> {
        let exposure = self.check_exposure(&params)?;
        let snapshot = self.store.read_snapshot();
        let acquired_at = Utc::now();

        if self.simulate_exposure {
            tokio::time::sleep(exposure).await;
        }

        let renderer = Arc::clone(&self.renderer);
        let state = Arc::clone(&snapshot);
        let image = tokio::task::spawn_blocking(move || renderer.render(&state, &params))
            .await
            .map_err(|e| EmulatorError::RenderFailure(format!("renderer task failed: {e}")))??;
        check_image(&image, &params)?;

        let payload = image.pixels.to_le_bytes();
        debug!(
            frame_index,
            generation = snapshot.generation,
            width = image.width,
            height = image.height,
            bytes = payload.len(),
            "frame rendered"
        );
        let header = FrameHeader {
            width: image.width,
            height: image.height,
            dtype: params.dtype,
            byte_order: "little".to_string(),
            payload_bytes: payload.len(),
            exposure_s: params.exposure_s,
            binning: params.binning,
            frame_index,
            acquired_at,
            state: (*snapshot).clone(),
        };
        Ok((header, payload))
    }

    /// Render movie frames one after another, handing each to the session as it is
    /// done. Stops at the first failure or when the session goes away.
    async fn stream_movie(
        self,
        params: AcquisitionParams,
        n_frames: u32,
        tx: mpsc::Sender<AppResult<Vec<Outbound>>>,
    ) {
        for frame_index in 0..n_frames {
            let frame = tokio::select! {
                _ = tx.closed() => break,
                frame = self.acquire(params, frame_index) => frame,
            };
            let frame = frame.map(|(header, payload)| {
                vec![
                    Outbound::Response(Response::ok(header.state.generation, &header)),
                    Outbound::Payload(payload),
                ]
            });
            let failed = frame.is_err();
            if tx.send(frame).await.is_err() || failed {
                break;
            }
        }
        debug!(n_frames, "movie finished");
    }
}

/// A renderer must hand back exactly the frame it was asked for.
fn check_image(image: &Image, params: &AcquisitionParams) -> AppResult<()> {
    let size = validate_frame_size(image.width, image.height, params.dtype.bytes_per_pixel())?;
    if image.pixels.format() != params.dtype {
        return Err(EmulatorError::RenderFailure(format!(
            "renderer produced {} pixels, {} requested",
            image.pixels.format(),
            params.dtype
        )));
    }
    if image.pixels.len() != size.pixels {
        return Err(EmulatorError::RenderFailure(format!(
            "renderer produced {} pixels for a {}x{} frame",
            image.pixels.len(),
            image.width,
            image.height
        )));
    }
    Ok(())
}

impl std::fmt::Debug for CameraService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraService")
            .field("sensor", &self.sensor)
            .field("simulate_exposure", &self.simulate_exposure)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Service for CameraService {
    fn name(&self) -> &'static str {
        "camera"
    }

    async fn handle(&self, request: RawRequest) -> AppResult<Reply> {
        match CameraRequest::parse(&request)? {
            CameraRequest::Acquire(params) => {
                let (header, payload) = self.acquire(params, 0).await?;
                let mut reply = Reply::default();
                reply.push_with_payload(Response::ok(header.state.generation, &header), payload);
                Ok(reply)
            }
            CameraRequest::Movie { params, n_frames } => {
                self.check_exposure(&params)?;
                let (tx, rx) = mpsc::channel(1);
                let movie = self.clone().stream_movie(params, n_frames, tx);
                tokio::spawn(movie.instrument(Span::current()));
                Ok(Reply::streaming(rx))
            }
            CameraRequest::Info => {
                Ok(Reply::respond(Response::ok(self.store.generation(), self.info())))
            }
            CameraRequest::Exit => Ok(Reply::close_session()),
        }
    }
}
