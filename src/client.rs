//! Async clients for the TEM and camera services.
//!
//! These speak the same framing as the server and are what the integration tests
//! and any Rust-side tooling use to drive the emulator.
//!
//! ```no_run
//! # async fn demo() -> tem_emulator::error::AppResult<()> {
//! use tem_emulator::client::{CameraClient, TemClient};
//! use tem_emulator::command::StageUpdate;
//! use tem_emulator::render::AcquisitionParams;
//!
//! let mut tem = TemClient::connect("127.0.0.1:8001").await?;
//! let mut camera = CameraClient::connect("127.0.0.1:8002").await?;
//!
//! tem.set_stage_position(StageUpdate { x_nm: Some(1500.0), ..Default::default() }).await?;
//! let frame = camera.acquire(AcquisitionParams::default()).await?;
//! assert_eq!(frame.header.state.stage.x_nm, 1500.0);
//! # Ok(())
//! # }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::command::{
    BeamUpdate, LensUpdate, MagnificationReading, ModeUpdate, StageUpdate, StateField,
};
use crate::error::{AppResult, EmulatorError};
use crate::limits::MAX_FRAME_BYTES;
use crate::protocol::{read_frame, write_frame, FrameLimits, RawRequest, Response};
use crate::render::{AcquisitionParams, Image, PixelBuffer};
use crate::server::camera::{CameraInfo, FrameHeader};
use crate::state::{LensGroup, MicroscopeState, OpticsMode};

/// Default bound on any single read or write. Frame headers get their exposure on top.
pub const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the header of a frame exposed for `exposure_s`.
pub fn frame_wait(base: Duration, exposure_s: f64) -> Duration {
    let exposure = Duration::try_from_secs_f64(exposure_s).unwrap_or_default();
    base.saturating_add(exposure)
}

/// One framed connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    limits: FrameLimits,
}

impl Connection {
    /// Open a connection with the default timeouts.
    pub async fn connect(addr: impl ToSocketAddrs) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            limits: FrameLimits {
                max_frame_bytes: MAX_FRAME_BYTES,
                idle_timeout: CLIENT_IO_TIMEOUT,
                io_timeout: CLIENT_IO_TIMEOUT,
            },
        })
    }

    /// Replace the bound on each read and write.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.limits.idle_timeout = timeout;
        self.limits.io_timeout = timeout;
    }

    /// Current bound on each read and write.
    pub fn timeout(&self) -> Duration {
        self.limits.io_timeout
    }

    /// Write one frame body verbatim.
    pub async fn send_frame(&mut self, body: &[u8]) -> AppResult<()> {
        write_frame(&mut self.stream, body, self.limits.io_timeout).await
    }

    /// Read one frame; `None` when the server closed the connection.
    pub async fn recv_frame(&mut self) -> AppResult<Option<bytes::Bytes>> {
        read_frame(&mut self.stream, &self.limits).await
    }

    /// Read one response frame.
    pub async fn recv_response(&mut self) -> AppResult<Response> {
        self.recv_response_within(self.limits.idle_timeout).await
    }

    /// Read one response frame, waiting up to `wait` for it to start.
    pub async fn recv_response_within(&mut self, wait: Duration) -> AppResult<Response> {
        let limits = FrameLimits {
            idle_timeout: wait,
            ..self.limits
        };
        match read_frame(&mut self.stream, &limits).await? {
            Some(body) => Response::decode(&body),
            None => Err(EmulatorError::Protocol("connection closed by server".into())),
        }
    }

    /// Send one request without waiting for the reply.
    pub async fn send_request(&mut self, command: &str, params: Value) -> AppResult<()> {
        let request = RawRequest::new(command, params);
        self.send_frame(&request.encode()?).await
    }

    /// Send a request and wait for its response.
    pub async fn call(&mut self, command: &str, params: Value) -> AppResult<Response> {
        self.send_request(command, params).await?;
        self.recv_response().await
    }

    /// Like [`Connection::call`], but error responses become `Err` and the result is
    /// decoded into `T`.
    pub async fn call_ok<T: DeserializeOwned>(
        &mut self,
        command: &str,
        params: Value,
    ) -> AppResult<T> {
        let result = into_result(self.call(command, params).await?)?;
        decode(result)
    }

    /// Send `exit` and close.
    pub async fn close(mut self) -> AppResult<()> {
        self.send_request("exit", Value::Null).await
    }

    /// Direct access for tests that need to misbehave on the wire.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

fn into_result(response: Response) -> AppResult<Value> {
    match response {
        Response::Ok { result, .. } => Ok(result),
        Response::Error { kind, message } => Err(EmulatorError::Remote { kind, message }),
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> AppResult<T> {
    serde_json::from_value(value)
        .map_err(|e| EmulatorError::Protocol(format!("unexpected result shape: {e}")))
}

fn params(value: impl Serialize) -> AppResult<Value> {
    serde_json::to_value(value).map_err(|e| EmulatorError::Protocol(e.to_string()))
}

// =============================================================================
// TEM
// =============================================================================

/// Client for the TEM control service.
#[derive(Debug)]
pub struct TemClient {
    conn: Connection,
}

impl TemClient {
    /// Connect to a TEM control service.
    pub async fn connect(addr: impl ToSocketAddrs) -> AppResult<Self> {
        Ok(Self {
            conn: Connection::connect(addr).await?,
        })
    }

    /// Use `timeout` instead of [`CLIENT_IO_TIMEOUT`] for every call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.conn.set_timeout(timeout);
        self
    }

    /// The underlying connection.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Move the stage to absolute coordinates. Omitted axes keep their value.
    pub async fn set_stage_position(&mut self, update: StageUpdate) -> AppResult<MicroscopeState> {
        self.conn.call_ok("set_stage_position", params(update)?).await
    }

    /// Shift the stage by the given deltas.
    pub async fn move_stage_relative(&mut self, delta: StageUpdate) -> AppResult<MicroscopeState> {
        self.conn.call_ok("move_stage_relative", params(delta)?).await
    }

    /// Set one lens group's excitation.
    pub async fn set_lens_value(&mut self, lens: LensGroup, value: i64) -> AppResult<MicroscopeState> {
        self.conn
            .call_ok("set_lens_value", params(LensUpdate { lens, value })?)
            .await
    }

    /// Change beam intensity, spot size, defocus or blanking.
    pub async fn set_beam_parameter(&mut self, update: BeamUpdate) -> AppResult<MicroscopeState> {
        self.conn.call_ok("set_beam_parameter", params(update)?).await
    }

    /// Switch optics mode, optionally selecting a magnification or camera-length index.
    pub async fn set_mode(
        &mut self,
        mode: OpticsMode,
        magnification_index: Option<i64>,
    ) -> AppResult<MicroscopeState> {
        let update = ModeUpdate {
            mode: Some(mode),
            magnification_index,
        };
        self.conn.call_ok("set_mode", params(update)?).await
    }

    /// Restore the startup state.
    pub async fn reset(&mut self) -> AppResult<MicroscopeState> {
        self.conn.call_ok("reset", Value::Null).await
    }

    /// The full current state.
    pub async fn get_state(&mut self) -> AppResult<MicroscopeState> {
        self.conn.call_ok("get_state", Value::Null).await
    }

    /// Only the requested top-level groups, as raw JSON.
    pub async fn get_state_fields(&mut self, fields: &[StateField]) -> AppResult<Value> {
        self.conn
            .call_ok("get_state", json!({ "fields": fields }))
            .await
    }

    /// Current magnification or camera length.
    pub async fn get_magnification(&mut self) -> AppResult<MagnificationReading> {
        self.conn.call_ok("get_magnification", Value::Null).await
    }

    /// Send `exit` and drop the connection.
    pub async fn close(self) -> AppResult<()> {
        self.conn.close().await
    }
}

// =============================================================================
// Camera
// =============================================================================

/// A decoded frame and the header that described it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The header as sent.
    pub header: FrameHeader,
    /// Payload decoded per the header's dtype.
    pub image: Image,
}

/// Client for the camera service.
#[derive(Debug)]
pub struct CameraClient {
    conn: Connection,
}

impl CameraClient {
    /// Connect to a camera service.
    pub async fn connect(addr: impl ToSocketAddrs) -> AppResult<Self> {
        Ok(Self {
            conn: Connection::connect(addr).await?,
        })
    }

    /// Use `timeout` instead of [`CLIENT_IO_TIMEOUT`] as the base wait. Each frame
    /// header may still take its exposure time on top.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.conn.set_timeout(timeout);
        self
    }

    /// The underlying connection.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Sensor geometry and supported acquisition settings.
    pub async fn get_info(&mut self) -> AppResult<CameraInfo> {
        self.conn.call_ok("get_info", Value::Null).await
    }

    /// Acquire one frame.
    pub async fn acquire(&mut self, acquisition: AcquisitionParams) -> AppResult<Frame> {
        self.conn.send_request("acquire", params(acquisition)?).await?;
        self.next_frame(acquisition.exposure_s).await
    }

    /// Acquire `n_frames` consecutive frames.
    pub async fn acquire_movie(
        &mut self,
        acquisition: AcquisitionParams,
        n_frames: u32,
    ) -> AppResult<Vec<Frame>> {
        let mut request = params(acquisition)?;
        if let Value::Object(map) = &mut request {
            map.insert("n_frames".into(), Value::from(n_frames));
        }
        self.conn.send_request("acquire_movie", request).await?;
        let mut frames = Vec::with_capacity(n_frames as usize);
        for _ in 0..n_frames {
            frames.push(self.next_frame(acquisition.exposure_s).await?);
        }
        Ok(frames)
    }

    /// Wait for the next header, allowing for the exposure, then read its payload.
    async fn next_frame(&mut self, exposure_s: f64) -> AppResult<Frame> {
        let wait = frame_wait(self.conn.timeout(), exposure_s);
        let response = self.conn.recv_response_within(wait).await?;
        self.read_frame(response).await
    }

    /// Decode a header response and read the payload frame after it.
    async fn read_frame(&mut self, response: Response) -> AppResult<Frame> {
        let header: FrameHeader = decode(into_result(response)?)?;
        let payload = self
            .conn
            .recv_frame()
            .await?
            .ok_or_else(|| EmulatorError::Protocol("connection closed before payload".into()))?;
        if payload.len() != header.payload_bytes {
            return Err(EmulatorError::Protocol(format!(
                "payload is {} bytes, header promised {}",
                payload.len(),
                header.payload_bytes
            )));
        }
        let pixels = PixelBuffer::from_le_bytes(&payload, header.dtype)?;
        let image = Image {
            width: header.width,
            height: header.height,
            pixels,
        };
        Ok(Frame { header, image })
    }

    /// Send `exit` and drop the connection.
    pub async fn close(self) -> AppResult<()> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wait_adds_exposure() {
        let base = Duration::from_secs(1);
        assert_eq!(frame_wait(base, 2.5), Duration::from_millis(3_500));
        assert_eq!(frame_wait(base, 0.0), base);
    }

    #[test]
    fn test_frame_wait_ignores_unusable_exposure() {
        let base = Duration::from_secs(1);
        for exposure in [-1.0, f64::NAN, f64::INFINITY] {
            assert_eq!(frame_wait(base, exposure), base);
        }
    }
}
