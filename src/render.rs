//! Frame synthesis.
//!
//! The camera service never computes pixels itself: it hands a [`Snapshot`] and the
//! client's [`AcquisitionParams`] to an injected [`Renderer`]. Renderers must be pure
//! with respect to their inputs and safe to call from several threads at once.
//!
//! [`SyntheticRenderer`] is the built-in implementation. It is not an optics
//! simulation; it produces deterministic frames whose content visibly tracks the
//! stage, the beam and the optics mode, which is what control-software tests need.
//!
//! [`Snapshot`]: crate::state::Snapshot

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{AppResult, EmulatorError};
use crate::limits::validate_frame_size;
use crate::state::{Calibration, MicroscopeState, OpticsMode};

/// Binning factors the detector supports.
pub const SUPPORTED_BINNINGS: [u32; 4] = [1, 2, 4, 8];

// =============================================================================
// Acquisition parameters
// =============================================================================

/// Pixel data type of a returned frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// One byte per pixel, clipped to 255.
    Uint8,
    /// Two bytes per pixel.
    #[default]
    Uint16,
    /// Eight bytes per pixel, unclipped.
    Float64,
}

impl PixelFormat {
    /// Every supported format.
    pub const ALL: [PixelFormat; 3] = [
        PixelFormat::Uint8,
        PixelFormat::Uint16,
        PixelFormat::Float64,
    ];

    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Uint8 => 1,
            PixelFormat::Uint16 => 2,
            PixelFormat::Float64 => 8,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Uint8 => write!(f, "uint8"),
            PixelFormat::Uint16 => write!(f, "uint16"),
            PixelFormat::Float64 => write!(f, "float64"),
        }
    }
}

/// What the detector is exposed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Beam on the detector as the microscope state dictates.
    #[default]
    Normal,
    /// Dark reference: the beam is ignored.
    Dark,
}

/// Parameters for a single exposure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquisitionParams {
    /// Exposure time in seconds.
    pub exposure_s: f64,
    /// Binning factor on both axes.
    pub binning: u32,
    /// What the frame is for.
    pub mode: AcquisitionMode,
    /// Pixel encoding of the payload.
    pub dtype: PixelFormat,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            exposure_s: 0.1,
            binning: 1,
            mode: AcquisitionMode::Normal,
            dtype: PixelFormat::Uint16,
        }
    }
}

impl Hash for AcquisitionParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.exposure_s.to_bits().hash(state);
        self.binning.hash(state);
        self.mode.hash(state);
        self.dtype.hash(state);
    }
}

/// Physical detector description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    /// Unbinned width in pixels.
    pub width: u32,
    /// Unbinned height in pixels.
    pub height: u32,
    /// Longest accepted exposure in seconds.
    pub max_exposure_s: f64,
    /// Mean counts per pixel with no beam.
    pub dark_level: u16,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            max_exposure_s: 60.0,
            dark_level: 100,
        }
    }
}

// =============================================================================
// Image data
// =============================================================================

/// Memory-efficient pixel buffer supporting multiple bit depths.
///
/// Frames are kept in their native format so a 16-bit readout is never inflated to
/// 64-bit floats on its way to the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel)
    U16(Vec<u16>),
    /// 64-bit floating point pixels (8 bytes/pixel)
    F64(Vec<f64>),
}

impl PixelBuffer {
    /// Quantize floating point counts into `format`.
    pub fn from_counts(counts: &[f64], format: PixelFormat) -> Self {
        match format {
            PixelFormat::Uint8 => {
                PixelBuffer::U8(counts.iter().map(|&c| c.round().clamp(0.0, 255.0) as u8).collect())
            }
            PixelFormat::Uint16 => PixelBuffer::U16(
                counts
                    .iter()
                    .map(|&c| c.round().clamp(0.0, f64::from(u16::MAX)) as u16)
                    .collect(),
            ),
            PixelFormat::Float64 => PixelBuffer::F64(counts.to_vec()),
        }
    }

    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
            PixelBuffer::F64(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the memory size in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.len() * self.format().bytes_per_pixel()
    }

    /// The pixel data type.
    pub fn format(&self) -> PixelFormat {
        match self {
            PixelBuffer::U8(_) => PixelFormat::Uint8,
            PixelBuffer::U16(_) => PixelFormat::Uint16,
            PixelBuffer::F64(_) => PixelFormat::Float64,
        }
    }

    /// Row-major little-endian bytes, as sent on the wire.
    pub fn to_le_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.memory_bytes());
        match self {
            PixelBuffer::U8(data) => out.put_slice(data),
            PixelBuffer::U16(data) => data.iter().for_each(|&v| out.put_u16_le(v)),
            PixelBuffer::F64(data) => data.iter().for_each(|&v| out.put_f64_le(v)),
        }
        out.freeze()
    }

    /// Decode wire bytes produced by [`PixelBuffer::to_le_bytes`].
    pub fn from_le_bytes(bytes: &[u8], format: PixelFormat) -> AppResult<Self> {
        if bytes.len() % format.bytes_per_pixel() != 0 {
            return Err(EmulatorError::Protocol(format!(
                "{} payload bytes is not a whole number of {format} pixels",
                bytes.len()
            )));
        }
        let buffer = match format {
            PixelFormat::Uint8 => PixelBuffer::U8(bytes.to_vec()),
            PixelFormat::Uint16 => PixelBuffer::U16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            PixelFormat::Float64 => PixelBuffer::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        f64::from_le_bytes(b)
                    })
                    .collect(),
            ),
        };
        Ok(buffer)
    }

    /// Mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let sum: f64 = match self {
            PixelBuffer::U8(data) => data.iter().map(|&v| f64::from(v)).sum(),
            PixelBuffer::U16(data) => data.iter().map(|&v| f64::from(v)).sum(),
            PixelBuffer::F64(data) => data.iter().sum(),
        };
        sum / self.len() as f64
    }
}

/// A rendered frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row-major pixel data.
    pub pixels: PixelBuffer,
}

// =============================================================================
// Renderer capability
// =============================================================================

/// Maps a state snapshot and acquisition parameters to a frame.
///
/// Implementations must not keep or mutate the state they are given and must be
/// callable concurrently.
pub trait Renderer: Send + Sync + 'static {
    /// Produce one frame, or fail with [`EmulatorError::RenderFailure`].
    fn render(&self, state: &MicroscopeState, params: &AcquisitionParams) -> AppResult<Image>;
}

impl<F> Renderer for F
where
    F: Fn(&MicroscopeState, &AcquisitionParams) -> AppResult<Image> + Send + Sync + 'static,
{
    fn render(&self, state: &MicroscopeState, params: &AcquisitionParams) -> AppResult<Image> {
        self(state, params)
    }
}

// =============================================================================
// SyntheticRenderer
// =============================================================================

/// Specimen lattice period in the sample plane (nm).
const PARTICLE_PITCH_NM: f64 = 2_000.0;
/// Particle radius (nm).
const PARTICLE_RADIUS_NM: f64 = 450.0;
/// Fraction of the beam a particle transmits.
const PARTICLE_TRANSMISSION: f64 = 0.35;
/// Crystal lattice spacing used for diffraction spots (nm).
const D_SPACING_NM: f64 = 0.4;
/// Tilt at which reflections have lost most of their intensity (degrees).
const EXCITATION_WIDTH_DEG: f64 = 3.0;
/// Reflections closer than this merge into one blob and are not drawn.
const MIN_SPOT_SPACING_PX: f64 = 1.0;
/// Counts per second per pixel at full intensity, spot size 1, no binning.
const FULL_FLUX: f64 = 20_000.0;
/// Peak-to-peak read noise in counts.
const READ_NOISE: f64 = 4.0;

/// Deterministic stand-in for a real image simulation.
///
/// * Imaging mode shows a square lattice of absorbing particles. The field of view
///   follows the stage position and rotation, scales with magnification, and particle
///   edges soften with defocus.
/// * Diffraction mode shows a central beam plus a square lattice of reflections whose
///   spacing follows the camera length and whose intensity falls off with tilt.
/// * A blanked beam or a dark acquisition yields the dark level plus read noise.
///
/// Noise is seeded from the inputs, so identical inputs give identical frames.
#[derive(Debug, Clone)]
pub struct SyntheticRenderer {
    sensor: SensorSettings,
    calibration: Arc<Calibration>,
}

impl SyntheticRenderer {
    /// Create a renderer for the given detector and calibration.
    pub fn new(sensor: SensorSettings, calibration: Arc<Calibration>) -> Self {
        Self {
            sensor,
            calibration,
        }
    }

    /// The detector this renderer simulates.
    pub fn sensor(&self) -> &SensorSettings {
        &self.sensor
    }

    fn check_params(&self, params: &AcquisitionParams) -> AppResult<(u32, u32)> {
        let exposure = params.exposure_s;
        if !exposure.is_finite() || exposure <= 0.0 || exposure > self.sensor.max_exposure_s {
            return Err(EmulatorError::RenderFailure(format!(
                "exposure {exposure}s outside (0, {}]",
                self.sensor.max_exposure_s
            )));
        }
        if !SUPPORTED_BINNINGS.contains(&params.binning) {
            return Err(EmulatorError::RenderFailure(format!(
                "binning {} not one of {SUPPORTED_BINNINGS:?}",
                params.binning
            )));
        }
        if self.sensor.width % params.binning != 0 || self.sensor.height % params.binning != 0 {
            return Err(EmulatorError::RenderFailure(format!(
                "binning {} does not divide the {}x{} sensor",
                params.binning, self.sensor.width, self.sensor.height
            )));
        }
        Ok((self.sensor.width / params.binning, self.sensor.height / params.binning))
    }

    fn seed(state: &MicroscopeState, params: &AcquisitionParams) -> u64 {
        let mut h = DefaultHasher::new();
        let s = &state.stage;
        for v in [s.x_nm, s.y_nm, s.z_nm, s.alpha_deg, s.beta_deg, s.rotation_deg] {
            v.to_bits().hash(&mut h);
        }
        state.lenses.objective.hash(&mut h);
        state.beam.intensity.to_bits().hash(&mut h);
        state.beam.spot_size.hash(&mut h);
        state.beam.defocus_nm.to_bits().hash(&mut h);
        state.beam.blanked.hash(&mut h);
        state.optics.magnification_index.hash(&mut h);
        (state.optics.mode == OpticsMode::Diffraction).hash(&mut h);
        params.hash(&mut h);
        h.finish()
    }

    /// Beam counts per (binned) pixel for this exposure.
    fn flux(state: &MicroscopeState, params: &AcquisitionParams) -> f64 {
        let binning = f64::from(params.binning);
        FULL_FLUX * state.beam.intensity * params.exposure_s * binning * binning
            / f64::from(state.beam.spot_size)
    }

    fn render_imaging(
        &self,
        state: &MicroscopeState,
        params: &AcquisitionParams,
        (w, h): (u32, u32),
        counts: &mut [f64],
    ) -> AppResult<()> {
        let magnification = self.lookup(state)?;
        let pixel_nm =
            self.calibration.pixel_size_um * 1_000.0 * f64::from(params.binning) / magnification;
        let (sin, cos) = state.stage.rotation_deg.to_radians().sin_cos();
        let flux = Self::flux(state, params);
        let edge_nm = 10.0 + state.beam.defocus_nm.abs() / 50.0;
        let (cx, cy) = (f64::from(w) / 2.0, f64::from(h) / 2.0);

        for row in 0..h {
            for col in 0..w {
                let dx = (f64::from(col) + 0.5 - cx) * pixel_nm;
                let dy = (f64::from(row) + 0.5 - cy) * pixel_nm;
                let sx = state.stage.x_nm + dx * cos - dy * sin;
                let sy = state.stage.y_nm + dx * sin + dy * cos;

                let lx = sx - (sx / PARTICLE_PITCH_NM).round() * PARTICLE_PITCH_NM;
                let ly = sy - (sy / PARTICLE_PITCH_NM).round() * PARTICLE_PITCH_NM;
                let r = (lx * lx + ly * ly).sqrt();
                // 0 inside the particle, 1 outside, smooth edge
                let outside = ((r - PARTICLE_RADIUS_NM) / edge_nm).clamp(-1.0, 1.0) * 0.5 + 0.5;
                let transmission = PARTICLE_TRANSMISSION + (1.0 - PARTICLE_TRANSMISSION) * outside;

                counts[(row * w + col) as usize] += flux * transmission;
            }
        }
        Ok(())
    }

    fn render_diffraction(
        &self,
        state: &MicroscopeState,
        params: &AcquisitionParams,
        (w, h): (u32, u32),
        counts: &mut [f64],
    ) -> AppResult<()> {
        let camera_length_mm = self.lookup(state)?;
        let binning = f64::from(params.binning);
        let pitch_nm = self.calibration.pixel_size_um * 1_000.0 * binning;
        let wavelength_nm = self.calibration.wavelength_pm / 1_000.0;
        let spacing_px = camera_length_mm * 1.0e6 * wavelength_nm / D_SPACING_NM / pitch_nm;
        if !spacing_px.is_finite() || spacing_px < MIN_SPOT_SPACING_PX {
            return Err(EmulatorError::RenderFailure(format!(
                "reflection spacing {spacing_px} px at camera length {camera_length_mm} mm is not drawable"
            )));
        }

        let (sin, cos) = state.stage.rotation_deg.to_radians().sin_cos();
        let tilt2 = state.stage.alpha_deg.powi(2) + state.stage.beta_deg.powi(2);
        let excitation = (-tilt2 / (2.0 * EXCITATION_WIDTH_DEG.powi(2))).exp();
        // Total beam flux concentrated into spots.
        let total = Self::flux(state, params) * 400.0;
        let sigma = (0.6 + 0.4 * f64::from(state.beam.spot_size)) / binning.sqrt();
        let (cx, cy) = (f64::from(w) / 2.0, f64::from(h) / 2.0);

        let reach = (f64::from(w.max(h)) / spacing_px).ceil() as i64 + 1;
        for hk in -reach..=reach {
            for kk in -reach..=reach {
                let central = hk == 0 && kk == 0;
                let g = ((hk * hk + kk * kk) as f64).sqrt();
                let peak = if central {
                    total
                } else {
                    total * 0.05 * excitation / (1.0 + g * g)
                };
                let (gx, gy) = (hk as f64 * spacing_px, kk as f64 * spacing_px);
                let px = cx + gx * cos - gy * sin;
                let py = cy + gx * sin + gy * cos;
                splat(counts, (w, h), (px, py), sigma, peak);
            }
        }
        Ok(())
    }

    fn lookup(&self, state: &MicroscopeState) -> AppResult<f64> {
        self.calibration.lookup(&state.optics).ok_or_else(|| {
            EmulatorError::RenderFailure(format!(
                "magnification index {} has no calibration entry in {} mode",
                state.optics.magnification_index, state.optics.mode
            ))
        })
    }
}

/// Add a normalized Gaussian of integral `amount` centred on (`px`, `py`).
fn splat(counts: &mut [f64], (w, h): (u32, u32), (px, py): (f64, f64), sigma: f64, amount: f64) {
    let radius = (4.0 * sigma).ceil();
    let (x0, x1) = ((px - radius).floor().max(0.0), (px + radius).ceil().min(f64::from(w) - 1.0));
    let (y0, y1) = ((py - radius).floor().max(0.0), (py + radius).ceil().min(f64::from(h) - 1.0));
    if x0 > x1 || y0 > y1 {
        return;
    }
    let norm = amount / (2.0 * std::f64::consts::PI * sigma * sigma);
    for row in y0 as u32..=y1 as u32 {
        for col in x0 as u32..=x1 as u32 {
            let dx = f64::from(col) + 0.5 - px;
            let dy = f64::from(row) + 0.5 - py;
            counts[(row * w + col) as usize] +=
                norm * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
        }
    }
}

impl Renderer for SyntheticRenderer {
    fn render(&self, state: &MicroscopeState, params: &AcquisitionParams) -> AppResult<Image> {
        let (w, h) = self.check_params(params)?;
        let size = validate_frame_size(w, h, params.dtype.bytes_per_pixel())?;

        let mut counts = vec![f64::from(self.sensor.dark_level); size.pixels];

        let beam_on = params.mode == AcquisitionMode::Normal && !state.beam.blanked;
        if beam_on {
            match state.optics.mode {
                OpticsMode::Imaging => self.render_imaging(state, params, (w, h), &mut counts)?,
                OpticsMode::Diffraction => {
                    self.render_diffraction(state, params, (w, h), &mut counts)?
                }
            }
        }

        let mut rng = StdRng::seed_from_u64(Self::seed(state, params));
        let half = READ_NOISE / 2.0;
        for c in counts.iter_mut() {
            *c += rng.gen_range(-half..=half);
        }

        Ok(Image {
            width: w,
            height: h,
            pixels: PixelBuffer::from_counts(&counts, params.dtype),
        })
    }
}
