//! TEM control commands.
//!
//! A [`TemRequest`] is what a client asked for; a [`TemCommand`] is the subset of
//! requests that write state. Every command is a pure transition
//! `(current, initial, calibration) -> next` so replaying the same sequence from the
//! same start always lands on the same state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppResult, EmulatorError};
use crate::protocol::RawRequest;
use crate::state::{
    Calibration, LensGroup, MicroscopeState, OpticsMode, LENS_VALUE_MAX, SPOT_SIZE_RANGE,
};

/// Partial stage coordinates. Absolute for `set_stage_position`, deltas for
/// `move_stage_relative`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageUpdate {
    /// Sample X, nm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_nm: Option<f64>,
    /// Sample Y, nm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_nm: Option<f64>,
    /// Height, nm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_nm: Option<f64>,
    /// Primary tilt, degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha_deg: Option<f64>,
    /// Secondary tilt, degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta_deg: Option<f64>,
    /// In-plane rotation, degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_deg: Option<f64>,
}

impl StageUpdate {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// New excitation for one lens group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LensUpdate {
    /// Which lens group to drive.
    pub lens: LensGroup,
    /// Signed so out-of-range values reach validation instead of failing to parse.
    pub value: i64,
}

/// Any subset of the beam parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeamUpdate {
    /// Relative brightness in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    /// Spot size index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_size: Option<i64>,
    /// Defocus, nm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defocus_nm: Option<f64>,
    /// Beam blanker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blanked: Option<bool>,
}

/// Mode switch and/or magnification index change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeUpdate {
    /// Target mode; `None` keeps the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OpticsMode>,
    /// Index into the target mode's calibration table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnification_index: Option<i64>,
}

/// A state-changing command.
#[derive(Debug, Clone, PartialEq)]
pub enum TemCommand {
    /// Absolute stage move.
    SetStagePosition(StageUpdate),
    /// Stage move by deltas.
    MoveStageRelative(StageUpdate),
    /// One lens group's excitation.
    SetLensValue(LensUpdate),
    /// Beam intensity, spot, defocus or blanking.
    SetBeamParameter(BeamUpdate),
    /// Optics mode and index.
    SetMode(ModeUpdate),
    /// Restore the startup state.
    Reset,
}

impl TemCommand {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            TemCommand::SetStagePosition(_) => "set_stage_position",
            TemCommand::MoveStageRelative(_) => "move_stage_relative",
            TemCommand::SetLensValue(_) => "set_lens_value",
            TemCommand::SetBeamParameter(_) => "set_beam_parameter",
            TemCommand::SetMode(_) => "set_mode",
            TemCommand::Reset => "reset",
        }
    }

    /// Compute the state that results from applying this command to `current`.
    ///
    /// The returned state has been validated. `generation` is copied from `current`;
    /// the store bumps it when it publishes.
    pub fn apply_to(
        &self,
        current: &MicroscopeState,
        initial: &MicroscopeState,
        calibration: &Calibration,
    ) -> AppResult<MicroscopeState> {
        let mut next = current.clone();

        match self {
            TemCommand::SetStagePosition(update) => {
                if update.is_empty() {
                    return Err(EmulatorError::invalid("params", "no stage axis given"));
                }
                let stage = &mut next.stage;
                assign(&mut stage.x_nm, update.x_nm);
                assign(&mut stage.y_nm, update.y_nm);
                assign(&mut stage.z_nm, update.z_nm);
                assign(&mut stage.alpha_deg, update.alpha_deg);
                assign(&mut stage.beta_deg, update.beta_deg);
                assign(&mut stage.rotation_deg, update.rotation_deg);
            }
            TemCommand::MoveStageRelative(delta) => {
                if delta.is_empty() {
                    return Err(EmulatorError::invalid("params", "no stage axis given"));
                }
                let stage = &mut next.stage;
                offset(&mut stage.x_nm, delta.x_nm);
                offset(&mut stage.y_nm, delta.y_nm);
                offset(&mut stage.z_nm, delta.z_nm);
                offset(&mut stage.alpha_deg, delta.alpha_deg);
                offset(&mut stage.beta_deg, delta.beta_deg);
                offset(&mut stage.rotation_deg, delta.rotation_deg);
            }
            TemCommand::SetLensValue(update) => {
                let value = u32::try_from(update.value)
                    .ok()
                    .filter(|v| *v <= LENS_VALUE_MAX)
                    .ok_or_else(|| {
                        EmulatorError::invalid(
                            "value",
                            format!("must be within [0, {LENS_VALUE_MAX}], got {}", update.value),
                        )
                    })?;
                *next.lenses.get_mut(update.lens) = value;
            }
            TemCommand::SetBeamParameter(update) => {
                if *update == BeamUpdate::default() {
                    return Err(EmulatorError::invalid("params", "no beam parameter given"));
                }
                let beam = &mut next.beam;
                assign(&mut beam.intensity, update.intensity);
                assign(&mut beam.defocus_nm, update.defocus_nm);
                assign(&mut beam.blanked, update.blanked);
                if let Some(spot) = update.spot_size {
                    let (lo, hi) = SPOT_SIZE_RANGE;
                    beam.spot_size = u8::try_from(spot)
                        .ok()
                        .filter(|s| (lo..=hi).contains(s))
                        .ok_or_else(|| {
                            EmulatorError::invalid(
                                "spot_size",
                                format!("must be within [{lo}, {hi}], got {spot}"),
                            )
                        })?;
                }
            }
            TemCommand::SetMode(update) => {
                if *update == ModeUpdate::default() {
                    return Err(EmulatorError::invalid("params", "no mode or index given"));
                }
                if let Some(mode) = update.mode {
                    next.optics.mode = mode;
                }
                match update.magnification_index {
                    Some(index) if index < 0 => {
                        return Err(EmulatorError::invalid(
                            "magnification_index",
                            format!("must be >= 0, got {index}"),
                        ));
                    }
                    Some(index) => {
                        next.optics.magnification_index = usize::try_from(index).map_err(|_| {
                            EmulatorError::invalid("magnification_index", "does not fit in usize")
                        })?;
                    }
                    None if next.optics.mode != current.optics.mode => {
                        // Keep the old index where the new table allows it.
                        let len = calibration.table(next.optics.mode).len();
                        next.optics.magnification_index =
                            next.optics.magnification_index.min(len.saturating_sub(1));
                    }
                    None => {}
                }
            }
            TemCommand::Reset => {
                next = initial.clone();
                next.generation = current.generation;
            }
        }

        next.validate(calibration)?;
        Ok(next)
    }
}

fn assign<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn offset(slot: &mut f64, delta: Option<f64>) {
    if let Some(d) = delta {
        *slot += d;
    }
}

// =============================================================================
// Requests and queries
// =============================================================================

/// Top-level groups of [`MicroscopeState`] that `get_state` can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    /// Goniometer position.
    Stage,
    /// Lens excitations.
    Lenses,
    /// Illumination.
    Beam,
    /// Mode and magnification index.
    Optics,
    /// Write counter.
    Generation,
}

impl StateField {
    fn key(self) -> &'static str {
        match self {
            StateField::Stage => "stage",
            StateField::Lenses => "lenses",
            StateField::Beam => "beam",
            StateField::Optics => "optics",
            StateField::Generation => "generation",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetStateParams {
    #[serde(default)]
    fields: Option<Vec<StateField>>,
}

/// Current magnification (imaging) or camera length (diffraction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnificationReading {
    /// Mode the reading applies to.
    pub mode: OpticsMode,
    /// Calibration table index.
    pub index: usize,
    /// Magnification or camera length.
    pub value: f64,
    /// `"x"` in imaging mode, `"mm"` in diffraction mode.
    pub unit: String,
}

/// Every request the TEM service understands.
#[derive(Debug, Clone, PartialEq)]
pub enum TemRequest {
    /// A write.
    Apply(TemCommand),
    /// `None` returns the whole state.
    GetState(Option<Vec<StateField>>),
    /// Current magnification or camera length.
    GetMagnification,
    /// End the session.
    Exit,
}

impl TemRequest {
    /// Interpret a decoded request.
    pub fn parse(raw: &RawRequest) -> AppResult<Self> {
        let request = match raw.name().as_str() {
            "set_stage_position" => TemRequest::Apply(TemCommand::SetStagePosition(raw.params()?)),
            "move_stage_relative" => {
                TemRequest::Apply(TemCommand::MoveStageRelative(raw.params()?))
            }
            "set_lens_value" => TemRequest::Apply(TemCommand::SetLensValue(raw.params()?)),
            "set_beam_parameter" => TemRequest::Apply(TemCommand::SetBeamParameter(raw.params()?)),
            "set_mode" => TemRequest::Apply(TemCommand::SetMode(raw.params()?)),
            "reset" => TemRequest::Apply(TemCommand::Reset),
            "get_state" => TemRequest::GetState(raw.params::<GetStateParams>()?.fields),
            "get_magnification" => TemRequest::GetMagnification,
            "exit" | "kill" => TemRequest::Exit,
            _ => return Err(EmulatorError::UnknownCommand(raw.command.clone())),
        };
        Ok(request)
    }
}

/// Project `state` down to the requested top-level fields.
pub fn query_fields(state: &MicroscopeState, fields: &[StateField]) -> AppResult<Value> {
    let full = serde_json::to_value(state)
        .map_err(|e| EmulatorError::Protocol(format!("could not encode state: {e}")))?;
    let mut out = Map::new();
    for field in fields {
        if let Some(v) = full.get(field.key()) {
            out.insert(field.key().to_string(), v.clone());
        }
    }
    Ok(Value::Object(out))
}

/// Look up the magnification or camera length for `state`.
pub fn magnification(
    state: &MicroscopeState,
    calibration: &Calibration,
) -> AppResult<MagnificationReading> {
    let value = calibration.lookup(&state.optics).ok_or_else(|| {
        EmulatorError::invalid("magnification_index", "not covered by calibration table")
    })?;
    let unit = match state.optics.mode {
        OpticsMode::Imaging => "x",
        OpticsMode::Diffraction => "mm",
    };
    Ok(MagnificationReading {
        mode: state.optics.mode,
        index: state.optics.magnification_index,
        value,
        unit: unit.to_string(),
    })
}
