//! Microscope state and the shared state store.
//!
//! [`MicroscopeState`] is the complete set of simulated instrument parameters at one
//! instant. The [`StateStore`] publishes it as an immutable [`Snapshot`]: writers build a
//! complete new state and swap the pointer, readers clone the pointer and are done.
//!
//! ```text
//!   TEM session ──apply(cmd)──► [write lock] build next ─► swap Arc ─► release
//!   Camera session ─read_snapshot()─► [read lock] Arc::clone ─► release ─► render
//! ```
//!
//! The lock only ever guards a pointer swap or a pointer clone, so the camera never
//! renders while holding it and a reader can never see half of a write. `parking_lot`'s
//! `RwLock` is eventually fair, so a flood of snapshot reads cannot starve writers.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::command::TemCommand;
use crate::error::{AppResult, EmulatorError};

/// Immutable, fully consistent copy of the microscope state.
pub type Snapshot = Arc<MicroscopeState>;

/// Lateral stage travel, both directions (nm).
pub const STAGE_XY_LIMIT_NM: f64 = 1_000_000.0;
/// Height travel, both directions (nm).
pub const STAGE_Z_LIMIT_NM: f64 = 500_000.0;
/// Tilt range for both tilt axes (degrees).
pub const STAGE_TILT_LIMIT_DEG: f64 = 70.0;
/// Rotation range (degrees).
pub const STAGE_ROTATION_LIMIT_DEG: f64 = 180.0;
/// Largest lens excitation value (DAC counts).
pub const LENS_VALUE_MAX: u32 = 65_535;
/// Spot size range (inclusive).
pub const SPOT_SIZE_RANGE: (u8, u8) = (1, 8);
/// Defocus range, both directions (nm).
pub const DEFOCUS_LIMIT_NM: f64 = 100_000.0;

// =============================================================================
// State components
// =============================================================================

/// Goniometer position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    /// Sample X, nm.
    pub x_nm: f64,
    /// Sample Y, nm.
    pub y_nm: f64,
    /// Height, nm.
    pub z_nm: f64,
    /// Primary tilt.
    pub alpha_deg: f64,
    /// Secondary tilt.
    pub beta_deg: f64,
    /// In-plane rotation, degrees.
    pub rotation_deg: f64,
}

/// Lens groups whose excitation can be set individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensGroup {
    /// First condenser lens.
    Condenser1,
    /// Second condenser lens.
    Condenser2,
    /// Third condenser lens.
    Condenser3,
    /// Objective lens.
    Objective,
    /// First intermediate lens.
    Intermediate1,
    /// Second intermediate lens.
    Intermediate2,
    /// Third intermediate lens.
    Intermediate3,
    /// First projector lens.
    Projector1,
    /// Second projector lens.
    Projector2,
}

impl LensGroup {
    /// Every lens group, in column order.
    pub const ALL: [LensGroup; 9] = [
        LensGroup::Condenser1,
        LensGroup::Condenser2,
        LensGroup::Condenser3,
        LensGroup::Objective,
        LensGroup::Intermediate1,
        LensGroup::Intermediate2,
        LensGroup::Intermediate3,
        LensGroup::Projector1,
        LensGroup::Projector2,
    ];
}

/// Excitation of every lens group, in DAC counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensSettings {
    /// First condenser lens.
    pub condenser1: u32,
    /// Second condenser lens.
    pub condenser2: u32,
    /// Third condenser lens.
    pub condenser3: u32,
    /// Objective lens.
    pub objective: u32,
    /// First intermediate lens.
    pub intermediate1: u32,
    /// Second intermediate lens.
    pub intermediate2: u32,
    /// Third intermediate lens.
    pub intermediate3: u32,
    /// First projector lens.
    pub projector1: u32,
    /// Second projector lens.
    pub projector2: u32,
}

impl Default for LensSettings {
    fn default() -> Self {
        let mid = LENS_VALUE_MAX / 2 + 1;
        Self {
            condenser1: mid,
            condenser2: mid,
            condenser3: mid,
            objective: mid,
            intermediate1: mid,
            intermediate2: mid,
            intermediate3: mid,
            projector1: mid,
            projector2: mid,
        }
    }
}

impl LensSettings {
    /// Current excitation of `lens`.
    pub fn get(&self, lens: LensGroup) -> u32 {
        match lens {
            LensGroup::Condenser1 => self.condenser1,
            LensGroup::Condenser2 => self.condenser2,
            LensGroup::Condenser3 => self.condenser3,
            LensGroup::Objective => self.objective,
            LensGroup::Intermediate1 => self.intermediate1,
            LensGroup::Intermediate2 => self.intermediate2,
            LensGroup::Intermediate3 => self.intermediate3,
            LensGroup::Projector1 => self.projector1,
            LensGroup::Projector2 => self.projector2,
        }
    }

    /// Mutable access to the excitation of `lens`.
    pub fn get_mut(&mut self, lens: LensGroup) -> &mut u32 {
        match lens {
            LensGroup::Condenser1 => &mut self.condenser1,
            LensGroup::Condenser2 => &mut self.condenser2,
            LensGroup::Condenser3 => &mut self.condenser3,
            LensGroup::Objective => &mut self.objective,
            LensGroup::Intermediate1 => &mut self.intermediate1,
            LensGroup::Intermediate2 => &mut self.intermediate2,
            LensGroup::Intermediate3 => &mut self.intermediate3,
            LensGroup::Projector1 => &mut self.projector1,
            LensGroup::Projector2 => &mut self.projector2,
        }
    }
}

/// Illumination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamSettings {
    /// Relative brightness, 0 (spread) to 1 (fully converged).
    pub intensity: f64,
    /// Spot size index.
    pub spot_size: u8,
    /// Defocus, nm. Negative is underfocus.
    pub defocus_nm: f64,
    /// Beam blanker engaged.
    pub blanked: bool,
}

impl Default for BeamSettings {
    fn default() -> Self {
        Self {
            intensity: 0.5,
            spot_size: 3,
            defocus_nm: 0.0,
            blanked: false,
        }
    }
}

/// Projection system mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpticsMode {
    /// Real-space image of the specimen.
    #[default]
    Imaging,
    /// Back focal plane; index selects a camera length.
    Diffraction,
}

impl fmt::Display for OpticsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpticsMode::Imaging => write!(f, "imaging"),
            OpticsMode::Diffraction => write!(f, "diffraction"),
        }
    }
}

/// Discrete mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticsSettings {
    /// Imaging or diffraction.
    pub mode: OpticsMode,
    /// Index into the magnification table (imaging) or camera-length table (diffraction).
    pub magnification_index: usize,
}

impl Default for OpticsSettings {
    fn default() -> Self {
        Self {
            mode: OpticsMode::Imaging,
            magnification_index: 10,
        }
    }
}

/// Lookup tables consumed by command validation and by the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Imaging-mode magnifications, indexed by `magnification_index`.
    pub magnifications: Vec<f64>,
    /// Diffraction-mode camera lengths in mm, indexed by `magnification_index`.
    pub camera_lengths: Vec<f64>,
    /// Physical detector pixel pitch in micrometres.
    pub pixel_size_um: f64,
    /// Electron wavelength in pm (200 kV).
    pub wavelength_pm: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            magnifications: vec![
                50.0, 80.0, 100.0, 150.0, 200.0, 250.0, 300.0, 400.0, 500.0, 600.0, 800.0,
                1_000.0, 1_200.0, 1_500.0, 2_000.0, 2_500.0, 3_000.0, 5_000.0, 8_000.0,
                10_000.0, 12_000.0, 15_000.0, 20_000.0, 25_000.0, 30_000.0, 40_000.0,
                50_000.0, 60_000.0, 80_000.0, 100_000.0,
            ],
            camera_lengths: vec![
                150.0, 200.0, 250.0, 300.0, 400.0, 500.0, 600.0, 800.0, 1_000.0, 1_200.0,
                1_500.0, 2_000.0, 2_500.0, 3_000.0,
            ],
            pixel_size_um: 14.0,
            wavelength_pm: 2.508,
        }
    }
}

impl Calibration {
    /// The table addressed by `magnification_index` in `mode`.
    pub fn table(&self, mode: OpticsMode) -> &[f64] {
        match mode {
            OpticsMode::Imaging => &self.magnifications,
            OpticsMode::Diffraction => &self.camera_lengths,
        }
    }

    /// Table value for the optics settings, if the index is in range.
    pub fn lookup(&self, optics: &OpticsSettings) -> Option<f64> {
        self.table(optics.mode).get(optics.magnification_index).copied()
    }
}

// =============================================================================
// MicroscopeState
// =============================================================================

/// The complete simulated instrument state at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroscopeState {
    /// Goniometer position.
    pub stage: StagePosition,
    /// Lens excitations.
    pub lenses: LensSettings,
    /// Illumination.
    pub beam: BeamSettings,
    /// Mode and magnification index.
    pub optics: OpticsSettings,
    /// Number of successful writes since startup.
    pub generation: u64,
}

impl MicroscopeState {
    /// Check every field against its physical bounds and the calibration tables.
    ///
    /// Returns the first violation found, naming the offending parameter.
    pub fn validate(&self, calibration: &Calibration) -> AppResult<()> {
        let s = &self.stage;
        check_range("x_nm", s.x_nm, STAGE_XY_LIMIT_NM)?;
        check_range("y_nm", s.y_nm, STAGE_XY_LIMIT_NM)?;
        check_range("z_nm", s.z_nm, STAGE_Z_LIMIT_NM)?;
        check_range("alpha_deg", s.alpha_deg, STAGE_TILT_LIMIT_DEG)?;
        check_range("beta_deg", s.beta_deg, STAGE_TILT_LIMIT_DEG)?;
        check_range("rotation_deg", s.rotation_deg, STAGE_ROTATION_LIMIT_DEG)?;

        for lens in LensGroup::ALL {
            let value = self.lenses.get(lens);
            if value > LENS_VALUE_MAX {
                return Err(EmulatorError::invalid(
                    "value",
                    format!("{lens:?} excitation {value} exceeds {LENS_VALUE_MAX}"),
                ));
            }
        }

        let b = &self.beam;
        if !b.intensity.is_finite() || !(0.0..=1.0).contains(&b.intensity) {
            return Err(EmulatorError::invalid(
                "intensity",
                format!("must be within [0, 1], got {}", b.intensity),
            ));
        }
        let (lo, hi) = SPOT_SIZE_RANGE;
        if !(lo..=hi).contains(&b.spot_size) {
            return Err(EmulatorError::invalid(
                "spot_size",
                format!("must be within [{lo}, {hi}], got {}", b.spot_size),
            ));
        }
        check_range("defocus_nm", b.defocus_nm, DEFOCUS_LIMIT_NM)?;

        let table_len = calibration.table(self.optics.mode).len();
        if self.optics.magnification_index >= table_len {
            return Err(EmulatorError::invalid(
                "magnification_index",
                format!(
                    "{} out of range for {} mode (table has {} entries)",
                    self.optics.magnification_index, self.optics.mode, table_len
                ),
            ));
        }
        Ok(())
    }
}

fn check_range(parameter: &'static str, value: f64, limit: f64) -> AppResult<()> {
    if !value.is_finite() {
        return Err(EmulatorError::invalid(parameter, "must be finite"));
    }
    if value.abs() > limit {
        return Err(EmulatorError::invalid(
            parameter,
            format!("{value} outside [-{limit}, {limit}]"),
        ));
    }
    Ok(())
}

// =============================================================================
// StateStore
// =============================================================================

/// Number of calibration entries per optics mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBounds {
    /// Entries in the magnification table.
    pub imaging: usize,
    /// Entries in the camera-length table.
    pub diffraction: usize,
}

/// Shared, concurrently readable microscope state.
///
/// The store is the only channel between the TEM and camera services.
pub struct StateStore {
    current: RwLock<Snapshot>,
    initial: Snapshot,
    calibration: Arc<Calibration>,
}

impl StateStore {
    /// Create a store holding `initial`, which must pass validation.
    pub fn new(initial: MicroscopeState, calibration: Arc<Calibration>) -> AppResult<Self> {
        initial.validate(&calibration)?;
        let initial = Arc::new(initial);
        Ok(Self {
            current: RwLock::new(Arc::clone(&initial)),
            initial,
            calibration,
        })
    }

    /// Point-in-time copy of the whole state. Never blocks on rendering.
    pub fn read_snapshot(&self) -> Snapshot {
        Arc::clone(&self.current.read())
    }

    /// Validate and apply one command atomically.
    ///
    /// On error the published state, including its generation, is unchanged.
    pub fn apply(&self, command: &TemCommand) -> AppResult<Snapshot> {
        let mut current = self.current.write();
        let mut next = command.apply_to(&current, &self.initial, &self.calibration)?;
        next.generation = current.generation + 1;
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        Ok(next)
    }

    /// Generation of the currently published state.
    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Calibration tables this store validates against.
    pub fn calibration(&self) -> &Arc<Calibration> {
        &self.calibration
    }

    /// Valid `magnification_index` range per mode.
    pub fn bounds(&self) -> IndexBounds {
        IndexBounds {
            imaging: self.calibration.table(OpticsMode::Imaging).len(),
            diffraction: self.calibration.table(OpticsMode::Diffraction).len(),
        }
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::StageUpdate;

    fn store() -> StateStore {
        StateStore::new(MicroscopeState::default(), Arc::new(Calibration::default())).unwrap()
    }

    fn move_to(x: f64) -> TemCommand {
        TemCommand::SetStagePosition(StageUpdate {
            x_nm: Some(x),
            y_nm: Some(x),
            ..Default::default()
        })
    }

    #[test]
    fn test_bounds_follow_calibration() {
        let cal = Calibration::default();
        let bounds = store().bounds();
        assert_eq!(bounds.imaging, cal.magnifications.len());
        assert_eq!(bounds.diffraction, cal.camera_lengths.len());
    }

    #[test]
    fn test_default_state_is_valid() {
        MicroscopeState::default()
            .validate(&Calibration::default())
            .unwrap();
    }

    #[test]
    fn test_new_rejects_invalid_initial_state() {
        let mut state = MicroscopeState::default();
        state.optics.magnification_index = 999;
        let err = StateStore::new(state, Arc::new(Calibration::default())).unwrap_err();
        assert!(matches!(
            err,
            EmulatorError::InvalidParameter {
                parameter: "magnification_index",
                ..
            }
        ));
    }

    #[test]
    fn test_apply_publishes_new_generation() {
        let store = store();
        assert_eq!(store.generation(), 0);

        let snap = store.apply(&move_to(1_000.0)).unwrap();
        assert_eq!(snap.generation, 1);
        assert_eq!(snap.stage.x_nm, 1_000.0);
        assert_eq!(store.read_snapshot().as_ref(), snap.as_ref());
    }

    #[test]
    fn test_failed_apply_leaves_state_untouched() {
        let store = store();
        store.apply(&move_to(5.0)).unwrap();
        let before = store.read_snapshot();

        assert!(store.apply(&move_to(STAGE_XY_LIMIT_NM * 2.0)).is_err());

        let after = store.read_snapshot();
        assert_eq!(before.as_ref(), after.as_ref());
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn test_snapshot_is_not_affected_by_later_writes() {
        let store = store();
        let old = store.read_snapshot();
        store.apply(&move_to(42.0)).unwrap();

        assert_eq!(old.stage.x_nm, 0.0);
        assert_eq!(store.read_snapshot().stage.x_nm, 42.0);
    }

    #[test]
    fn test_read_stability_without_writes() {
        let store = store();
        store.apply(&move_to(7.0)).unwrap();
        let a = store.read_snapshot();
        let b = store.read_snapshot();
        assert_eq!(a.as_ref(), b.as_ref());
    }

    #[test]
    fn test_lens_accessors_cover_every_group() {
        let mut lenses = LensSettings::default();
        for (i, lens) in LensGroup::ALL.into_iter().enumerate() {
            *lenses.get_mut(lens) = i as u32;
        }
        for (i, lens) in LensGroup::ALL.into_iter().enumerate() {
            assert_eq!(lenses.get(lens), i as u32);
        }
    }

    #[test]
    fn test_calibration_lookup() {
        let cal = Calibration::default();
        let optics = OpticsSettings {
            mode: OpticsMode::Diffraction,
            magnification_index: 0,
        };
        assert_eq!(cal.lookup(&optics), Some(150.0));

        let out_of_range = OpticsSettings {
            magnification_index: cal.camera_lengths.len(),
            ..optics
        };
        assert_eq!(cal.lookup(&out_of_range), None);
    }
}
