//! Model-file descriptors for the command-line tools
//!
//! The CLIs describe a detector model (traps, CCD, readout schedule) in a
//! JSON file. The structs here are plain serde mirrors of that file; they
//! are *descriptors*, not the core types — deserialization cannot bypass
//! the constructors' validation, because building the core model goes
//! through the same fallible `new` paths as any other caller.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ccd::{Ccd, CcdError, CcdPhase};
use crate::roe::{Roe, RoeError};
use crate::traps::{
    TrapError, TrapInstantCapture, TrapInstantCaptureContinuum, TrapSlowCapture,
    TrapSlowCaptureContinuum, TrapSpecies,
};

/// Errors from reading or validating a model file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file is not valid JSON for the model schema.
    #[error("model file parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// A trap entry failed validation.
    #[error(transparent)]
    Trap(#[from] TrapError),
    /// The CCD description failed validation.
    #[error(transparent)]
    Ccd(#[from] CcdError),
    /// The readout schedule failed validation.
    #[error(transparent)]
    Roe(#[from] RoeError),
}

fn default_one() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_no_overscan() -> i64 {
    -1
}
fn default_dwell_times() -> Vec<f64> {
    vec![1.0]
}

/// One trap species entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrapEntry {
    /// Single lifetime, instant capture, optional occupancy band.
    InstantCapture {
        /// Traps per pixel.
        density: f64,
        /// Release timescale in clock-step units.
        release_timescale: f64,
        /// Lower band edge (default 0 = uniform).
        #[serde(default)]
        fractional_volume_none_exposed: f64,
        /// Upper band edge (default 0 = uniform).
        #[serde(default)]
        fractional_volume_full_exposed: f64,
    },
    /// Single lifetime, slow capture.
    SlowCapture {
        /// Traps per pixel.
        density: f64,
        /// Release timescale.
        release_timescale: f64,
        /// Capture timescale.
        capture_timescale: f64,
    },
    /// Lifetime continuum, instant capture.
    InstantCaptureContinuum {
        /// Traps per pixel.
        density: f64,
        /// Median release timescale.
        release_timescale: f64,
        /// Log-normal lifetime spread.
        release_timescale_sigma: f64,
    },
    /// Lifetime continuum, slow capture.
    SlowCaptureContinuum {
        /// Traps per pixel.
        density: f64,
        /// Median release timescale.
        release_timescale: f64,
        /// Log-normal lifetime spread.
        release_timescale_sigma: f64,
        /// Capture timescale.
        capture_timescale: f64,
    },
}

impl TrapEntry {
    /// Validate into a core species.
    pub fn build(&self) -> Result<TrapSpecies, TrapError> {
        Ok(match *self {
            TrapEntry::InstantCapture {
                density,
                release_timescale,
                fractional_volume_none_exposed,
                fractional_volume_full_exposed,
            } => TrapInstantCapture::with_occupancy_band(
                density,
                release_timescale,
                fractional_volume_none_exposed,
                fractional_volume_full_exposed,
            )?
            .into(),
            TrapEntry::SlowCapture { density, release_timescale, capture_timescale } => {
                TrapSlowCapture::new(density, release_timescale, capture_timescale)?.into()
            }
            TrapEntry::InstantCaptureContinuum {
                density,
                release_timescale,
                release_timescale_sigma,
            } => TrapInstantCaptureContinuum::new(
                density,
                release_timescale,
                release_timescale_sigma,
            )?
            .into(),
            TrapEntry::SlowCaptureContinuum {
                density,
                release_timescale,
                release_timescale_sigma,
                capture_timescale,
            } => TrapSlowCaptureContinuum::new(
                density,
                release_timescale,
                release_timescale_sigma,
                capture_timescale,
            )?
            .into(),
        })
    }
}

/// One CCD phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CcdPhaseFile {
    /// Electrons held by a full well.
    pub full_well_depth: f64,
    /// Notch depth (default 0).
    #[serde(default)]
    pub well_notch_depth: f64,
    /// Well-fill power (default 1).
    #[serde(default = "default_one")]
    pub well_fill_power: f64,
    /// First-electron fill height (default 0).
    #[serde(default)]
    pub first_electron_fill: f64,
}

/// The CCD description: phases plus optional per-phase trap fractions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CcdFile {
    /// Phase descriptions, one per clock step.
    pub phases: Vec<CcdPhaseFile>,
    /// Per-phase trap fractions; defaults to all traps in the only phase.
    #[serde(default)]
    pub fraction_of_traps_per_phase: Option<Vec<f64>>,
}

impl CcdFile {
    /// Validate into a core CCD.
    pub fn build(&self) -> Result<Ccd, CcdError> {
        let phases: Result<Vec<CcdPhase>, CcdError> = self
            .phases
            .iter()
            .map(|p| {
                CcdPhase::new(
                    p.full_well_depth,
                    p.well_notch_depth,
                    p.well_fill_power,
                    p.first_electron_fill,
                )
            })
            .collect();
        let phases = phases?;
        match &self.fraction_of_traps_per_phase {
            Some(fractions) => Ccd::new(phases, fractions.clone()),
            None if phases.len() == 1 => Ok(Ccd::single_phase(phases[0])),
            None => {
                let n = phases.len();
                Ccd::new(phases, vec![1.0 / n as f64; n])
            }
        }
    }
}

/// Which schedule kind the model uses.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoeKindFile {
    /// Standard readout.
    #[default]
    Standard,
    /// Charge injection.
    ChargeInjection,
    /// Trap pumping.
    TrapPumping,
}

/// The readout-electronics description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoeFile {
    /// Dwell time per clock step (default `[1.0]`).
    #[serde(default = "default_dwell_times")]
    pub dwell_times: Vec<f64>,
    /// Prescan pixels before the register (default 0).
    #[serde(default)]
    pub prescan_offset: usize,
    /// First overscan row, -1 for none (default).
    #[serde(default = "default_no_overscan")]
    pub overscan_start: i64,
    /// Reset trap states between columns (default true).
    #[serde(default = "default_true")]
    pub empty_traps_between_columns: bool,
    /// Peel first transfers into weight-1 passes (default false).
    #[serde(default)]
    pub empty_traps_for_first_transfers: bool,
    /// Release toward the dump on multi-phase devices (default false).
    #[serde(default)]
    pub force_release_away_from_readout: bool,
    /// Integer express weights (default false).
    #[serde(default)]
    pub use_integer_express_matrix: bool,
    /// Schedule kind (default standard).
    #[serde(default)]
    pub kind: RoeKindFile,
    /// Pump cycles for trap pumping (default 0).
    #[serde(default)]
    pub n_pumps: usize,
}

impl Default for RoeFile {
    fn default() -> Self {
        Self {
            dwell_times: default_dwell_times(),
            prescan_offset: 0,
            overscan_start: -1,
            empty_traps_between_columns: true,
            empty_traps_for_first_transfers: false,
            force_release_away_from_readout: false,
            use_integer_express_matrix: false,
            kind: RoeKindFile::Standard,
            n_pumps: 0,
        }
    }
}

impl RoeFile {
    /// Validate into a core schedule.
    pub fn build(&self) -> Result<Roe, RoeError> {
        match self.kind {
            RoeKindFile::Standard => Roe::new(
                self.dwell_times.clone(),
                self.prescan_offset,
                self.overscan_start,
                self.empty_traps_between_columns,
                self.empty_traps_for_first_transfers,
                self.force_release_away_from_readout,
                self.use_integer_express_matrix,
            ),
            RoeKindFile::ChargeInjection => Roe::charge_injection(
                self.dwell_times.clone(),
                self.prescan_offset,
                self.overscan_start,
                self.empty_traps_between_columns,
                self.force_release_away_from_readout,
                self.use_integer_express_matrix,
            ),
            RoeKindFile::TrapPumping => Roe::trap_pumping(
                self.dwell_times.clone(),
                self.n_pumps,
                self.empty_traps_for_first_transfers,
                self.use_integer_express_matrix,
            ),
        }
    }
}

/// A complete detector model as read from `--model FILE`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelFile {
    /// Trap species (may be empty, which makes clocking the identity).
    #[serde(default)]
    pub traps: Vec<TrapEntry>,
    /// The CCD description.
    pub ccd: CcdFile,
    /// The readout schedule (defaults to a plain single-step readout).
    #[serde(default)]
    pub roe: RoeFile,
    /// Express passes (default 0 = exact).
    #[serde(default)]
    pub express: usize,
    /// Prescan offset added at clocking time (default 0).
    #[serde(default)]
    pub offset: usize,
    /// Watermark prune threshold in electrons (default 0).
    #[serde(default)]
    pub prune_n_electrons: f64,
    /// Exchanges between prunes; 0 disables pruning (default).
    #[serde(default)]
    pub prune_frequency: usize,
}

impl ModelFile {
    /// Parse a model from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validate the trap entries into core species.
    pub fn build_traps(&self) -> Result<Vec<TrapSpecies>, ConfigError> {
        self.traps.iter().map(|t| Ok(t.build()?)).collect()
    }

    /// Validate the CCD description.
    pub fn build_ccd(&self) -> Result<Ccd, ConfigError> {
        Ok(self.ccd.build()?)
    }

    /// Validate the readout schedule.
    pub fn build_roe(&self) -> Result<Roe, ConfigError> {
        Ok(self.roe.build()?)
    }
}

impl Default for ModelFile {
    /// The demo model the CLIs fall back to: one instant-capture species
    /// with a half-life of one transfer, a plain 10k-electron well.
    fn default() -> Self {
        Self {
            traps: vec![TrapEntry::InstantCapture {
                density: 10.0,
                release_timescale: -1.0 / 0.5f64.ln(),
                fractional_volume_none_exposed: 0.0,
                fractional_volume_full_exposed: 0.0,
            }],
            ccd: CcdFile {
                phases: vec![CcdPhaseFile {
                    full_well_depth: 1e4,
                    well_notch_depth: 0.0,
                    well_fill_power: 1.0,
                    first_electron_fill: 0.0,
                }],
                fraction_of_traps_per_phase: None,
            },
            roe: RoeFile::default(),
            express: 5,
            offset: 0,
            prune_n_electrons: 0.0,
            prune_frequency: 0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
