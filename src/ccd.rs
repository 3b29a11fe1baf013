//! CCD well-fill model
//!
//! Maps a free-electron cloud to the fraction of the pixel volume it
//! occupies, which is what decides how many traps the cloud can touch. A
//! phase is described by four numbers: the full-well depth `W`, the
//! well-notch depth `n`, the well-fill power `p`, and the first-electron
//! fill height `f`:
//!
//! ```text
//! v(q) = f + (1 - f) · clamp((q - n) / (W - n), 0, 1)^p    for q > n
//! v(q) = 0                                                  otherwise
//! ```
//!
//! so `v` saturates at 1 for `q ≥ W`. Multi-phase devices carry one phase
//! description per clock step plus the fraction of traps living in each
//! phase; the clocker calls the well-fill law once per phase step.

#![forbid(unsafe_code)]

use crate::util::clamp;

/// Errors from CCD construction.
#[derive(Debug, thiserror::Error)]
pub enum CcdError {
    /// Full-well depth must be positive.
    #[error("full well depth must be positive (got {0})")]
    BadFullWellDepth(f64),
    /// Notch depth must sit inside the well.
    #[error("well notch depth must satisfy 0 <= notch < full well (got {0})")]
    BadWellNotchDepth(f64),
    /// Well-fill power must lie in (0, 1].
    #[error("well fill power must lie in (0, 1] (got {0})")]
    BadWellFillPower(f64),
    /// First-electron fill must lie in [0, 1).
    #[error("first electron fill must lie in [0, 1) (got {0})")]
    BadFirstElectronFill(f64),
    /// A CCD needs at least one phase.
    #[error("a CCD needs at least one phase")]
    NoPhases,
    /// One trap fraction per phase.
    #[error("{n_fractions} trap fractions supplied for {n_phases} phases")]
    FractionCountMismatch {
        /// Number of fractions supplied.
        n_fractions: usize,
        /// Number of phases supplied.
        n_phases: usize,
    },
    /// Per-phase trap fractions must be non-negative and sum to 1.
    #[error("trap fractions must be non-negative and sum to 1 (sum = {0})")]
    BadTrapFractions(f64),
}

/// One clock phase of a CCD pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CcdPhase {
    /// Electrons held by a full well, `W > 0`.
    pub full_well_depth: f64,
    /// Electrons absorbed by the supplementary buried channel, `0 ≤ n < W`.
    pub well_notch_depth: f64,
    /// Exponent of the volume growth law, in `(0, 1]`.
    pub well_fill_power: f64,
    /// Volume fraction reached by the very first electron, in `[0, 1)`.
    pub first_electron_fill: f64,
}

impl CcdPhase {
    /// A validated phase description.
    pub fn new(
        full_well_depth: f64,
        well_notch_depth: f64,
        well_fill_power: f64,
        first_electron_fill: f64,
    ) -> Result<Self, CcdError> {
        if !(full_well_depth > 0.0) || !full_well_depth.is_finite() {
            return Err(CcdError::BadFullWellDepth(full_well_depth));
        }
        if !(0.0..full_well_depth).contains(&well_notch_depth) {
            return Err(CcdError::BadWellNotchDepth(well_notch_depth));
        }
        if !(well_fill_power > 0.0 && well_fill_power <= 1.0) {
            return Err(CcdError::BadWellFillPower(well_fill_power));
        }
        if !(0.0..1.0).contains(&first_electron_fill) {
            return Err(CcdError::BadFirstElectronFill(first_electron_fill));
        }
        Ok(Self { full_well_depth, well_notch_depth, well_fill_power, first_electron_fill })
    }

    /// Fraction of the pixel volume occupied by `n_electrons` free electrons.
    #[inline]
    pub fn cloud_fractional_volume_from_electrons(&self, n_electrons: f64) -> f64 {
        if !(n_electrons > self.well_notch_depth) {
            return 0.0;
        }
        let scaled = clamp(
            (n_electrons - self.well_notch_depth)
                / (self.full_well_depth - self.well_notch_depth),
            0.0,
            1.0,
        );
        self.first_electron_fill
            + (1.0 - self.first_electron_fill) * scaled.powf(self.well_fill_power)
    }
}

/// A CCD: one or more phases plus the fraction of traps in each phase.
#[derive(Clone, Debug)]
pub struct Ccd {
    phases: Vec<CcdPhase>,
    fraction_of_traps_per_phase: Vec<f64>,
}

impl Ccd {
    /// Multi-phase constructor; fractions must be non-negative and sum to 1.
    pub fn new(
        phases: Vec<CcdPhase>,
        fraction_of_traps_per_phase: Vec<f64>,
    ) -> Result<Self, CcdError> {
        if phases.is_empty() {
            return Err(CcdError::NoPhases);
        }
        if fraction_of_traps_per_phase.len() != phases.len() {
            return Err(CcdError::FractionCountMismatch {
                n_fractions: fraction_of_traps_per_phase.len(),
                n_phases: phases.len(),
            });
        }
        let sum: f64 = fraction_of_traps_per_phase.iter().sum();
        if fraction_of_traps_per_phase.iter().any(|f| *f < 0.0) || (sum - 1.0).abs() > 1e-9 {
            return Err(CcdError::BadTrapFractions(sum));
        }
        Ok(Self { phases, fraction_of_traps_per_phase })
    }

    /// The common single-phase device: all traps in the one phase.
    pub fn single_phase(phase: CcdPhase) -> Self {
        Self { phases: vec![phase], fraction_of_traps_per_phase: vec![1.0] }
    }

    /// Number of phases.
    #[inline]
    pub fn n_phases(&self) -> usize {
        self.phases.len()
    }

    /// Phase description for clock step `i`.
    #[inline]
    pub fn phase(&self, i: usize) -> &CcdPhase {
        &self.phases[i]
    }

    /// Fraction of traps living in phase `i`.
    #[inline]
    pub fn fraction_of_traps(&self, i: usize) -> f64 {
        self.fraction_of_traps_per_phase[i]
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_volume_simple_numbers() {
        let phase = CcdPhase::new(1e4, 0.0, 1.0, 0.0).unwrap();

        assert_eq!(phase.cloud_fractional_volume_from_electrons(0.0), 0.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e2), 0.01);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e3), 0.1);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e4), 1.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e5), 1.0);
    }

    #[test]
    fn cloud_volume_non_unity_power() {
        let phase = CcdPhase::new(1e4, 0.0, 0.8, 0.0).unwrap();

        assert_eq!(phase.cloud_fractional_volume_from_electrons(0.0), 0.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e2), 0.01f64.powf(0.8));
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e3), 0.1f64.powf(0.8));
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e4), 1.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e5), 1.0);
    }

    #[test]
    fn cloud_volume_with_notch() {
        let phase = CcdPhase::new(10010.0, 10.0, 1.0, 0.0).unwrap();

        assert_eq!(phase.cloud_fractional_volume_from_electrons(0.0), 0.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1.0), 0.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(10.0), 0.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(110.0), 0.01);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1010.0), 0.1);
        assert!(phase.cloud_fractional_volume_from_electrons(1e4) < 1.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e4 + 10.0), 1.0);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e5), 1.0);
    }

    #[test]
    fn first_electron_fill_lifts_small_clouds() {
        let phase = CcdPhase::new(1e4, 0.0, 1.0, 0.2).unwrap();

        assert_eq!(phase.cloud_fractional_volume_from_electrons(0.0), 0.0);
        // A single electron already reaches the first-electron fill height.
        let v = phase.cloud_fractional_volume_from_electrons(1.0);
        assert!(v > 0.2 && v < 0.2002);
        assert_eq!(phase.cloud_fractional_volume_from_electrons(1e4), 1.0);
    }

    #[test]
    fn negative_clouds_occupy_no_volume() {
        let phase = CcdPhase::new(1e4, 0.0, 1.0, 0.0).unwrap();
        assert_eq!(phase.cloud_fractional_volume_from_electrons(-12.0), 0.0);
    }

    #[test]
    fn multiphase_construction() {
        let phase = CcdPhase::new(1e4, 0.0, 1.0, 0.0).unwrap();
        let phase_2 = CcdPhase::new(2e4, 0.0, 0.8, 0.0).unwrap();

        let ccd = Ccd::single_phase(phase);
        assert_eq!(ccd.n_phases(), 1);
        assert_eq!(ccd.fraction_of_traps(0), 1.0);

        let ccd = Ccd::new(vec![phase, phase_2, phase_2], vec![0.5, 0.25, 0.25]).unwrap();
        assert_eq!(ccd.n_phases(), 3);
        assert_eq!(ccd.phase(1).full_well_depth, 2e4);
        assert_eq!(ccd.phase(2).well_fill_power, 0.8);
        assert_eq!(ccd.fraction_of_traps(0), 0.5);

        assert!(matches!(
            Ccd::new(vec![phase], vec![0.5, 0.5]),
            Err(CcdError::FractionCountMismatch { .. })
        ));
        assert!(matches!(
            Ccd::new(vec![phase, phase_2], vec![0.9, 0.2]),
            Err(CcdError::BadTrapFractions(_))
        ));
    }

    #[test]
    fn invalid_phases_are_rejected() {
        assert!(matches!(CcdPhase::new(0.0, 0.0, 1.0, 0.0), Err(CcdError::BadFullWellDepth(_))));
        assert!(matches!(
            CcdPhase::new(1e4, -1.0, 1.0, 0.0),
            Err(CcdError::BadWellNotchDepth(_))
        ));
        assert!(matches!(
            CcdPhase::new(1e4, 1e5, 1.0, 0.0),
            Err(CcdError::BadWellNotchDepth(_))
        ));
        assert!(matches!(CcdPhase::new(1e4, 0.0, 0.0, 0.0), Err(CcdError::BadWellFillPower(_))));
        assert!(matches!(CcdPhase::new(1e4, 0.0, 1.5, 0.0), Err(CcdError::BadWellFillPower(_))));
        assert!(matches!(
            CcdPhase::new(1e4, 0.0, 1.0, 1.0),
            Err(CcdError::BadFirstElectronFill(_))
        ));
    }
}
