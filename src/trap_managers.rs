//! The watermark engine
//!
//! A trap manager owns the trap occupancy of one column (for one CCD
//! phase) as a stack of horizontal strata, the *watermarks*. Row `w` has a
//! volume height `h[w]` and one fill fraction per species; only the first
//! `n_active` rows carry meaning. Heights stack from the well bottom to
//! the highest cloud apex seen since the last reset, and their running sum
//! never exceeds 1.
//!
//! Per pixel-to-pixel transfer the manager performs one exchange with the
//! free charge cloud:
//!
//! 1. every filled stratum releases toward the cloud (the release estimate
//!    sets the cloud volume, so electrons freed mid-transfer count);
//! 2. the stratum straddling the cloud surface is split there, so a row
//!    boundary always lands exactly on the cloud volume;
//! 3. strata in contact with the cloud capture up to their species'
//!    target fill — instantly to 1, or by the fill-probability solution of
//!    the capture/release rate equation for slow species — scaled down if
//!    the cloud does not hold enough electrons;
//! 4. the returned Δ is released − captured, computed as the exact change
//!    in trapped charge.
//!
//! The table is pre-sized to `max_n_transfers · n_watermarks_per_transfer
//! + 1` rows and never reallocates inside the clocking loop; exceeding it
//! is a logic error and aborts the exchange. Snapshots
//! (`store_trap_states` / `restore_trap_states`) let the clocker rewind
//! between express passes.

#![forbid(unsafe_code)]

use crate::ccd::{Ccd, CcdPhase};
use crate::roe::Roe;
use crate::traps::{CaptureTables, TrapSpecies};

/// Fills closer than this merge into one stratum.
const FILL_MERGE_TOLERANCE: f64 = 1e-12;

/// Errors from the watermark engine.
#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    /// The pre-sized table ran out of rows; `max_n_transfers` was wrong.
    #[error("watermark overflow: {n_active} rows active at capacity {capacity}")]
    Overflow {
        /// Active rows when the overflow hit.
        n_active: usize,
        /// Pre-allocated row capacity.
        capacity: usize,
    },
    /// The well-fill model produced a non-finite cloud volume.
    #[error("non-finite cloud volume from {n_electrons} free electrons")]
    NonFiniteVolume {
        /// Free electrons (including the release estimate).
        n_electrons: f64,
    },
    /// A fill fraction or the exchange total went non-finite.
    #[error("non-finite electron exchange")]
    NonFiniteExchange,
    /// Managers must be sized for at least one transfer.
    #[error("max_n_transfers must be positive")]
    BadMaxTransfers,
    /// One dwell time per CCD phase.
    #[error("readout schedule has {n_steps} clock steps but the CCD has {n_phases} phases")]
    PhaseMismatch {
        /// Clock steps in the schedule.
        n_steps: usize,
        /// Phases in the CCD description.
        n_phases: usize,
    },
}

// ============================================================================
// Per-species dwell caches
// ============================================================================

/// One species plus everything that depends on the dwell time.
#[derive(Clone, Debug)]
struct SpeciesClock {
    species: TrapSpecies,
    /// Fill reached within one dwell by an empty trap in the cloud.
    fill_probability_from_empty: f64,
    /// Fill kept within one dwell by a full trap in the cloud.
    fill_probability_from_full: f64,
    /// Fill surviving one dwell of pure release.
    fill_probability_from_release: f64,
    /// Per-dwell capture table (slow-capture continuum only).
    capture_tables: Option<CaptureTables>,
    dwell_time: f64,
}

impl SpeciesClock {
    fn new(species: TrapSpecies) -> Self {
        let mut clock = Self {
            species,
            fill_probability_from_empty: 1.0,
            fill_probability_from_full: 1.0,
            fill_probability_from_release: 1.0,
            capture_tables: None,
            dwell_time: 1.0,
        };
        clock.set_dwell_time(1.0);
        clock
    }

    fn set_dwell_time(&mut self, dwell_time: f64) {
        self.dwell_time = dwell_time;
        match &self.species {
            TrapSpecies::InstantCapture(t) => {
                let survive = (-t.release_rate * dwell_time).exp();
                self.fill_probability_from_empty = 1.0;
                self.fill_probability_from_full = survive;
                self.fill_probability_from_release = survive;
            }
            TrapSpecies::SlowCapture(t) => {
                let total_rate = t.capture_rate + t.release_rate;
                let exponential_factor =
                    (1.0 - (-total_rate * dwell_time).exp()) / total_rate;
                self.fill_probability_from_empty = t.capture_rate * exponential_factor;
                self.fill_probability_from_full = 1.0 - t.release_rate * exponential_factor;
                self.fill_probability_from_release = (-t.release_rate * dwell_time).exp();
            }
            TrapSpecies::InstantCaptureContinuum(_) => {
                self.fill_probability_from_empty = 1.0;
            }
            TrapSpecies::SlowCaptureContinuum(t) => {
                self.capture_tables = Some(t.prep_capture_tables(dwell_time));
            }
        }
    }

    #[inline]
    fn density(&self) -> f64 {
        self.species.density()
    }

    #[inline]
    fn exposure(&self, bottom: f64, top: f64) -> f64 {
        self.species.exposure_fraction(bottom, top)
    }

    /// Fill left after one dwell of pure release, starting from `fill`.
    #[inline]
    fn fill_after_release(&self, fill: f64) -> f64 {
        match &self.species {
            TrapSpecies::InstantCapture(_) | TrapSpecies::SlowCapture(_) => {
                fill * self.fill_probability_from_release
            }
            TrapSpecies::InstantCaptureContinuum(t) => {
                t.tables().fill_after_release(fill, self.dwell_time)
            }
            TrapSpecies::SlowCaptureContinuum(t) => {
                t.tables().fill_after_release(fill, self.dwell_time)
            }
        }
    }

    /// Fill a cloud-contact stratum heads for, from the pre-dwell `fill`.
    #[inline]
    fn capture_target(&self, fill: f64) -> f64 {
        match &self.species {
            TrapSpecies::InstantCapture(_) | TrapSpecies::InstantCaptureContinuum(_) => 1.0,
            TrapSpecies::SlowCapture(_) => {
                fill * self.fill_probability_from_full
                    + (1.0 - fill) * self.fill_probability_from_empty
            }
            TrapSpecies::SlowCaptureContinuum(t) => {
                let time_elapsed = t.tables().time_elapsed_from_fill_fraction(fill);
                match &self.capture_tables {
                    Some(tables) => tables.fill_fraction_after_slow_capture(time_elapsed),
                    None => t.fill_fraction_after_slow_capture(time_elapsed, self.dwell_time),
                }
            }
        }
    }
}

// ============================================================================
// The trap manager
// ============================================================================

/// Watermark table for one species set and one CCD phase.
#[derive(Clone, Debug)]
pub struct TrapManager {
    clocks: Vec<SpeciesClock>,
    n_species: usize,
    /// Transfers the pre-sized table must survive between resets.
    pub max_n_transfers: usize,
    /// Rows a single transfer can add (1, or 2 with slow-capture species).
    pub n_watermarks_per_transfer: usize,
    /// Pre-allocated row capacity.
    pub n_watermarks: usize,
    n_active: usize,
    heights: Vec<f64>,
    fills: Vec<f64>,
    saved_n_active: usize,
    saved_heights: Vec<f64>,
    saved_fills: Vec<f64>,
    scratch_release: Vec<f64>,
    scratch_target: Vec<f64>,
}

impl TrapManager {
    /// A manager sized for `max_n_transfers` transfers between resets.
    pub fn new(traps: &[TrapSpecies], max_n_transfers: usize) -> Result<Self, WatermarkError> {
        if max_n_transfers == 0 {
            return Err(WatermarkError::BadMaxTransfers);
        }
        let n_species = traps.len();
        let n_watermarks_per_transfer =
            traps.iter().map(|t| t.watermarks_per_transfer()).max().unwrap_or(1);
        let n_watermarks = max_n_transfers * n_watermarks_per_transfer + 1;
        Ok(Self {
            clocks: traps.iter().cloned().map(SpeciesClock::new).collect(),
            n_species,
            max_n_transfers,
            n_watermarks_per_transfer,
            n_watermarks,
            n_active: 0,
            heights: vec![0.0; n_watermarks],
            fills: vec![0.0; n_watermarks * n_species],
            saved_n_active: 0,
            saved_heights: vec![0.0; n_watermarks],
            saved_fills: vec![0.0; n_watermarks * n_species],
            scratch_release: vec![0.0; n_watermarks * n_species],
            scratch_target: vec![0.0; n_watermarks * n_species],
        })
    }

    /// Recompute the per-species release and capture caches for one dwell.
    pub fn set_fill_probabilities_from_dwell_time(&mut self, dwell_time: f64) {
        for clock in &mut self.clocks {
            clock.set_dwell_time(dwell_time);
        }
    }

    /// Number of meaningful watermark rows.
    #[inline]
    pub fn n_active_watermarks(&self) -> usize {
        self.n_active
    }

    /// Total electrons currently held in traps.
    pub fn n_trapped_electrons(&self) -> f64 {
        let s = self.n_species;
        let mut total = 0.0;
        let mut bottom = 0.0;
        for w in 0..self.n_active {
            let height = self.heights[w];
            let top = bottom + height;
            for (i, clock) in self.clocks.iter().enumerate() {
                total += clock.density()
                    * clock.exposure(bottom, top)
                    * height
                    * self.fills[w * s + i];
            }
            bottom = top;
        }
        total
    }

    /// Forget all trapped charge.
    pub fn reset_trap_states(&mut self) {
        self.n_active = 0;
    }

    /// Snapshot the watermark table for a later [`Self::restore_trap_states`].
    pub fn store_trap_states(&mut self) {
        self.saved_n_active = self.n_active;
        self.saved_heights[..self.n_active].copy_from_slice(&self.heights[..self.n_active]);
        let n = self.n_active * self.n_species;
        self.saved_fills[..n].copy_from_slice(&self.fills[..n]);
    }

    /// Rewind to the last snapshot (the empty state if none was taken).
    pub fn restore_trap_states(&mut self) {
        self.n_active = self.saved_n_active;
        self.heights[..self.n_active].copy_from_slice(&self.saved_heights[..self.n_active]);
        let n = self.n_active * self.n_species;
        self.fills[..n].copy_from_slice(&self.saved_fills[..n]);
    }

    /// Release from every stratum, committing the new fills.
    ///
    /// Returns the electrons freed. The exchange uses this internally; it
    /// is public because release alone is a meaningful half-step when
    /// charge moves without a cloud to capture from.
    pub fn n_electrons_released(&mut self) -> f64 {
        let s = self.n_species;
        let mut total = 0.0;
        let mut bottom = 0.0;
        for w in 0..self.n_active {
            let height = self.heights[w];
            let top = bottom + height;
            for (i, clock) in self.clocks.iter().enumerate() {
                let fill = self.fills[w * s + i];
                if fill > 0.0 {
                    let after = clock.fill_after_release(fill);
                    total += clock.density() * clock.exposure(bottom, top) * height
                        * (fill - after);
                    self.fills[w * s + i] = after;
                }
            }
            bottom = top;
        }
        total
    }

    /// One release-and-capture exchange with a cloud of `n_free_electrons`.
    ///
    /// Returns released − captured, to be added to the pixel (scaled by the
    /// express weight). Negative inputs leave the watermarks untouched
    /// unless `allow_negative_pixels` is set, in which case the cloud
    /// occupies no volume but release still proceeds.
    pub fn n_electrons_released_and_captured(
        &mut self,
        n_free_electrons: f64,
        phase: &CcdPhase,
        allow_negative_pixels: bool,
    ) -> Result<f64, WatermarkError> {
        if self.n_species == 0 {
            return Ok(0.0);
        }
        if !n_free_electrons.is_finite() {
            return Err(WatermarkError::NonFiniteVolume { n_electrons: n_free_electrons });
        }
        if n_free_electrons < 0.0 && !allow_negative_pixels {
            return Ok(0.0);
        }

        let s = self.n_species;

        // Release estimate; the freed electrons join the cloud before the
        // volume is evaluated. Fills are not committed yet.
        let mut n_released = 0.0;
        let mut bottom = 0.0;
        for w in 0..self.n_active {
            let height = self.heights[w];
            let top = bottom + height;
            for (i, clock) in self.clocks.iter().enumerate() {
                let fill = self.fills[w * s + i];
                if fill > 0.0 {
                    n_released += clock.density() * clock.exposure(bottom, top) * height
                        * (fill - clock.fill_after_release(fill));
                }
            }
            bottom = top;
        }
        let apex = bottom;

        let n_cloud = n_free_electrons + n_released;
        let cloud_volume = phase.cloud_fractional_volume_from_electrons(n_cloud);
        if !cloud_volume.is_finite() {
            return Err(WatermarkError::NonFiniteVolume { n_electrons: n_cloud });
        }

        let trapped_before = self.n_trapped_electrons();

        // Align a row boundary with the cloud surface.
        if cloud_volume > 0.0 {
            if cloud_volume > apex {
                self.append_row(cloud_volume - apex)?;
            } else {
                let mut row_bottom = 0.0;
                for w in 0..self.n_active {
                    let row_top = row_bottom + self.heights[w];
                    if cloud_volume > row_bottom && cloud_volume < row_top {
                        self.split_row(w, cloud_volume - row_bottom)?;
                        break;
                    }
                    if row_top >= cloud_volume {
                        break;
                    }
                    row_bottom = row_top;
                }
            }
        }

        // Per-row release results and capture targets, plus the total
        // capture increment the cloud is asked for.
        let mut capture_total = 0.0;
        let mut row_bottom = 0.0;
        for w in 0..self.n_active {
            let height = self.heights[w];
            let row_top = row_bottom + height;
            let submerged = row_bottom < cloud_volume;
            for (i, clock) in self.clocks.iter().enumerate() {
                let fill = self.fills[w * s + i];
                let after_release = clock.fill_after_release(fill);
                self.scratch_release[w * s + i] = after_release;
                if submerged {
                    let target = clock.capture_target(fill);
                    self.scratch_target[w * s + i] = target;
                    capture_total += clock.density()
                        * clock.exposure(row_bottom, row_top)
                        * height
                        * (target - after_release);
                }
            }
            row_bottom = row_top;
        }

        // The cloud cannot hand over more electrons than it holds.
        let available = n_cloud.max(0.0);
        let enough = if capture_total > available && capture_total > 0.0 {
            available / capture_total
        } else {
            1.0
        };

        // Commit: contact strata move toward their target, the rest just
        // release.
        let mut row_bottom = 0.0;
        for w in 0..self.n_active {
            let row_top = row_bottom + self.heights[w];
            let submerged = row_bottom < cloud_volume;
            for i in 0..s {
                let after_release = self.scratch_release[w * s + i];
                self.fills[w * s + i] = if submerged {
                    after_release + enough * (self.scratch_target[w * s + i] - after_release)
                } else {
                    after_release
                };
            }
            row_bottom = row_top;
        }

        let trapped_after = self.n_trapped_electrons();
        let delta = trapped_before - trapped_after;
        if !delta.is_finite() {
            return Err(WatermarkError::NonFiniteExchange);
        }
        self.merge_adjacent_rows();
        Ok(delta)
    }

    /// Fold strata holding fewer than `n_electrons_threshold` electrons
    /// into the stratum below. Lossy; callers bound the error by choosing
    /// the threshold.
    pub fn prune_watermarks(&mut self, n_electrons_threshold: f64) {
        if n_electrons_threshold <= 0.0 {
            return;
        }
        let s = self.n_species;
        let mut w = 1;
        while w < self.n_active {
            let bottom: f64 = self.heights[..w].iter().sum();
            let top = bottom + self.heights[w];
            let content: f64 = self
                .clocks
                .iter()
                .enumerate()
                .map(|(i, clock)| {
                    clock.density()
                        * clock.exposure(bottom, top)
                        * self.heights[w]
                        * self.fills[w * s + i]
                })
                .sum();
            if content < n_electrons_threshold {
                let h_low = self.heights[w - 1];
                let h = self.heights[w];
                for i in 0..s {
                    self.fills[(w - 1) * s + i] = (h_low * self.fills[(w - 1) * s + i]
                        + h * self.fills[w * s + i])
                        / (h_low + h);
                }
                self.heights[w - 1] = h_low + h;
                self.remove_row(w);
            } else {
                w += 1;
            }
        }
    }

    // ------------------------- Row plumbing -------------------------

    fn append_row(&mut self, height: f64) -> Result<(), WatermarkError> {
        if self.n_active >= self.n_watermarks {
            return Err(WatermarkError::Overflow {
                n_active: self.n_active,
                capacity: self.n_watermarks,
            });
        }
        let s = self.n_species;
        self.heights[self.n_active] = height;
        self.fills[self.n_active * s..(self.n_active + 1) * s].fill(0.0);
        self.n_active += 1;
        Ok(())
    }

    /// Split row `w` so its lower part has height `lower_height`; the
    /// upper part keeps the same fills.
    fn split_row(&mut self, w: usize, lower_height: f64) -> Result<(), WatermarkError> {
        if self.n_active >= self.n_watermarks {
            return Err(WatermarkError::Overflow {
                n_active: self.n_active,
                capacity: self.n_watermarks,
            });
        }
        let s = self.n_species;
        // Shift rows above w up by one.
        for row in (w + 1..self.n_active).rev() {
            self.heights[row + 1] = self.heights[row];
            self.fills.copy_within(row * s..(row + 1) * s, (row + 1) * s);
        }
        self.heights[w + 1] = self.heights[w] - lower_height;
        self.heights[w] = lower_height;
        self.fills.copy_within(w * s..(w + 1) * s, (w + 1) * s);
        self.n_active += 1;
        Ok(())
    }

    fn remove_row(&mut self, w: usize) {
        let s = self.n_species;
        for row in w..self.n_active - 1 {
            self.heights[row] = self.heights[row + 1];
            self.fills.copy_within((row + 1) * s..(row + 2) * s, row * s);
        }
        self.n_active -= 1;
    }

    /// Merge adjacent strata whose fills agree for every species. Exact up
    /// to the tolerance; keeps the stack at O(1) rows for instant-capture
    /// species, whose contact strata all saturate to the same fill.
    fn merge_adjacent_rows(&mut self) {
        let s = self.n_species;
        let mut w = 0;
        while w + 1 < self.n_active {
            let equal = (0..s).all(|i| {
                (self.fills[w * s + i] - self.fills[(w + 1) * s + i]).abs()
                    <= FILL_MERGE_TOLERANCE
            });
            if equal {
                let h0 = self.heights[w];
                let h1 = self.heights[w + 1];
                for i in 0..s {
                    self.fills[w * s + i] = (h0 * self.fills[w * s + i]
                        + h1 * self.fills[(w + 1) * s + i])
                        / (h0 + h1);
                }
                self.heights[w] = h0 + h1;
                self.remove_row(w + 1);
            } else {
                w += 1;
            }
        }
    }
}

// ============================================================================
// One manager per CCD phase
// ============================================================================

/// The trap managers for all phases of one clocking direction.
#[derive(Clone, Debug)]
pub struct TrapManagerSet {
    managers: Vec<TrapManager>,
    phase_order: Vec<usize>,
}

impl TrapManagerSet {
    /// Build one manager per phase, densities scaled by the per-phase trap
    /// fractions and dwell caches set from the schedule's dwell times.
    pub fn new(
        traps: &[TrapSpecies],
        max_n_transfers: usize,
        ccd: &Ccd,
        roe: &Roe,
    ) -> Result<Self, WatermarkError> {
        if roe.n_steps() != ccd.n_phases() {
            return Err(WatermarkError::PhaseMismatch {
                n_steps: roe.n_steps(),
                n_phases: ccd.n_phases(),
            });
        }
        let mut managers = Vec::with_capacity(ccd.n_phases());
        for p in 0..ccd.n_phases() {
            let scaled: Vec<TrapSpecies> = traps
                .iter()
                .cloned()
                .map(|mut t| {
                    t.scale_density(ccd.fraction_of_traps(p));
                    t
                })
                .collect();
            let mut manager = TrapManager::new(&scaled, max_n_transfers)?;
            manager.set_fill_probabilities_from_dwell_time(roe.dwell_times[p]);
            managers.push(manager);
        }
        Ok(Self { managers, phase_order: roe.clock_sequence() })
    }

    /// One full transfer: every phase step in clock order, the cloud
    /// carrying each step's net release forward.
    pub fn exchange(
        &mut self,
        n_free_electrons: f64,
        ccd: &Ccd,
        allow_negative_pixels: bool,
    ) -> Result<f64, WatermarkError> {
        let mut total = 0.0;
        let mut cloud = n_free_electrons;
        for &p in &self.phase_order {
            let delta = self.managers[p].n_electrons_released_and_captured(
                cloud,
                ccd.phase(p),
                allow_negative_pixels,
            )?;
            total += delta;
            cloud += delta;
        }
        Ok(total)
    }

    /// Total electrons trapped across all phases.
    pub fn n_trapped_electrons(&self) -> f64 {
        self.managers.iter().map(|m| m.n_trapped_electrons()).sum()
    }

    /// Reset every phase manager to empty.
    pub fn reset_trap_states(&mut self) {
        for m in &mut self.managers {
            m.reset_trap_states();
        }
    }

    /// Snapshot every phase manager.
    pub fn store_trap_states(&mut self) {
        for m in &mut self.managers {
            m.store_trap_states();
        }
    }

    /// Rewind every phase manager to its last snapshot.
    pub fn restore_trap_states(&mut self) {
        for m in &mut self.managers {
            m.restore_trap_states();
        }
    }

    /// Prune low-occupancy strata in every phase manager.
    pub fn prune_watermarks(&mut self, n_electrons_threshold: f64) {
        for m in &mut self.managers {
            m.prune_watermarks(n_electrons_threshold);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
