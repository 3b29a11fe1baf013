//! Readout-electronics schedules
//!
//! Transferring a column of `N` pixels to the readout register naively
//! costs `N(N+1)/2` trap–cloud exchanges. The *express matrix* compresses
//! this: the caller picks `K ∈ [1, N]` (`0` is an alias for `N`) and each
//! pixel's true transfer count is split across `K` weighted passes, so the
//! engine evaluates `K·N` exchanges and multiplies. Each column of the
//! matrix sums to the pixel's transfer count, `row + 1 + offset`.
//!
//! The staircase form is `E[k][c] = clamp((c + 1 + offset) − k·mm, 0, mm)`
//! with `mm = n_transfers / K` (rounded up when an integer matrix is
//! requested). With `empty_traps_for_first_transfers`, the first transfer
//! of every pixel — which is guaranteed to see empty traps — is peeled into
//! its own weight-1 row, interleaved from the farthest pixel downward, and
//! the compressed remainder is built from `n_transfers − 1`.
//!
//! The companion *store-state matrix* marks, per pass, the last transfer
//! after which the trap state must be snapshotted so the next pass resumes
//! from it. Three schedule kinds share the one type: standard readout,
//! charge injection (every pixel travels the full column), and trap
//! pumping (`n_pumps` back-and-forth cycles in place).

#![forbid(unsafe_code)]

use crate::util::clamp;

/// Errors from schedule construction.
#[derive(Debug, thiserror::Error)]
pub enum RoeError {
    /// At least one dwell time per clock step.
    #[error("at least one dwell time is required")]
    EmptyDwellTimes,
    /// Dwell times must be positive.
    #[error("dwell times must be positive (got {0})")]
    BadDwellTime(f64),
    /// Trap pumping needs at least one pump cycle.
    #[error("trap pumping needs at least one pump")]
    ZeroPumps,
    /// The schedule needs at least one pixel.
    #[error("a schedule needs at least one pixel")]
    NoPixels,
    /// `time_stop` must exceed `time_start` when set.
    #[error("time window [{start}, {stop}) is empty or inverted")]
    BadTimeWindow {
        /// First clock tick modelled.
        start: usize,
        /// One past the last clock tick modelled (-1 = to end).
        stop: i64,
    },
}

/// Which clocking pattern a [`Roe`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoeKind {
    /// Ordinary readout toward the register at row 0.
    Standard,
    /// Charge injected at the far end; all pixels travel the full column.
    ChargeInjection,
    /// Charge pumped back and forth in place.
    TrapPumping,
}

/// A readout-electronics schedule.
///
/// Immutable after construction; the matrices themselves are built per
/// column length by [`Roe::build_schedule`] and may be shared freely.
#[derive(Clone, Debug)]
pub struct Roe {
    /// Dwell time of each clock step, one per CCD phase.
    pub dwell_times: Vec<f64>,
    /// Prescan pixels between the supplied image and the register.
    pub prescan_offset: usize,
    /// First overscan row, or -1 for none. Overscan rows clock as ordinary
    /// zero-charge pixels; the field is kept for model bookkeeping.
    pub overscan_start: i64,
    /// Reset trap states between columns (false carries them over, in
    /// which case column order is part of the contract).
    pub empty_traps_between_columns: bool,
    /// Peel each pixel's guaranteed-empty first transfer into its own pass.
    pub empty_traps_for_first_transfers: bool,
    /// Release toward the dump rather than the readout. A no-op unless the
    /// device has more than one phase.
    pub force_release_away_from_readout: bool,
    /// Round the express weights to integers (`mm = ceil(n/K)`).
    pub use_integer_express_matrix: bool,
    /// Pump cycles for [`RoeKind::TrapPumping`].
    pub n_pumps: usize,
    kind: RoeKind,
}

impl Roe {
    /// A standard readout schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dwell_times: Vec<f64>,
        prescan_offset: usize,
        overscan_start: i64,
        empty_traps_between_columns: bool,
        empty_traps_for_first_transfers: bool,
        force_release_away_from_readout: bool,
        use_integer_express_matrix: bool,
    ) -> Result<Self, RoeError> {
        Self::validate_dwell_times(&dwell_times)?;
        Ok(Self {
            dwell_times,
            prescan_offset,
            overscan_start,
            empty_traps_between_columns,
            empty_traps_for_first_transfers,
            force_release_away_from_readout,
            use_integer_express_matrix,
            n_pumps: 0,
            kind: RoeKind::Standard,
        })
    }

    /// A standard schedule with everything defaulted but the dwell times.
    pub fn simple(dwell_times: Vec<f64>) -> Result<Self, RoeError> {
        Self::new(dwell_times, 0, -1, true, false, false, false)
    }

    /// A charge-injection schedule: every pixel undergoes the full
    /// `n_rows + offset` transfers regardless of its position.
    pub fn charge_injection(
        dwell_times: Vec<f64>,
        prescan_offset: usize,
        overscan_start: i64,
        empty_traps_between_columns: bool,
        force_release_away_from_readout: bool,
        use_integer_express_matrix: bool,
    ) -> Result<Self, RoeError> {
        Self::validate_dwell_times(&dwell_times)?;
        Ok(Self {
            dwell_times,
            prescan_offset,
            overscan_start,
            empty_traps_between_columns,
            empty_traps_for_first_transfers: false,
            force_release_away_from_readout,
            use_integer_express_matrix,
            n_pumps: 0,
            kind: RoeKind::ChargeInjection,
        })
    }

    /// A trap-pumping schedule: `n_pumps` cycles applied in place, trap
    /// state carried across passes.
    pub fn trap_pumping(
        dwell_times: Vec<f64>,
        n_pumps: usize,
        empty_traps_for_first_transfers: bool,
        use_integer_express_matrix: bool,
    ) -> Result<Self, RoeError> {
        Self::validate_dwell_times(&dwell_times)?;
        if n_pumps == 0 {
            return Err(RoeError::ZeroPumps);
        }
        Ok(Self {
            dwell_times,
            prescan_offset: 0,
            overscan_start: -1,
            empty_traps_between_columns: true,
            empty_traps_for_first_transfers,
            force_release_away_from_readout: false,
            use_integer_express_matrix,
            n_pumps,
            kind: RoeKind::TrapPumping,
        })
    }

    fn validate_dwell_times(dwell_times: &[f64]) -> Result<(), RoeError> {
        if dwell_times.is_empty() {
            return Err(RoeError::EmptyDwellTimes);
        }
        for &dt in dwell_times {
            if !(dt > 0.0) || !dt.is_finite() {
                return Err(RoeError::BadDwellTime(dt));
            }
        }
        Ok(())
    }

    /// The schedule kind.
    #[inline]
    pub fn kind(&self) -> RoeKind {
        self.kind
    }

    /// Number of clock steps (= CCD phases) per transfer.
    #[inline]
    pub fn n_steps(&self) -> usize {
        self.dwell_times.len()
    }

    /// Order in which the phase steps run within one transfer.
    ///
    /// Reversed when releasing away from the readout; with a single phase
    /// the flag cannot matter, so it is ignored.
    pub(crate) fn clock_sequence(&self) -> Vec<usize> {
        let n = self.n_steps();
        if self.force_release_away_from_readout && n > 1 {
            (0..n).rev().collect()
        } else {
            (0..n).collect()
        }
    }

    /// Build the express and store-state matrices for one column length.
    ///
    /// `offset` is added to [`Roe::prescan_offset`]. `time_stop = -1` means
    /// "to end"; the time window clips each pixel's transfer count and
    /// applies to standard readout only.
    pub fn build_schedule(
        &self,
        n_rows: usize,
        express: usize,
        offset: usize,
        time_start: usize,
        time_stop: i64,
    ) -> Result<ExpressSchedule, RoeError> {
        if n_rows == 0 {
            return Err(RoeError::NoPixels);
        }
        if time_stop >= 0 && (time_stop as usize) <= time_start {
            return Err(RoeError::BadTimeWindow { start: time_start, stop: time_stop });
        }
        let offset_total = offset + self.prescan_offset;
        let windowed = time_start > 0 || time_stop >= 0;

        let (n_passes, matrix) = match self.kind {
            RoeKind::Standard => {
                if windowed {
                    clipped_staircase(
                        n_rows,
                        express,
                        offset_total,
                        self.use_integer_express_matrix,
                        time_start,
                        time_stop,
                    )
                } else {
                    express_matrix_from_pixels_and_express(
                        n_rows,
                        express,
                        offset_total,
                        self.use_integer_express_matrix,
                        self.empty_traps_for_first_transfers,
                    )
                }
            }
            RoeKind::ChargeInjection => uniform_matrix(
                n_rows,
                express,
                n_rows + offset_total,
                self.use_integer_express_matrix,
                false,
            ),
            RoeKind::TrapPumping => uniform_matrix(
                n_rows,
                express,
                self.n_pumps,
                self.use_integer_express_matrix,
                self.empty_traps_for_first_transfers,
            ),
        };

        let store = match self.kind {
            RoeKind::Standard => store_matrix_from_express(&matrix, n_passes, n_rows),
            RoeKind::ChargeInjection | RoeKind::TrapPumping => {
                store_matrix_last_row(n_passes, n_rows)
            }
        };

        tracing::debug!(
            kind = ?self.kind,
            n_rows,
            express,
            offset = offset_total,
            n_passes,
            "built express schedule"
        );
        Ok(ExpressSchedule { n_rows, n_express_passes: n_passes, express_matrix: matrix, store_trap_states_matrix: store })
    }
}

/// The express and store-state matrices for one column length.
#[derive(Clone, Debug)]
pub struct ExpressSchedule {
    /// Pixels per column covered by the matrices.
    pub n_rows: usize,
    /// Number of evaluated passes (rows of the matrices).
    pub n_express_passes: usize,
    express_matrix: Vec<f64>,
    store_trap_states_matrix: Vec<bool>,
}

impl ExpressSchedule {
    /// Express weight of `row` within `pass`.
    #[inline]
    pub fn weight(&self, pass: usize, row: usize) -> f64 {
        self.express_matrix[pass * self.n_rows + row]
    }

    /// Whether trap state must be snapshotted after `row` within `pass`.
    #[inline]
    pub fn store_trap_states(&self, pass: usize, row: usize) -> bool {
        self.store_trap_states_matrix[pass * self.n_rows + row]
    }

    /// Total weight accumulated by one pixel across all passes.
    pub fn column_sum(&self, row: usize) -> f64 {
        (0..self.n_express_passes).map(|k| self.weight(k, row)).sum()
    }
}

// ============================================================================
// Matrix construction
// ============================================================================

/// The standard express matrix, returned as `(n_passes, row-major data)`.
///
/// Every column sums to the pixel's transfer count `c + 1 + offset` for
/// any `express` and either flag setting.
pub fn express_matrix_from_pixels_and_express(
    n_pixels: usize,
    express: usize,
    offset: usize,
    use_integer_express_matrix: bool,
    empty_traps_for_first_transfers: bool,
) -> (usize, Vec<f64>) {
    let n_transfers_full = n_pixels + offset;
    let express_eff = if express == 0 { n_transfers_full } else { express.min(n_transfers_full) };
    let peel = empty_traps_for_first_transfers && express_eff < n_transfers_full;

    if !peel {
        let mut mm = n_transfers_full as f64 / express_eff as f64;
        if use_integer_express_matrix {
            mm = mm.ceil();
        }
        let mut matrix = vec![0.0; express_eff * n_pixels];
        for k in 0..express_eff {
            for c in 0..n_pixels {
                matrix[k * n_pixels + c] =
                    clamp((c + 1 + offset) as f64 - k as f64 * mm, 0.0, mm);
            }
        }
        return (express_eff, matrix);
    }

    // Peel the guaranteed-empty first transfer of every pixel into its own
    // weight-1 row. Compressed passes are built from n_transfers - 1 and
    // merged with the first transfer of the pixel at their start position;
    // rows are emitted from the farthest transfer position downward.
    let n_transfers = n_transfers_full - 1;
    let mut mm = n_transfers as f64 / express_eff as f64;
    if use_integer_express_matrix {
        mm = mm.ceil();
    }
    let n_passes = n_transfers_full;
    let mut matrix = vec![0.0; n_passes * n_pixels];

    for (row, j) in (0..n_transfers_full).rev().enumerate() {
        // Pass k's merged row sits at transfer position floor(k·mm).
        let k = (j as f64 / mm).ceil() as usize;
        let is_pass_row = k < express_eff && (k as f64 * mm).floor() as usize == j;
        if is_pass_row {
            for c in 0..n_pixels {
                matrix[row * n_pixels + c] =
                    clamp((c + offset) as f64 - k as f64 * mm, 0.0, mm);
            }
            if j >= offset {
                matrix[row * n_pixels + (j - offset)] += 1.0;
            }
        } else if j >= offset {
            matrix[row * n_pixels + (j - offset)] = 1.0;
        }
    }
    (n_passes, matrix)
}

/// Staircase over per-pixel transfer counts clipped to the clock-tick
/// window `[time_start, time_stop)`.
fn clipped_staircase(
    n_pixels: usize,
    express: usize,
    offset: usize,
    use_integer_express_matrix: bool,
    time_start: usize,
    time_stop: i64,
) -> (usize, Vec<f64>) {
    let stop = if time_stop < 0 { usize::MAX } else { time_stop as usize };
    let count = |c: usize| (c + 1 + offset).min(stop).saturating_sub(time_start);

    let n_transfers = count(n_pixels - 1);
    if n_transfers == 0 {
        return (1, vec![0.0; n_pixels]);
    }
    let express_eff = if express == 0 { n_transfers } else { express.min(n_transfers) };
    let mut mm = n_transfers as f64 / express_eff as f64;
    if use_integer_express_matrix {
        mm = mm.ceil();
    }
    let mut matrix = vec![0.0; express_eff * n_pixels];
    for k in 0..express_eff {
        for c in 0..n_pixels {
            matrix[k * n_pixels + c] = clamp(count(c) as f64 - k as f64 * mm, 0.0, mm);
        }
    }
    (express_eff, matrix)
}

/// Express matrix with the same transfer count for every pixel, as used by
/// charge injection (full-column travel) and trap pumping (pump cycles).
fn uniform_matrix(
    n_pixels: usize,
    express: usize,
    n_transfers: usize,
    use_integer_express_matrix: bool,
    empty_traps_for_first_transfers: bool,
) -> (usize, Vec<f64>) {
    let express_eff = if express == 0 { n_transfers } else { express.min(n_transfers) };
    let peel = empty_traps_for_first_transfers && express_eff < n_transfers;
    let remaining = if peel { n_transfers - 1 } else { n_transfers };

    let mut mm = remaining as f64 / express_eff as f64;
    if use_integer_express_matrix {
        mm = mm.ceil();
    }
    let n_passes = express_eff + usize::from(peel);
    let mut matrix = vec![0.0; n_passes * n_pixels];
    let mut row = 0;
    if peel {
        for c in 0..n_pixels {
            matrix[c] = 1.0;
        }
        row += 1;
    }
    for k in 0..express_eff {
        let weight = clamp(remaining as f64 - k as f64 * mm, 0.0, mm);
        for c in 0..n_pixels {
            matrix[(row + k) * n_pixels + c] = weight;
        }
    }
    (n_passes, matrix)
}

/// Store after the transfer just before the next pass's first active row.
fn store_matrix_from_express(matrix: &[f64], n_passes: usize, n_rows: usize) -> Vec<bool> {
    let mut store = vec![false; n_passes * n_rows];
    for k in 0..n_passes.saturating_sub(1) {
        let next = &matrix[(k + 1) * n_rows..(k + 2) * n_rows];
        if let Some(first_active) = next.iter().position(|&w| w > 0.0) {
            if first_active > 0 {
                store[k * n_rows + first_active - 1] = true;
            }
        }
    }
    store
}

/// Store after the last row of every pass but the final one.
fn store_matrix_last_row(n_passes: usize, n_rows: usize) -> Vec<bool> {
    let mut store = vec![false; n_passes * n_rows];
    for k in 0..n_passes.saturating_sub(1) {
        store[k * n_rows + n_rows - 1] = true;
    }
    store
}

// ============================================================================
// Tests
// ============================================================================
