//! Trap species
//!
//! A trap species describes one kind of lattice defect: how many there are
//! per pixel (`density`), how fast a filled trap re-emits its electron
//! (`release_timescale`), and optionally how fast an empty trap captures
//! (`capture_timescale`) or how broad the release-time distribution is
//! (`release_timescale_sigma`). Four species are modelled:
//!
//! - [`TrapInstantCapture`] — single release lifetime, capture completes
//!   within one clock step. The workhorse. May be confined to a fractional
//!   volume band of the pixel.
//! - [`TrapSlowCapture`] — single lifetime with a finite capture
//!   timescale.
//! - [`TrapInstantCaptureContinuum`] — a log-normal continuum of release
//!   lifetimes with instant capture.
//! - [`TrapSlowCaptureContinuum`] — the continuum with slow capture too.
//!
//! ## Continuum lookup tables
//!
//! The continuum fill fraction at elapsed time `t` is
//! `∫ exp(-t/τ) · P_logN(τ; τ_r, σ) dτ`, which has no closed form and is
//! needed in the innermost loop of the clocking engine. Each continuum
//! species therefore pre-computes, at construction, a fill↔time table pair
//! over log-spaced times; queries interpolate linearly in log-time,
//! extrapolate one interval's slope just outside the table, and saturate
//! to 1 (t → 0) or 0 (t → ∞) far outside. The slow-capture variant needs a
//! third table that also depends on the dwell time, which is only known
//! once a readout schedule is chosen — that table is built by the trap
//! manager, keeping species immutable and freely shareable across columns
//! and threads.

#![forbid(unsafe_code)]

use crate::util::{gauss_legendre_nodes, normal_pdf, GAUSS_LEGENDRE_ORDER};

/// Number of interpolation nodes in a continuum lookup table.
pub const N_TABLE_NODES: usize = 1000;

/// Default table range, as multiples of the release timescale.
const TABLE_SPAN_BELOW: f64 = 1e-2;
const TABLE_SPAN_ABOVE: f64 = 1e2;

/// Half-width of the log-lifetime integration window, in sigmas.
const LOG_SIGMA_SPAN: f64 = 6.0;

/// Errors from trap-species construction.
#[derive(Debug, thiserror::Error)]
pub enum TrapError {
    /// Densities are electrons per pixel and cannot be negative.
    #[error("trap density must be non-negative (got {0})")]
    BadDensity(f64),
    /// Release timescales must be positive.
    #[error("release timescale must be positive (got {0})")]
    BadReleaseTimescale(f64),
    /// Capture timescales must be positive.
    #[error("capture timescale must be positive (got {0})")]
    BadCaptureTimescale(f64),
    /// The log-normal spread must be positive.
    #[error("release timescale sigma must be positive (got {0})")]
    BadReleaseSigma(f64),
    /// The occupancy band is a sub-interval of the pixel volume.
    #[error("occupancy band must satisfy 0 <= low <= high <= 1 (got {low}, {high})")]
    BadOccupancyBand {
        /// Lower band edge.
        low: f64,
        /// Upper band edge.
        high: f64,
    },
    /// A lookup table needs at least two nodes.
    #[error("lookup table needs at least two nodes (got {0})")]
    BadTableSize(usize),
    /// Table bounds must be positive and ordered.
    #[error("lookup table range must satisfy 0 < min < max (got {min}, {max})")]
    BadTableRange {
        /// Lower time bound.
        min: f64,
        /// Upper time bound.
        max: f64,
    },
    /// The fill fraction underflowed inside the requested table range.
    #[error("fill fraction vanishes inside the table range; shrink time_max")]
    TableUnderflow,
}

// ============================================================================
// Instant capture, single lifetime
// ============================================================================

/// A trap species with a single release lifetime and instant capture.
///
/// The optional occupancy band `[none_exposed, full_exposed]` models a
/// species that is absent below `none_exposed`, ramps linearly up to
/// `full_exposed`, and is uniformly present above it. The nominal density
/// refers to the band-integrated total, so construction renormalises the
/// stored density by the band integral `(high - low)/2 + (1 - high)`.
#[derive(Clone, Debug, PartialEq)]
pub struct TrapInstantCapture {
    /// Traps per pixel (renormalised when a band is set).
    pub density: f64,
    /// Release timescale `τ_r`, in clock-step units.
    pub release_timescale: f64,
    /// `1 / τ_r`.
    pub release_rate: f64,
    /// Fractional volume below which no traps are exposed.
    pub fractional_volume_none_exposed: f64,
    /// Fractional volume above which all traps are exposed.
    pub fractional_volume_full_exposed: f64,
}

impl TrapInstantCapture {
    /// A uniformly distributed species.
    pub fn new(density: f64, release_timescale: f64) -> Result<Self, TrapError> {
        Self::with_occupancy_band(density, release_timescale, 0.0, 0.0)
    }

    /// A species confined to the volume band `[low, high]`.
    pub fn with_occupancy_band(
        density: f64,
        release_timescale: f64,
        low: f64,
        high: f64,
    ) -> Result<Self, TrapError> {
        if !(density >= 0.0) || !density.is_finite() {
            return Err(TrapError::BadDensity(density));
        }
        if !(release_timescale > 0.0) || !release_timescale.is_finite() {
            return Err(TrapError::BadReleaseTimescale(release_timescale));
        }
        if !(0.0 <= low && low <= high && high <= 1.0) {
            return Err(TrapError::BadOccupancyBand { low, high });
        }
        let band_integral = (high - low) / 2.0 + (1.0 - high);
        Ok(Self {
            density: density / band_integral,
            release_timescale,
            release_rate: 1.0 / release_timescale,
            fractional_volume_none_exposed: low,
            fractional_volume_full_exposed: high,
        })
    }

    /// Fill fraction remaining after `time_elapsed` since the last fill.
    #[inline]
    pub fn fill_fraction_from_time_elapsed(&self, time_elapsed: f64) -> f64 {
        (-time_elapsed / self.release_timescale).exp()
    }

    /// Integral of the exposure profile from the well bottom up to `v`.
    fn exposure_cdf(&self, v: f64) -> f64 {
        let (low, high) = (self.fractional_volume_none_exposed, self.fractional_volume_full_exposed);
        if v <= low {
            0.0
        } else if v < high {
            let ramp = (v - low) / (high - low);
            (v - low) * ramp / 2.0
        } else {
            (high - low) / 2.0 + (v - high)
        }
    }

    /// Fraction of this species' traps exposed per unit fractional volume
    /// over the band `[a, b]`. Uniformly 1 without an occupancy band.
    pub fn fraction_traps_exposed_per_fractional_volume(&self, a: f64, b: f64) -> f64 {
        if b <= a {
            return 0.0;
        }
        (self.exposure_cdf(b) - self.exposure_cdf(a)) / (b - a)
    }
}

// ============================================================================
// Slow capture, single lifetime
// ============================================================================

/// A trap species with a single release lifetime and a finite capture
/// timescale. Capture competes with release while the trap sits inside the
/// electron cloud; the trap manager combines the two with the standard
/// fill-probability solution of the rate equation.
#[derive(Clone, Debug, PartialEq)]
pub struct TrapSlowCapture {
    /// Traps per pixel.
    pub density: f64,
    /// Release timescale `τ_r`.
    pub release_timescale: f64,
    /// `1 / τ_r`.
    pub release_rate: f64,
    /// Capture timescale `τ_c`.
    pub capture_timescale: f64,
    /// `1 / τ_c`.
    pub capture_rate: f64,
}

impl TrapSlowCapture {
    /// A validated slow-capture species.
    pub fn new(
        density: f64,
        release_timescale: f64,
        capture_timescale: f64,
    ) -> Result<Self, TrapError> {
        if !(density >= 0.0) || !density.is_finite() {
            return Err(TrapError::BadDensity(density));
        }
        if !(release_timescale > 0.0) || !release_timescale.is_finite() {
            return Err(TrapError::BadReleaseTimescale(release_timescale));
        }
        if !(capture_timescale > 0.0) || !capture_timescale.is_finite() {
            return Err(TrapError::BadCaptureTimescale(capture_timescale));
        }
        Ok(Self {
            density,
            release_timescale,
            release_rate: 1.0 / release_timescale,
            capture_timescale,
            capture_rate: 1.0 / capture_timescale,
        })
    }

    /// Fill fraction remaining after `time_elapsed` since the last fill.
    #[inline]
    pub fn fill_fraction_from_time_elapsed(&self, time_elapsed: f64) -> f64 {
        (-time_elapsed / self.release_timescale).exp()
    }
}

// ============================================================================
// Log-normal lifetime continuum: shared machinery
// ============================================================================

/// Quadrature nodes over the log-normal lifetime distribution.
///
/// Nodes live in log-lifetime, weighted by the normal density and
/// normalised so an all-filled population integrates to exactly 1.
#[derive(Clone, Debug, PartialEq)]
struct LifetimeQuadrature {
    /// `(lifetime, weight)` pairs; weights sum to 1.
    nodes: Vec<(f64, f64)>,
}

impl LifetimeQuadrature {
    fn new(release_timescale: f64, sigma: f64) -> Self {
        let rule = gauss_legendre_nodes(GAUSS_LEGENDRE_ORDER);
        let mu = release_timescale.ln();
        let half = LOG_SIGMA_SPAN * sigma;
        let mut nodes: Vec<(f64, f64)> = rule
            .iter()
            .map(|&(x, w)| {
                let log_tau = mu + half * x;
                (log_tau.exp(), half * w * normal_pdf(log_tau, mu, sigma))
            })
            .collect();
        let mass: f64 = nodes.iter().map(|&(_, w)| w).sum();
        for node in &mut nodes {
            node.1 /= mass;
        }
        Self { nodes }
    }

    /// Population fill fraction after `time_elapsed` since the last fill.
    fn fill_fraction(&self, time_elapsed: f64) -> f64 {
        if time_elapsed <= 0.0 {
            return 1.0;
        }
        self.nodes
            .iter()
            .map(|&(tau, w)| w * (-time_elapsed / tau).exp())
            .sum()
    }

    /// Population fill after spending `dwell_time` inside the cloud, having
    /// started `time_elapsed` after the last fill, with capture rate `c`.
    fn fill_fraction_after_slow_capture(
        &self,
        time_elapsed: f64,
        dwell_time: f64,
        capture_rate: f64,
    ) -> f64 {
        self.nodes
            .iter()
            .map(|&(tau, w)| {
                let release_rate = 1.0 / tau;
                let total_rate = capture_rate + release_rate;
                let fill_eq = capture_rate / total_rate;
                let fill_start = if time_elapsed <= 0.0 {
                    1.0
                } else {
                    (-time_elapsed / tau).exp()
                };
                w * (fill_eq + (fill_start - fill_eq) * (-total_rate * dwell_time).exp())
            })
            .sum()
    }

    /// Invert `fill_fraction` by bisection on `[0, time_max]`.
    fn time_elapsed_from_fill_fraction(&self, fill: f64, time_max: f64) -> f64 {
        if fill >= 1.0 {
            return 0.0;
        }
        if fill <= 0.0 {
            return f64::MAX;
        }
        if self.fill_fraction(time_max) >= fill {
            return time_max;
        }
        let (mut lo, mut hi) = (0.0, time_max);
        for _ in 0..100 {
            let mid = 0.5 * (lo + hi);
            if self.fill_fraction(mid) >= fill {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo <= f64::EPSILON * hi {
                break;
            }
        }
        0.5 * (lo + hi)
    }
}

/// The fill↔time table pair for one continuum species.
///
/// `fill_table` holds the fill fraction at `N` log-spaced times; the
/// inverse is tabulated over log-spaced fills by interpolating the forward
/// table, so construction costs one quadrature per node.
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseTables {
    /// Lower time bound of the table.
    pub time_min: f64,
    /// Upper time bound of the table.
    pub time_max: f64,
    /// Log-time node spacing.
    pub d_log_time: f64,
    /// Fill at `time_max` (smallest tabulated fill).
    pub fill_min: f64,
    /// Fill at `time_min` (largest tabulated fill).
    pub fill_max: f64,
    d_log_fill: f64,
    fill_table: Vec<f64>,
    log_time_table: Vec<f64>,
}

impl ReleaseTables {
    fn build(
        quad: &LifetimeQuadrature,
        time_min: f64,
        time_max: f64,
        n_nodes: usize,
    ) -> Result<Self, TrapError> {
        if n_nodes < 2 {
            return Err(TrapError::BadTableSize(n_nodes));
        }
        if !(time_min > 0.0 && time_min < time_max) || !time_max.is_finite() {
            return Err(TrapError::BadTableRange { min: time_min, max: time_max });
        }
        let n = n_nodes;
        let d_log_time = (time_max.ln() - time_min.ln()) / (n - 1) as f64;

        let fill_table: Vec<f64> = (0..n)
            .map(|i| quad.fill_fraction((time_min.ln() + i as f64 * d_log_time).exp()))
            .collect();
        let fill_min = fill_table[n - 1];
        let fill_max = fill_table[0];
        if !(fill_min > 0.0) {
            return Err(TrapError::TableUnderflow);
        }

        // Tabulate the inverse over log-spaced fills by walking the forward
        // table, which is monotone decreasing in time.
        let d_log_fill = (fill_max.ln() - fill_min.ln()) / (n - 1) as f64;
        let mut log_time_table = vec![0.0; n];
        let mut i = n - 2;
        for (j, slot) in log_time_table.iter_mut().enumerate() {
            let fill_j = (fill_min.ln() + j as f64 * d_log_fill).exp();
            // Move toward shorter times until fill_table[i] >= fill_j.
            while i > 0 && fill_table[i] < fill_j {
                i -= 1;
            }
            let span = fill_table[i + 1].ln() - fill_table[i].ln();
            let frac = if span == 0.0 { 0.0 } else { (fill_j.ln() - fill_table[i].ln()) / span };
            *slot = time_min.ln() + (i as f64 + frac) * d_log_time;
        }

        Ok(Self {
            time_min,
            time_max,
            d_log_time,
            fill_min,
            fill_max,
            d_log_fill,
            fill_table,
            log_time_table,
        })
    }

    /// Table lookup for the fill fraction at elapsed time `t`.
    pub fn fill_fraction_from_time_elapsed(&self, time_elapsed: f64) -> f64 {
        if time_elapsed <= 0.0 {
            return 1.0;
        }
        if !time_elapsed.is_finite() {
            return 0.0;
        }
        let x = (time_elapsed.ln() - self.time_min.ln()) / self.d_log_time;
        let i = (x.floor() as isize).clamp(0, self.fill_table.len() as isize - 2) as usize;
        let frac = x - i as f64;
        let value = self.fill_table[i] + frac * (self.fill_table[i + 1] - self.fill_table[i]);
        value.clamp(0.0, 1.0)
    }

    /// Table lookup for the elapsed time with fill fraction `fill`.
    pub fn time_elapsed_from_fill_fraction(&self, fill: f64) -> f64 {
        if fill >= 1.0 {
            return 0.0;
        }
        if fill <= 0.0 {
            return f64::MAX;
        }
        let y = (fill.ln() - self.fill_min.ln()) / self.d_log_fill;
        let j = (y.floor() as isize).clamp(0, self.log_time_table.len() as isize - 2) as usize;
        let frac = y - j as f64;
        let log_time =
            self.log_time_table[j] + frac * (self.log_time_table[j + 1] - self.log_time_table[j]);
        log_time.exp().min(f64::MAX)
    }

    /// Advance a fill through one release interval of length `dwell_time`.
    #[inline]
    pub fn fill_after_release(&self, fill: f64, dwell_time: f64) -> f64 {
        if fill <= 0.0 {
            return 0.0;
        }
        let time_elapsed = self.time_elapsed_from_fill_fraction(fill);
        if time_elapsed >= f64::MAX - dwell_time {
            return 0.0;
        }
        self.fill_fraction_from_time_elapsed(time_elapsed + dwell_time)
    }
}

/// Per-dwell capture table for a slow-capture continuum species.
///
/// Built by the trap manager once the dwell time is known. Beyond
/// `time_max` the table returns the converged long-time value.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureTables {
    time_min: f64,
    time_max: f64,
    d_log_time: f64,
    table: Vec<f64>,
    /// Converged fill for traps empty for much longer than `time_max`.
    pub fill_capture_long_time: f64,
}

impl CaptureTables {
    /// Fill after slow capture for a trap last filled `time_elapsed` ago.
    pub fn fill_fraction_after_slow_capture(&self, time_elapsed: f64) -> f64 {
        if !time_elapsed.is_finite() || time_elapsed >= self.time_max {
            return self.fill_capture_long_time;
        }
        let t = time_elapsed.max(f64::MIN_POSITIVE);
        // The capture fill flattens in log-time toward t = 0; extrapolation
        // below the table is capped at one table width.
        let x = ((t.ln() - self.time_min.ln()) / self.d_log_time)
            .max(-((self.table.len() - 1) as f64));
        let i = (x.floor() as isize).clamp(0, self.table.len() as isize - 2) as usize;
        let frac = x - i as f64;
        let value = self.table[i] + frac * (self.table[i + 1] - self.table[i]);
        value.clamp(0.0, 1.0)
    }
}

// ============================================================================
// Instant capture, lifetime continuum
// ============================================================================

/// A continuum of release lifetimes (log-normal around the median
/// `release_timescale` with log-deviation `release_timescale_sigma`) with
/// instant capture. Lookup tables are built at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct TrapInstantCaptureContinuum {
    /// Traps per pixel.
    pub density: f64,
    /// Median release timescale.
    pub release_timescale: f64,
    /// Log-normal deviation of the release timescale.
    pub release_timescale_sigma: f64,
    quad: LifetimeQuadrature,
    tables: ReleaseTables,
}

impl TrapInstantCaptureContinuum {
    /// Construct with the default table range
    /// `[τ_r · 1e-2, τ_r · 1e2]` and [`N_TABLE_NODES`] nodes.
    pub fn new(
        density: f64,
        release_timescale: f64,
        release_timescale_sigma: f64,
    ) -> Result<Self, TrapError> {
        Self::with_table_range(
            density,
            release_timescale,
            release_timescale_sigma,
            release_timescale * TABLE_SPAN_BELOW,
            release_timescale * TABLE_SPAN_ABOVE,
            N_TABLE_NODES,
        )
    }

    /// Construct with an explicit table range.
    pub fn with_table_range(
        density: f64,
        release_timescale: f64,
        release_timescale_sigma: f64,
        time_min: f64,
        time_max: f64,
        n_nodes: usize,
    ) -> Result<Self, TrapError> {
        if !(density >= 0.0) || !density.is_finite() {
            return Err(TrapError::BadDensity(density));
        }
        if !(release_timescale > 0.0) || !release_timescale.is_finite() {
            return Err(TrapError::BadReleaseTimescale(release_timescale));
        }
        if !(release_timescale_sigma > 0.0) || !release_timescale_sigma.is_finite() {
            return Err(TrapError::BadReleaseSigma(release_timescale_sigma));
        }
        let quad = LifetimeQuadrature::new(release_timescale, release_timescale_sigma);
        let tables = ReleaseTables::build(&quad, time_min, time_max, n_nodes)?;
        Ok(Self { density, release_timescale, release_timescale_sigma, quad, tables })
    }

    /// Population fill fraction at elapsed time `t`, by direct quadrature.
    pub fn fill_fraction_from_time_elapsed(&self, time_elapsed: f64) -> f64 {
        self.quad.fill_fraction(time_elapsed)
    }

    /// Invert the fill fraction by bisection on `[0, time_max]`.
    pub fn time_elapsed_from_fill_fraction(&self, fill: f64, time_max: f64) -> f64 {
        self.quad.time_elapsed_from_fill_fraction(fill, time_max)
    }

    /// The precomputed lookup tables.
    #[inline]
    pub fn tables(&self) -> &ReleaseTables {
        &self.tables
    }
}

// ============================================================================
// Slow capture, lifetime continuum
// ============================================================================

/// The lifetime continuum with a finite capture timescale.
#[derive(Clone, Debug, PartialEq)]
pub struct TrapSlowCaptureContinuum {
    /// Traps per pixel.
    pub density: f64,
    /// Median release timescale.
    pub release_timescale: f64,
    /// `1 / τ_r` at the median.
    pub release_rate: f64,
    /// Log-normal deviation of the release timescale.
    pub release_timescale_sigma: f64,
    /// Capture timescale `τ_c`.
    pub capture_timescale: f64,
    /// `1 / τ_c`.
    pub capture_rate: f64,
    quad: LifetimeQuadrature,
    tables: ReleaseTables,
}

impl TrapSlowCaptureContinuum {
    /// Construct with the default table range.
    pub fn new(
        density: f64,
        release_timescale: f64,
        release_timescale_sigma: f64,
        capture_timescale: f64,
    ) -> Result<Self, TrapError> {
        Self::with_table_range(
            density,
            release_timescale,
            release_timescale_sigma,
            capture_timescale,
            release_timescale * TABLE_SPAN_BELOW,
            release_timescale * TABLE_SPAN_ABOVE,
            N_TABLE_NODES,
        )
    }

    /// Construct with an explicit table range.
    pub fn with_table_range(
        density: f64,
        release_timescale: f64,
        release_timescale_sigma: f64,
        capture_timescale: f64,
        time_min: f64,
        time_max: f64,
        n_nodes: usize,
    ) -> Result<Self, TrapError> {
        if !(density >= 0.0) || !density.is_finite() {
            return Err(TrapError::BadDensity(density));
        }
        if !(release_timescale > 0.0) || !release_timescale.is_finite() {
            return Err(TrapError::BadReleaseTimescale(release_timescale));
        }
        if !(release_timescale_sigma > 0.0) || !release_timescale_sigma.is_finite() {
            return Err(TrapError::BadReleaseSigma(release_timescale_sigma));
        }
        if !(capture_timescale > 0.0) || !capture_timescale.is_finite() {
            return Err(TrapError::BadCaptureTimescale(capture_timescale));
        }
        let quad = LifetimeQuadrature::new(release_timescale, release_timescale_sigma);
        let tables = ReleaseTables::build(&quad, time_min, time_max, n_nodes)?;
        Ok(Self {
            density,
            release_timescale,
            release_rate: 1.0 / release_timescale,
            release_timescale_sigma,
            capture_timescale,
            capture_rate: 1.0 / capture_timescale,
            quad,
            tables,
        })
    }

    /// Population fill fraction at elapsed time `t`, by direct quadrature.
    pub fn fill_fraction_from_time_elapsed(&self, time_elapsed: f64) -> f64 {
        self.quad.fill_fraction(time_elapsed)
    }

    /// Invert the fill fraction by bisection on `[0, time_max]`.
    pub fn time_elapsed_from_fill_fraction(&self, fill: f64, time_max: f64) -> f64 {
        self.quad.time_elapsed_from_fill_fraction(fill, time_max)
    }

    /// Fill after spending one dwell inside the cloud, starting
    /// `time_elapsed` after the last fill. Direct quadrature.
    pub fn fill_fraction_after_slow_capture(&self, time_elapsed: f64, dwell_time: f64) -> f64 {
        self.quad
            .fill_fraction_after_slow_capture(time_elapsed, dwell_time, self.capture_rate)
    }

    /// Tabulate [`Self::fill_fraction_after_slow_capture`] for one dwell
    /// time over the species' release-table range.
    pub fn prep_capture_tables(&self, dwell_time: f64) -> CaptureTables {
        self.prep_capture_tables_with_range(
            dwell_time,
            self.tables.time_min,
            self.tables.time_max,
            self.tables.fill_table.len(),
        )
    }

    /// Tabulate the capture fill over an explicit elapsed-time range.
    pub fn prep_capture_tables_with_range(
        &self,
        dwell_time: f64,
        time_min: f64,
        time_max: f64,
        n_nodes: usize,
    ) -> CaptureTables {
        let d_log_time = (time_max.ln() - time_min.ln()) / (n_nodes - 1) as f64;
        let table: Vec<f64> = (0..n_nodes)
            .map(|i| {
                let t = (time_min.ln() + i as f64 * d_log_time).exp();
                self.fill_fraction_after_slow_capture(t, dwell_time)
            })
            .collect();
        let fill_capture_long_time =
            self.fill_fraction_after_slow_capture(time_max * 100.0, dwell_time);
        CaptureTables { time_min, time_max, d_log_time, table, fill_capture_long_time }
    }

    /// The precomputed release lookup tables.
    #[inline]
    pub fn tables(&self) -> &ReleaseTables {
        &self.tables
    }
}

// ============================================================================
// The species sum type
// ============================================================================

/// Any trap species. The trap manager dispatches on the variant once per
/// transfer, at the boundary, so the watermark arithmetic stays flat.
#[derive(Clone, Debug, PartialEq)]
pub enum TrapSpecies {
    /// Single lifetime, instant capture.
    InstantCapture(TrapInstantCapture),
    /// Single lifetime, slow capture.
    SlowCapture(TrapSlowCapture),
    /// Lifetime continuum, instant capture.
    InstantCaptureContinuum(TrapInstantCaptureContinuum),
    /// Lifetime continuum, slow capture.
    SlowCaptureContinuum(TrapSlowCaptureContinuum),
}

impl TrapSpecies {
    /// Traps per pixel.
    pub fn density(&self) -> f64 {
        match self {
            Self::InstantCapture(t) => t.density,
            Self::SlowCapture(t) => t.density,
            Self::InstantCaptureContinuum(t) => t.density,
            Self::SlowCaptureContinuum(t) => t.density,
        }
    }

    /// Scale the density, e.g. by a per-phase trap fraction.
    pub(crate) fn scale_density(&mut self, factor: f64) {
        match self {
            Self::InstantCapture(t) => t.density *= factor,
            Self::SlowCapture(t) => t.density *= factor,
            Self::InstantCaptureContinuum(t) => t.density *= factor,
            Self::SlowCaptureContinuum(t) => t.density *= factor,
        }
    }

    /// Release timescale (the median, for continuum species).
    pub fn release_timescale(&self) -> f64 {
        match self {
            Self::InstantCapture(t) => t.release_timescale,
            Self::SlowCapture(t) => t.release_timescale,
            Self::InstantCaptureContinuum(t) => t.release_timescale,
            Self::SlowCaptureContinuum(t) => t.release_timescale,
        }
    }

    /// Fill fraction at elapsed time `t` since the last fill.
    pub fn fill_fraction_from_time_elapsed(&self, time_elapsed: f64) -> f64 {
        match self {
            Self::InstantCapture(t) => t.fill_fraction_from_time_elapsed(time_elapsed),
            Self::SlowCapture(t) => t.fill_fraction_from_time_elapsed(time_elapsed),
            Self::InstantCaptureContinuum(t) => t.fill_fraction_from_time_elapsed(time_elapsed),
            Self::SlowCaptureContinuum(t) => t.fill_fraction_from_time_elapsed(time_elapsed),
        }
    }

    /// Exposure fraction over the volume band `[a, b]`.
    #[inline]
    pub(crate) fn exposure_fraction(&self, a: f64, b: f64) -> f64 {
        match self {
            Self::InstantCapture(t) => t.fraction_traps_exposed_per_fractional_volume(a, b),
            _ => 1.0,
        }
    }

    /// Whether capture takes a finite time for this species.
    #[inline]
    pub(crate) fn is_slow_capture(&self) -> bool {
        matches!(self, Self::SlowCapture(_) | Self::SlowCaptureContinuum(_))
    }

    /// Watermark rows a single transfer can add for this species.
    #[inline]
    pub(crate) fn watermarks_per_transfer(&self) -> usize {
        if self.is_slow_capture() {
            2
        } else {
            1
        }
    }
}

impl From<TrapInstantCapture> for TrapSpecies {
    fn from(t: TrapInstantCapture) -> Self {
        Self::InstantCapture(t)
    }
}
impl From<TrapSlowCapture> for TrapSpecies {
    fn from(t: TrapSlowCapture) -> Self {
        Self::SlowCapture(t)
    }
}
impl From<TrapInstantCaptureContinuum> for TrapSpecies {
    fn from(t: TrapInstantCaptureContinuum) -> Self {
        Self::InstantCaptureContinuum(t)
    }
}
impl From<TrapSlowCaptureContinuum> for TrapSpecies {
    fn from(t: TrapSlowCaptureContinuum) -> Self {
        Self::SlowCaptureContinuum(t)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_rel(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() <= epsilon * expected.abs().max(1e-300),
            "expected {expected} (rel {epsilon}), got {actual}"
        );
    }

    fn assert_abs(actual: f64, expected: f64, margin: f64) {
        assert!(
            (actual - expected).abs() <= margin,
            "expected {expected} (abs {margin}), got {actual}"
        );
    }

    #[test]
    fn instant_and_slow_capture_initialisation() {
        let trap_1 = TrapInstantCapture::new(10.0, 2.0).unwrap();
        assert_eq!(trap_1.density, 10.0);
        assert_eq!(trap_1.release_timescale, 2.0);
        assert_eq!(trap_1.release_rate, 0.5);
        assert_eq!(trap_1.fractional_volume_none_exposed, 0.0);
        assert_eq!(trap_1.fractional_volume_full_exposed, 0.0);

        let trap_3 = TrapSlowCapture::new(8.0, 1.0, 0.1).unwrap();
        assert_eq!(trap_3.density, 8.0);
        assert_eq!(trap_3.release_timescale, 1.0);
        assert_eq!(trap_3.capture_timescale, 0.1);
        assert_eq!(trap_3.release_rate, 1.0);
        assert_eq!(trap_3.capture_rate, 10.0);

        // A band renormalises the density to the band-integrated total.
        let trap_4 = TrapInstantCapture::with_occupancy_band(10.0, 1.0, 0.6, 0.8).unwrap();
        assert_eq!(trap_4.fractional_volume_none_exposed, 0.6);
        assert_eq!(trap_4.fractional_volume_full_exposed, 0.8);
        assert_rel(trap_4.density, 10.0 / 0.3, 1e-12);
        assert_eq!(trap_4.release_timescale, 1.0);
        assert_eq!(trap_4.release_rate, 1.0);
    }

    #[test]
    fn invalid_species_are_rejected() {
        assert!(matches!(TrapInstantCapture::new(-1.0, 1.0), Err(TrapError::BadDensity(_))));
        assert!(matches!(
            TrapInstantCapture::new(1.0, 0.0),
            Err(TrapError::BadReleaseTimescale(_))
        ));
        assert!(matches!(
            TrapInstantCapture::with_occupancy_band(1.0, 1.0, 0.8, 0.2),
            Err(TrapError::BadOccupancyBand { .. })
        ));
        assert!(matches!(
            TrapSlowCapture::new(1.0, 1.0, 0.0),
            Err(TrapError::BadCaptureTimescale(_))
        ));
        assert!(matches!(
            TrapInstantCaptureContinuum::new(1.0, 1.0, 0.0),
            Err(TrapError::BadReleaseSigma(_))
        ));
    }

    #[test]
    fn fill_fraction_from_time_elapsed_single_lifetime() {
        let trap_1 = TrapInstantCapture::new(10.0, 2.0).unwrap();
        assert_eq!(trap_1.fill_fraction_from_time_elapsed(1.0), (-1.0f64 / 2.0).exp());
        assert_eq!(trap_1.fill_fraction_from_time_elapsed(123.456), (-123.456f64 / 2.0).exp());

        let trap_2 = TrapSlowCapture::new(10.0, 1.0, 0.5).unwrap();
        assert_eq!(trap_2.fill_fraction_from_time_elapsed(1.0), (-1.0f64).exp());
    }

    #[test]
    fn fraction_traps_exposed_uniform_default() {
        let trap = TrapInstantCapture::new(1.0, 1.0).unwrap();
        assert_eq!(trap.fraction_traps_exposed_per_fractional_volume(0.1, 0.2), 1.0);
        assert_eq!(trap.fraction_traps_exposed_per_fractional_volume(0.0, 1.0), 1.0);
    }

    #[test]
    fn fraction_traps_exposed_step_band() {
        let trap = TrapInstantCapture::with_occupancy_band(1.0, 1.0, 0.8, 0.8).unwrap();
        assert_eq!(trap.fraction_traps_exposed_per_fractional_volume(0.1, 0.2), 0.0);
        assert_eq!(trap.fraction_traps_exposed_per_fractional_volume(0.9, 1.0), 1.0);
        assert_rel(trap.fraction_traps_exposed_per_fractional_volume(0.0, 1.0), 0.2, 1e-12);
        assert_rel(trap.fraction_traps_exposed_per_fractional_volume(0.7, 0.9), 0.5, 1e-12);
    }

    #[test]
    fn fraction_traps_exposed_ramp_band() {
        let trap = TrapInstantCapture::with_occupancy_band(1.0, 1.0, 0.4, 0.6).unwrap();
        assert_eq!(trap.fraction_traps_exposed_per_fractional_volume(0.1, 0.2), 0.0);
        assert_eq!(trap.fraction_traps_exposed_per_fractional_volume(0.9, 1.0), 1.0);
        assert_rel(trap.fraction_traps_exposed_per_fractional_volume(0.0, 1.0), 0.1 + 0.4, 1e-12);
        assert_rel(
            trap.fraction_traps_exposed_per_fractional_volume(0.0, 0.5),
            0.025 / 0.5,
            1e-12,
        );
        assert_rel(
            trap.fraction_traps_exposed_per_fractional_volume(0.3, 0.5),
            0.025 / 0.2,
            1e-12,
        );
        assert_rel(
            trap.fraction_traps_exposed_per_fractional_volume(0.5, 1.0),
            (0.025 + 0.05 + 0.4) / 0.5,
            1e-12,
        );
        assert_rel(
            trap.fraction_traps_exposed_per_fractional_volume(0.5, 0.7),
            (0.05 + 0.025 + 0.1) / 0.2,
            1e-12,
        );
        assert_rel(trap.fraction_traps_exposed_per_fractional_volume(0.4, 0.6), 0.1 / 0.2, 1e-12);
        assert_rel(
            trap.fraction_traps_exposed_per_fractional_volume(0.45, 0.55),
            (0.025 + 0.025) / 0.1,
            1e-12,
        );
    }

    #[test]
    fn fraction_traps_exposed_upper_ramp_band() {
        let trap = TrapInstantCapture::with_occupancy_band(1.0, 1.0, 0.6, 0.8).unwrap();
        assert_eq!(trap.fraction_traps_exposed_per_fractional_volume(0.1, 0.2), 0.0);
        assert_eq!(trap.fraction_traps_exposed_per_fractional_volume(0.9, 1.0), 1.0);
        assert_rel(trap.fraction_traps_exposed_per_fractional_volume(0.0, 1.0), 0.1 + 0.2, 1e-12);
        assert_rel(
            trap.fraction_traps_exposed_per_fractional_volume(0.0, 0.7),
            0.025 / 0.7,
            1e-12,
        );
        assert_rel(
            trap.fraction_traps_exposed_per_fractional_volume(0.7, 1.0),
            (0.025 + 0.05 + 0.2) / 0.3,
            1e-12,
        );
        assert_rel(trap.fraction_traps_exposed_per_fractional_volume(0.6, 0.8), 0.1 / 0.2, 1e-12);
    }

    // ------------------------- continuum: instant capture ------------------

    fn tau_half() -> f64 {
        -1.0 / 0.5f64.ln()
    }

    #[test]
    fn continuum_fill_fraction_resembles_single_lifetime() {
        let trap_1 = TrapInstantCaptureContinuum::new(10.0, tau_half(), 0.1).unwrap();
        let trap_2 = TrapInstantCaptureContinuum::new(10.0, tau_half(), 1.0).unwrap();
        let trap_3 =
            TrapInstantCaptureContinuum::new(10.0, -0.1 / 0.5f64.ln(), 0.001).unwrap();

        assert_rel(trap_1.fill_fraction_from_time_elapsed(1.0), 0.5, 0.01);
        assert_rel(trap_2.fill_fraction_from_time_elapsed(1.0), 0.5, 0.05);
        assert_rel(trap_1.fill_fraction_from_time_elapsed(2.0), 0.25, 0.01);
        assert_rel(trap_2.fill_fraction_from_time_elapsed(2.0), 0.25, 0.2);
        assert_rel(trap_3.fill_fraction_from_time_elapsed(0.1), 0.5, 0.001);

        assert_rel(trap_1.fill_fraction_from_time_elapsed(0.0), 1.0, 1e-12);
        assert_eq!(trap_1.fill_fraction_from_time_elapsed(f64::MAX), 0.0);
    }

    #[test]
    fn continuum_time_elapsed_inverts_fill_fraction() {
        let trap_1 = TrapInstantCaptureContinuum::new(10.0, tau_half(), 0.1).unwrap();
        let trap_2 = TrapInstantCaptureContinuum::new(10.0, tau_half(), 1.0).unwrap();
        let time_max = 999.0;

        assert_rel(trap_1.time_elapsed_from_fill_fraction(0.5, time_max), 1.0, 0.01);
        assert_rel(trap_2.time_elapsed_from_fill_fraction(0.5, time_max), 1.0, 0.1);
        assert_rel(trap_1.time_elapsed_from_fill_fraction(0.25, time_max), 2.0, 0.01);
        assert_rel(trap_2.time_elapsed_from_fill_fraction(0.25, time_max), 2.0, 0.25);

        assert_eq!(trap_1.time_elapsed_from_fill_fraction(1.0, time_max), 0.0);
        assert!(trap_1.time_elapsed_from_fill_fraction(0.0, time_max) >= f64::MAX);

        // Convert and back.
        let roundtrip = trap_1
            .time_elapsed_from_fill_fraction(trap_1.fill_fraction_from_time_elapsed(1.234), time_max);
        assert_rel(roundtrip, 1.234, 1e-6);
        let roundtrip = trap_2
            .time_elapsed_from_fill_fraction(trap_2.fill_fraction_from_time_elapsed(2.468), time_max);
        assert_rel(roundtrip, 2.468, 1e-6);
    }

    #[test]
    fn release_table_endpoints_and_spacing() {
        let trap = TrapInstantCaptureContinuum::with_table_range(
            10.0,
            tau_half(),
            0.1,
            0.1,
            99.0,
            1000,
        )
        .unwrap();
        let tables = trap.tables();

        assert_eq!(tables.time_min, 0.1);
        assert_eq!(tables.time_max, 99.0);
        assert_rel(tables.d_log_time, (99.0f64.ln() - 0.1f64.ln()) / 999.0, 1e-12);

        assert_rel(tables.fill_min, trap.fill_fraction_from_time_elapsed(99.0), 1e-12);
        assert_rel(tables.fill_max, trap.fill_fraction_from_time_elapsed(0.1), 1e-12);
    }

    #[test]
    fn fill_fraction_table_matches_quadrature() {
        let trap = TrapInstantCaptureContinuum::with_table_range(
            10.0,
            tau_half(),
            1.0,
            0.1,
            99.0,
            1000,
        )
        .unwrap();
        let tables = trap.tables();

        // Inside the table.
        let mut log10_time = -1.0;
        while log10_time <= 1.8 {
            let time = 10f64.powf(log10_time);
            assert_abs(
                tables.fill_fraction_from_time_elapsed(time),
                trap.fill_fraction_from_time_elapsed(time),
                2e-4 * trap.fill_fraction_from_time_elapsed(time) + 1e-7,
            );
            log10_time += 0.2;
        }

        // Just outside: extrapolation stays close.
        assert_rel(
            tables.fill_fraction_from_time_elapsed(0.05),
            trap.fill_fraction_from_time_elapsed(0.05),
            1e-1,
        );
        assert_rel(
            tables.fill_fraction_from_time_elapsed(100.0),
            trap.fill_fraction_from_time_elapsed(100.0),
            1e-2,
        );

        // Far outside: saturation.
        assert_eq!(tables.fill_fraction_from_time_elapsed(0.001), 1.0);
        assert_eq!(tables.fill_fraction_from_time_elapsed(2000.0), 0.0);
        assert_eq!(tables.fill_fraction_from_time_elapsed(0.0), 1.0);
        assert_eq!(tables.fill_fraction_from_time_elapsed(f64::MAX), 0.0);
    }

    #[test]
    fn time_elapsed_table_matches_bisection() {
        let trap = TrapInstantCaptureContinuum::with_table_range(
            10.0,
            tau_half(),
            1.0,
            0.1,
            99.0,
            1000,
        )
        .unwrap();
        let tables = trap.tables();
        let time_max = 99.0;

        let mut log10_fill = -2.0;
        while log10_fill < -0.2 {
            let fill = 10f64.powf(log10_fill);
            assert_rel(
                tables.time_elapsed_from_fill_fraction(fill),
                trap.time_elapsed_from_fill_fraction(fill, time_max),
                1e-3,
            );
            log10_fill += 0.2;
        }

        // Outside the table.
        let tiny_fill = trap.fill_fraction_from_time_elapsed(time_max * 1.1);
        assert_rel(
            tables.time_elapsed_from_fill_fraction(tiny_fill),
            trap.time_elapsed_from_fill_fraction(tiny_fill, 2.0 * time_max),
            5e-2,
        );
        assert_abs(
            tables.time_elapsed_from_fill_fraction(0.95),
            trap.time_elapsed_from_fill_fraction(0.95, time_max),
            5e-2,
        );

        // Full and empty.
        assert_eq!(tables.time_elapsed_from_fill_fraction(1.0), 0.0);
        assert!(tables.time_elapsed_from_fill_fraction(0.0) >= f64::MAX);
    }

    #[test]
    fn narrow_continuum_reduces_to_single_lifetime() {
        // σ → 0 collapses the log-normal; at t = τ the fill is e^{-1}.
        let tau = tau_half();
        let single = TrapInstantCapture::new(10.0, tau).unwrap();
        let narrow = TrapInstantCaptureContinuum::new(10.0, tau, 0.01).unwrap();

        assert_abs(
            narrow.fill_fraction_from_time_elapsed(tau),
            single.fill_fraction_from_time_elapsed(tau),
            1e-2,
        );
        assert_abs(
            narrow.tables().fill_fraction_from_time_elapsed(tau),
            single.fill_fraction_from_time_elapsed(tau),
            1e-2,
        );
    }

    // ------------------------- continuum: slow capture ---------------------

    #[test]
    fn slow_continuum_initialisation() {
        let trap_1 = TrapSlowCaptureContinuum::new(10.0, tau_half(), 0.05, 0.1).unwrap();
        assert_eq!(trap_1.density, 10.0);
        assert_eq!(trap_1.release_timescale, tau_half());
        assert_rel(trap_1.release_rate, -(0.5f64.ln()), 1e-12);
        assert_eq!(trap_1.release_timescale_sigma, 0.05);
        assert_eq!(trap_1.capture_timescale, 0.1);
        assert_rel(trap_1.capture_rate, 10.0, 1e-12);
    }

    #[test]
    fn fill_fraction_after_slow_capture_properties() {
        let trap_1 = TrapSlowCaptureContinuum::new(10.0, tau_half(), 0.05, 0.1).unwrap();
        let trap_2 = TrapSlowCaptureContinuum::new(8.0, tau_half(), 0.5, 1.0).unwrap();
        let trap_3 = TrapSlowCaptureContinuum::new(10.0, tau_half(), 0.01, 0.01).unwrap();
        let dwell_time = 1.0;

        // Nearly instant capture fills nearly completely.
        assert_rel(trap_3.fill_fraction_after_slow_capture(1.0, dwell_time), 1.0, 0.01);
        assert_rel(trap_1.fill_fraction_after_slow_capture(1.0, dwell_time), 1.0, 0.1);

        // Longer dwell captures more.
        assert!(
            trap_1.fill_fraction_after_slow_capture(1.0, 0.5)
                < trap_1.fill_fraction_after_slow_capture(1.0, 1.0)
        );
        assert!(
            trap_2.fill_fraction_after_slow_capture(1.0, 1.0)
                < trap_2.fill_fraction_after_slow_capture(1.0, 2.0)
        );

        // Converges for long dwell times.
        assert_rel(
            trap_1.fill_fraction_after_slow_capture(1.0, 10.0),
            trap_1.fill_fraction_after_slow_capture(1.0, 20.0),
            1e-4,
        );

        // Larger initial fill ends larger.
        assert!(
            trap_1.fill_fraction_after_slow_capture(0.0, dwell_time)
                > trap_1.fill_fraction_after_slow_capture(1.0, dwell_time)
        );
        assert!(
            trap_2.fill_fraction_after_slow_capture(10.0, dwell_time)
                > trap_2.fill_fraction_after_slow_capture(20.0, dwell_time)
        );
    }

    #[test]
    fn capture_table_matches_quadrature() {
        let trap = TrapSlowCaptureContinuum::with_table_range(
            8.0,
            tau_half(),
            0.5,
            1.0,
            0.1,
            99.0,
            1000,
        )
        .unwrap();
        let dwell_time = 1.0;
        let tables = trap.prep_capture_tables_with_range(dwell_time, 0.1, 99.0, 1000);

        assert_rel(
            tables.fill_capture_long_time,
            trap.fill_fraction_after_slow_capture(9900.0, dwell_time),
            1e-9,
        );

        let mut log10_time = -1.0;
        while log10_time <= 1.8 {
            let time = 10f64.powf(log10_time);
            assert_abs(
                tables.fill_fraction_after_slow_capture(time),
                trap.fill_fraction_after_slow_capture(time, dwell_time),
                2e-4 * trap.fill_fraction_after_slow_capture(time, dwell_time) + 1e-7,
            );
            log10_time += 0.2;
        }

        // Outside the table: close below, converged above.
        assert_rel(
            tables.fill_fraction_after_slow_capture(0.05),
            trap.fill_fraction_after_slow_capture(0.05, dwell_time),
            1e-2,
        );
        assert_rel(
            tables.fill_fraction_after_slow_capture(1000.0),
            trap.fill_fraction_after_slow_capture(1000.0, dwell_time),
            1e-3,
        );
        assert_eq!(
            tables.fill_fraction_after_slow_capture(f64::MAX),
            tables.fill_capture_long_time
        );
    }

    #[test]
    fn species_enum_dispatch() {
        let species: TrapSpecies = TrapInstantCapture::new(10.0, 2.0).unwrap().into();
        assert_eq!(species.density(), 10.0);
        assert_eq!(species.release_timescale(), 2.0);
        assert!(!species.is_slow_capture());
        assert_eq!(species.watermarks_per_transfer(), 1);

        let species: TrapSpecies = TrapSlowCapture::new(8.0, 1.0, 0.1).unwrap().into();
        assert!(species.is_slow_capture());
        assert_eq!(species.watermarks_per_transfer(), 2);
    }
}
