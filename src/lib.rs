//! Crate root: public surface and engine-wide invariants
//!
//! `cticlock` models and corrects Charge Transfer Inefficiency (CTI) in
//! CCD image sensors. During readout a CCD shifts electron packets
//! pixel-by-pixel toward the register; lattice defects ("traps") capture
//! electrons in passing and release them some transfers later, smearing
//! bright features into trailing streaks. The crate forward-models that
//! smear ([`add_cti`]) and removes it by iterative model inversion
//! ([`remove_cti`]).
//!
//! ## Invariants
//!
//! - **Conservation.** Every exchange returns exactly the change in
//!   trapped charge, so electrons are moved between pixels and traps,
//!   never created. With no trap species, clocking is the identity.
//!
//! - **Express column sums.** For any compression setting, each pixel's
//!   express weights sum to its true transfer count
//!   (`row + 1 + offset`); the compressed model converges to the exact
//!   one as `express → n_rows`.
//!
//! - **Window isolation.** The schedule always covers the full column, so
//!   windowed runs reproduce the full run exactly inside the window and
//!   leave everything outside untouched.
//!
//! - **Bounded state.** A trap manager's watermark table is pre-sized to
//!   `max_n_transfers · n_watermarks_per_transfer + 1` rows and never
//!   reallocates inside the clocking loop; overflowing it is detected and
//!   surfaced as a precise error, never UB.
//!
//! - **Shared-immutable inputs.** Trap species, the CCD description, and
//!   a built schedule are immutable after construction and may be shared
//!   across columns and threads; each clocking direction owns its trap
//!   managers and mutates one image exclusively.
//!
//! Failure modes are precise errors per module ([`TrapError`],
//! [`CcdError`], [`RoeError`], [`WatermarkError`], [`ClockError`],
//! [`ImageError`]); the engine never prints to stdout and reports through
//! `tracing` only.
//!
//! ## Example
//!
//! ```
//! use cticlock::{
//!     add_cti, Ccd, CcdPhase, ClockOptions, ClockParams, Image, Roe,
//!     TrapInstantCapture, TrapSpecies,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let traps: Vec<TrapSpecies> = vec![TrapInstantCapture::new(10.0, 1.2)?.into()];
//! let ccd = Ccd::single_phase(CcdPhase::new(1e4, 0.0, 1.0, 0.0)?);
//! let roe = Roe::simple(vec![1.0])?;
//!
//! let mut image = Image::zeros(8, 1)?;
//! image.set(2, 0, 500.0);
//!
//! let params = ClockParams::new(&roe, &ccd, &traps);
//! let trailed = add_cti(&image, Some(&params), None, ClockOptions::default())?;
//! assert!(trailed.get(2, 0) < 500.0); // charge lost to traps...
//! assert!(trailed.get(3, 0) > 0.0); // ...trails into later rows
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// CCD well-fill model (cloud volume from electron count).
pub mod ccd;
/// Clocking driver, `add_cti`, and iterative `remove_cti`.
pub mod cti;
/// Serde model-file descriptors for the CLIs.
pub mod config;
/// Image container and whitespace text I/O.
pub mod image;
/// Readout-electronics schedules (express and store-state matrices).
pub mod roe;
/// The watermark engine: per-column trap occupancy and exchanges.
pub mod trap_managers;
/// Trap species and their release/capture kinetics.
pub mod traps;
/// Small shared numeric helpers (clamp, quadrature).
pub mod util;

// ============================================================================
// Canonical re-exports (single definition sites, imported from the root)
// ============================================================================

pub use crate::ccd::{Ccd, CcdError, CcdPhase};
pub use crate::cti::{
    add_cti, clock_charge_in_one_direction, remove_cti, ClockError, ClockOptions, ClockParams,
};
pub use crate::image::{Image, ImageError};
pub use crate::roe::{
    express_matrix_from_pixels_and_express, ExpressSchedule, Roe, RoeError, RoeKind,
};
pub use crate::trap_managers::{TrapManager, TrapManagerSet, WatermarkError};
pub use crate::traps::{
    TrapError, TrapInstantCapture, TrapInstantCaptureContinuum, TrapSlowCapture,
    TrapSlowCaptureContinuum, TrapSpecies,
};
