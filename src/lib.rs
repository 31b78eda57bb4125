//! Sparse basis factorization for the revised simplex method.
//!
//! The engine maintains an LU factorization of the basis matrix B (the
//! columns of a constraint matrix A selected by a basic-variable list) and
//! answers the two questions a simplex driver asks on every iteration:
//! solve B·x = r ([`Factor::ftran`]) or Bᵀ·x = r ([`Factor::btran`]), and
//! patch the factorization in place when one basic column is replaced by
//! another ([`Factor::update`], Forrest-Tomlin product form) until enough
//! updates have accumulated that a fresh [`Factor::build`] is preferable.
//!
//! Right-hand sides travel in a caller-owned [`WorkVector`]; the solves
//! switch between hyper-sparse and dense scanning based on the vector's
//! instantaneous density and a running average the caller maintains with
//! [`running_density`].

#[macro_use]
extern crate log;

mod factor;
#[cfg(test)]
mod helpers;
mod ordering;
mod solve;
mod update;
mod vector;

pub use factor::{Factor, Options};
pub use vector::WorkVector;

/// Compressed-column matrix accepted by the engine.
pub type CsMat = sprs::CsMatI<f64, usize>;

/// Instantaneous density above which a solve abandons hyper-sparse mode.
pub const HYPER_CANCEL: f64 = 0.05;
/// Historical-density switch for the lower-triangular FTRAN pass.
pub const HYPER_FTRAN_L: f64 = 0.15;
/// Historical-density switch for the upper-triangular FTRAN pass.
pub const HYPER_FTRAN_U: f64 = 0.10;
/// Historical-density switch for the lower-triangular BTRAN pass.
pub const HYPER_BTRAN_L: f64 = 0.10;
/// Historical-density switch for the upper-triangular BTRAN pass.
pub const HYPER_BTRAN_U: f64 = 0.15;
/// Density of the BTRAN result above which row-wise PRICE should switch to
/// column-wise PRICE in the host.
pub const HYPER_PRICE: f64 = 0.10;
/// Magnitude below which intermediate values are treated as zero.
pub const TINY: f64 = 1e-20;
/// Canonical small nonzero written where an exact cancellation must keep
/// its place in a sparsity pattern.
pub const ZERO: f64 = 1e-50;

/// Sentinel for a deleted pivot slot or an unset lookup entry.
pub(crate) const NIL: usize = usize::MAX;

/// Exponentially weighted density average. Callers keep one per solve
/// operation and feed it back as `expected_density` on the next call.
pub fn running_density(history: f64, latest: f64) -> f64 {
    0.95 * history + 0.05 * latest
}

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// [`Factor::build`] found this many columns with no acceptable pivot
    /// and substituted unit pivots for them. The store is consistent; the
    /// caller decides whether to keep it with the logical replacements or
    /// to repair the basis and rebuild.
    RankDeficient(usize),
    /// The requested update would make the factorization numerically
    /// singular. Nothing was changed; the caller must refactorize.
    Numerical,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::RankDeficient(count) => {
                write!(f, "basis is rank deficient in {} columns", count)
            }
            Error::Numerical => "update pivot is numerically singular".fmt(f),
        }
    }
}

impl std::error::Error for Error {}

/// Outcome of a successful [`Factor::update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateHint {
    /// Further updates are fine.
    Ok,
    /// The update went through, but the update count or the eta-file size
    /// has reached the point where a refactorization pays off.
    UpdateLimitReached,
}

#[cfg(test)]
mod tests {
    use super::running_density;

    #[test]
    fn density_average_converges() {
        let mut history = 1.0;
        for _ in 0..200 {
            history = running_density(history, 0.01);
        }
        assert!(history < 0.02);
        assert!(history > 0.0);
    }
}
