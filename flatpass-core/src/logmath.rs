//! Integer log-domain scores.
//!
//! Every score in the search is a log probability scaled by `1 / ln(base)` and
//! rounded to `i32`, so larger is better and `0` is certainty. `WORST_SCORE` is
//! the "unreachable" sentinel: nothing is ever considered better than it, and
//! arithmetic that falls below it is clamped back to it.

/// Log-domain path score.
pub type Score = i32;

/// Sentinel for unreachable states and unset right-context slots.
pub const WORST_SCORE: Score = -0x2000_0000;

/// The one comparison used for every score decision in the search.
#[inline]
pub fn better_than(a: Score, b: Score) -> bool {
    a > b
}

/// `true` when `s` denotes a reachable path.
#[inline]
pub fn is_reachable(s: Score) -> bool {
    better_than(s, WORST_SCORE)
}

/// Saturating addition clamped at `WORST_SCORE`.
#[inline]
pub fn add(a: Score, b: Score) -> Score {
    a.saturating_add(b).max(WORST_SCORE)
}

/// Converts linear probabilities to integer log scores.
#[derive(Debug, Clone, Copy)]
pub struct LogMath {
    base: f64,
    inv_log_base: f64,
}

impl LogMath {
    /// `base` must exceed 1.0 (`SearchConfig::validate` checks this); a base
    /// ≤ 1 yields a degenerate mapping.
    pub fn new(base: f64) -> Self {
        Self {
            base,
            inv_log_base: 1.0 / base.ln(),
        }
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    /// `log_base(p)`, rounded. Zero (or negative) probabilities map to `WORST_SCORE`.
    pub fn log(&self, p: f64) -> Score {
        if p <= 0.0 {
            return WORST_SCORE;
        }
        let v = (p.ln() * self.inv_log_base).round();
        if v < WORST_SCORE as f64 {
            WORST_SCORE
        } else {
            v as Score
        }
    }

    /// Inverse of [`LogMath::log`].
    pub fn exp(&self, s: Score) -> f64 {
        if !is_reachable(s) {
            return 0.0;
        }
        self.base.powi(s)
    }
}

impl Default for LogMath {
    fn default() -> Self {
        Self::new(1.0001)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn log_of_one_is_zero() {
        assert_eq!(LogMath::default().log(1.0), 0);
    }

    #[test]
    fn log_then_exp_recovers_probability() {
        let lm = LogMath::default();
        for p in [0.5, 0.1, 0.005, 1e-8] {
            assert_relative_eq!(lm.exp(lm.log(p)), p, max_relative = 1e-3);
        }
    }

    #[test]
    fn tiny_probabilities_are_clamped_to_worst() {
        let lm = LogMath::default();
        assert_eq!(lm.log(0.0), WORST_SCORE);
        assert_eq!(lm.log(1e-300_f64.powi(10)), WORST_SCORE);
        assert!(lm.log(1e-64) > WORST_SCORE);
    }

    #[test]
    fn add_clamps_instead_of_overflowing() {
        assert_eq!(add(WORST_SCORE, WORST_SCORE), WORST_SCORE);
        assert_eq!(add(i32::MIN, -1), WORST_SCORE);
        assert_eq!(add(-10, -5), -15);
    }

    #[test]
    fn nothing_is_better_than_worst_except_reachable_scores() {
        assert!(!is_reachable(WORST_SCORE));
        assert!(is_reachable(WORST_SCORE + 1));
        assert!(better_than(-1, -2));
        assert!(!better_than(-2, -2));
    }
}
