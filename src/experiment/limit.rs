//! Threshold predicates over a scalar signal.
//!
//! Segments end, and abort conditions fire, when their `LimitCondition` is
//! satisfied by an observed signal value.

use serde::{Deserialize, Serialize};

/// Comparison applied between an observed value and a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Comparator {
    /// `value < threshold`
    LessThan,
    /// `value <= threshold`
    AtMost,
    /// `value > threshold`
    GreaterThan,
    /// `value >= threshold`
    AtLeast,
    /// `|value - threshold| <= tolerance`
    Within {
        /// Allowed absolute deviation from the threshold
        tolerance: f64,
    },
}

/// A predicate of the form `<signal> <comparator> <threshold>`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitCondition {
    /// How the observed value is compared
    pub comparator: Comparator,
    /// Value compared against
    pub threshold: f64,
}

impl LimitCondition {
    /// Satisfied when the value drops below `threshold`.
    pub fn below(threshold: f64) -> Self {
        Self {
            comparator: Comparator::LessThan,
            threshold,
        }
    }

    /// Satisfied when the value is at most `threshold`.
    pub fn at_most(threshold: f64) -> Self {
        Self {
            comparator: Comparator::AtMost,
            threshold,
        }
    }

    /// Satisfied when the value rises above `threshold`.
    pub fn above(threshold: f64) -> Self {
        Self {
            comparator: Comparator::GreaterThan,
            threshold,
        }
    }

    /// Satisfied when the value is at least `threshold`.
    pub fn at_least(threshold: f64) -> Self {
        Self {
            comparator: Comparator::AtLeast,
            threshold,
        }
    }

    /// Satisfied when the value is within `tolerance` of `target`.
    pub fn near(target: f64, tolerance: f64) -> Self {
        Self {
            comparator: Comparator::Within {
                tolerance: tolerance.abs(),
            },
            threshold: target,
        }
    }

    /// Evaluate the predicate against an observed value.
    ///
    /// NaN never satisfies a limit.
    pub fn is_satisfied(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        match self.comparator {
            Comparator::LessThan => value < self.threshold,
            Comparator::AtMost => value <= self.threshold,
            Comparator::GreaterThan => value > self.threshold,
            Comparator::AtLeast => value >= self.threshold,
            Comparator::Within { tolerance } => (value - self.threshold).abs() <= tolerance,
        }
    }

    /// Render the predicate against a named signal, e.g. `T >= 100`.
    pub fn describe(&self, signal: &str) -> String {
        format!("{} {}", signal, self)
    }
}

impl std::fmt::Display for LimitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.comparator {
            Comparator::LessThan => write!(f, "< {}", self.threshold),
            Comparator::AtMost => write!(f, "<= {}", self.threshold),
            Comparator::GreaterThan => write!(f, "> {}", self.threshold),
            Comparator::AtLeast => write!(f, ">= {}", self.threshold),
            Comparator::Within { tolerance } => {
                write!(f, "≈ {} (±{})", self.threshold, tolerance)
            }
        }
    }
}
