//! Turning raw scores into thresholds and grades.

pub mod corrector;
pub mod thresholder;
