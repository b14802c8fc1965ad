// Price/volume helpers used by execution function scoring and edge-case detection

pub mod moving_average;
pub mod momentum;

pub use momentum::percent_change;
pub use moving_average::average_volume;
