/*!

These are generic structures and algorithms: they do not depend on anything specific to this codebase or application.

*/

mod moving_average;
mod random;
mod statistics;

pub use moving_average::{EMA, ExponentialMovingAverage};
pub use random::RandomGenerator;
pub use statistics::{Statistic, Statistics};
