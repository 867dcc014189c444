//! Housekeeping: periodic Docker pruning during a farm run and the `clean`
//! command's removal plan.

pub mod clean;
pub mod prune;

pub use clean::{CleanOptions, CleanPlan, CleanReport};
pub use prune::DockerPrune;
