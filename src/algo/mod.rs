pub mod ensemble;
pub mod ewma;
pub mod votes;

pub use ensemble::{Ensemble, EnsembleConfig, KNOWN_ALGORITHMS};
pub use ewma::Ewma;
