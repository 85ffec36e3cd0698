// algorithm module
pub mod algorithm {
    pub mod svd;
    pub mod geometry;
    pub mod stats;
}

// cluster module
pub mod cluster {
    pub mod region;
    pub mod kmeans;
    pub mod hierarchy;
}

// validation module
pub mod validation {
    pub mod rule;
    pub mod stages;
    pub mod protect;
    pub mod finalize;
    pub mod raster;
    pub mod single;
}

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use cluster::region::{Candidate, Candidates, ChannelRange, Cluster, ClusterInfo, RealSignal};
pub use validation::rule::ClusterRule;
pub use validation::raster::{validate_raster, AlgorithmSelection, ClusteringAlgorithm, RasterValidation, ValidateLineRaster};
pub use validation::rule::LineSetup;
pub use validation::single::{validate_pointing, PointingValidation};
