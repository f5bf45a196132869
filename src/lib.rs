//! genoplate: allele-discrimination genotyping from real-time PCR exports
//!
//! Reads CFX and QuantStudio exports into one [`model::Dataset`], then
//! normalizes, clusters and scores it. Every computation takes its inputs
//! explicitly and returns a fresh result.

pub mod assemble;
pub mod batch;
pub mod cluster;
pub mod compare;
pub mod config;
pub mod ct;
pub mod detect;
pub mod error;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod onset;
pub mod output;
pub mod parsers;
pub mod qc;
pub mod scoring;
pub mod session;
pub mod stats;
pub mod well;
mod xml;

pub use error::{NormalizationError, ParseError};
pub use model::{Dataset, GenotypeLabel, ThresholdConfig};
pub use normalize::RoxMode;
pub use parsers::{parse, parse_path};
pub use session::AnalysisSession;
pub use well::WellId;
