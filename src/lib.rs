#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod diffusion;
pub mod error;
pub mod flow;
pub mod graph;
pub mod label;
pub mod matrix;
pub mod observability;

pub use config::{Config, ConfigError};
pub use diffusion::{Activation, DiffusionState, LabelDiffuser, Propagation, PropagationStatus};
pub use error::{ApproximationWarning, FlowError};
pub use flow::ActivationFlow;
pub use graph::{BuildReport, BuilderParams, NeighborGraph, NeighborGraphBuilder};
pub use label::{LabelId, LabelVector};
pub use matrix::{FeatureMatrix, RowMap, RowMask};
