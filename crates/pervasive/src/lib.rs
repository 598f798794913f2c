pub mod aggregate;
pub mod config;
pub mod controller;
pub mod grid;
pub mod model;
pub mod network;
pub mod predictor;
pub mod session;
pub mod simultaneous;

pub use aggregate::{Aggregated, Aggregator};
pub use config::{Aggregation, ConfigError, ModelConfig, NetworkKind};
pub use controller::{Action, Controller, Oracle, OracleLabels};
pub use grid::{build_grid, GridBuilder};
pub use model::{GridModel, TrainOutput};
pub use network::{build_network, GridNetwork};
pub use predictor::Predictor;
pub use session::DecodingSession;
pub use simultaneous::{greedy_decode, DecodeOptions, DecodeOutput, EmbeddingTable, TargetEmbedder};
