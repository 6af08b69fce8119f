//! Sample library for mixdown - decoding, loading, and configuration

mod config;
mod decoder;
mod loader;

pub use config::Config;
pub use decoder::DecodedSource;
pub use loader::{LoadError, LoadedSample, SampleLoader};
