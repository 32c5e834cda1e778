//! Configuration loading for sherpa-sync.

pub mod settings;

pub use settings::SyncOptions;
