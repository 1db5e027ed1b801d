// Library shared by the relay and tab binaries (and the integration tests)

pub mod api;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod models;
pub mod relay;
pub mod store;
pub mod subscription;
pub mod tab;
pub mod version;
