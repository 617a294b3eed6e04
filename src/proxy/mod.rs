pub mod ca;
pub mod content;
pub mod exporter;
pub mod installer;
pub mod monitor;
pub mod perf;
pub mod server;
pub mod signer;
