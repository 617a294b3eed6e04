pub mod error;
pub mod httpdecode;
pub mod logging;
