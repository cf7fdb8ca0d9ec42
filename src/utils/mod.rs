//! Ambient utilities: log configuration and developer trace lines.
pub mod devlog;
pub mod logger;
