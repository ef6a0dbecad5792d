use serde::{Deserialize, Serialize};

pub mod encoding;

pub use encoding::{EncodeError, Encoding, Payload};

/// One synthetic metrics snapshot for a single server.
///
/// Field names and types are the wire contract consumed by dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the unix epoch
    pub timestamp: i64,
    /// Percent, 0-100
    pub cpu_usage: f64,
    /// Percent, 0-100
    pub memory_usage: f64,
    /// MB/s
    pub disk_io: f64,
    /// MB/s
    pub network_in: f64,
    /// MB/s
    pub network_out: f64,
    /// Seconds the server entity has existed, never reset
    pub uptime: i64,
    pub hostname: String,
}
