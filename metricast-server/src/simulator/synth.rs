use metricast_proto::Sample;
use rand::Rng;

use super::regime::ServerStatus;

/// A metric range: inclusive `base` plus a uniform draw over `[0, width)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub base: f64,
    pub width: f64,
}

impl Span {
    const fn new(base: f64, width: f64) -> Self {
        Self { base, width }
    }

    fn draw<R: Rng + ?Sized>(self, rng: &mut R) -> f64 {
        self.base + rng.random::<f64>() * self.width
    }

    pub fn contains(self, value: f64) -> bool {
        value >= self.base && value < self.base + self.width
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricRanges {
    pub cpu: Span,
    pub memory: Span,
    pub disk_io: Span,
    /// Shared by inbound and outbound traffic, drawn independently.
    pub network: Span,
}

const NORMAL: MetricRanges = MetricRanges {
    cpu: Span::new(20.0, 40.0),
    memory: Span::new(30.0, 40.0),
    disk_io: Span::new(50.0, 200.0),
    network: Span::new(20.0, 80.0),
};

const OVERLOADED: MetricRanges = MetricRanges {
    cpu: Span::new(80.0, 20.0),
    memory: Span::new(75.0, 25.0),
    disk_io: Span::new(400.0, 600.0),
    network: Span::new(150.0, 350.0),
};

impl ServerStatus {
    /// Value ranges for a state, or `None` when the server emits nothing.
    pub fn ranges(self) -> Option<&'static MetricRanges> {
        match self {
            ServerStatus::Normal => Some(&NORMAL),
            ServerStatus::Overloaded => Some(&OVERLOADED),
            ServerStatus::Offline => None,
        }
    }
}

/// Build the sample for one tick. Offline servers produce nothing.
pub fn synthesize<R: Rng + ?Sized>(
    status: ServerStatus,
    hostname: &str,
    uptime: i64,
    timestamp: i64,
    rng: &mut R,
) -> Option<Sample> {
    let ranges = status.ranges()?;
    Some(Sample {
        timestamp,
        cpu_usage: ranges.cpu.draw(rng),
        memory_usage: ranges.memory.draw(rng),
        disk_io: ranges.disk_io.draw(rng),
        network_in: ranges.network.draw(rng),
        network_out: ranges.network.draw(rng),
        uptime,
        hostname: hostname.to_owned(),
    })
}
