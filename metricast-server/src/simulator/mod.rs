use std::time::Duration;

use metricast_proto::Sample;
use rand::{Rng, SeedableRng, rngs::StdRng};
use time::OffsetDateTime;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, debug_span, info, warn};

mod regime;
mod synth;

pub use regime::{RegimeClass, ServerRuntimeState, ServerStatus};

/// One server identity to simulate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub hostname: String,
    pub class: RegimeClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// The shared channel was full, the sample is gone
    Dropped,
    /// The broadcaster has stopped receiving
    Closed,
}

pub struct Simulator<R> {
    hostname: String,
    class: RegimeClass,
    state: ServerRuntimeState,
    period: Duration,
    output: mpsc::Sender<Sample>,
    rng: R,
}

impl<R: Rng> Simulator<R> {
    pub fn new(spec: &ServerSpec, period: Duration, output: mpsc::Sender<Sample>, rng: R) -> Self {
        Self {
            hostname: spec.hostname.clone(),
            class: spec.class,
            state: ServerRuntimeState::new(spec.class, Instant::now()),
            period,
            output,
            rng,
        }
    }

    pub fn state(&self) -> &ServerRuntimeState {
        &self.state
    }

    /// Advance the server by one tick and return the sample it emits, if any.
    ///
    /// Uptime grows by exactly one whatever the state; the sample reports the
    /// uptime the server had when the tick started.
    pub fn tick(&mut self, now: Instant, timestamp: i64) -> Option<Sample> {
        if let Some(previous) = self.state.evaluate(self.class, now, &mut self.rng) {
            if previous != self.state.status {
                info!(from = %previous, to = %self.state.status, "server changed state");
            } else {
                debug!(status = %previous, "server kept its state");
            }
        }

        let sample = synth::synthesize(
            self.state.status,
            &self.hostname,
            self.state.uptime,
            timestamp,
            &mut self.rng,
        );
        self.state.uptime += 1;
        sample
    }

    /// Hand a sample to the broadcaster without ever waiting for room.
    pub fn push(&self, sample: Sample) -> PushOutcome {
        match self.output.try_send(sample) {
            Ok(()) => PushOutcome::Sent,
            Err(TrySendError::Full(_)) => {
                warn!("sample channel full, dropping sample");
                PushOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Tick until cancelled. Missed ticks are skipped, not replayed.
    ///
    /// Returns the final runtime state.
    pub async fn run(mut self, token: CancellationToken) -> ServerRuntimeState {
        debug!(class = %self.class, period = ?self.period, "simulator started");

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!(uptime = self.state.uptime, "simulator cancelled");
                    break;
                }
                now = ticker.tick() => {
                    let Some(sample) = self.tick(now, unix_timestamp()) else {
                        continue;
                    };
                    if self.push(sample) == PushOutcome::Closed {
                        debug!("sample channel closed, stopping simulator");
                        break;
                    }
                }
            }
        }

        self.state
    }
}

fn unix_timestamp() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Spawn one simulator task per server on `tracker`.
///
/// Each task observes a child of `token`. The caller keeps no sender, so the
/// channel closes once every simulator has returned.
pub fn spawn_fleet(
    servers: &[ServerSpec],
    period: Duration,
    output: mpsc::Sender<Sample>,
    token: &CancellationToken,
    tracker: &TaskTracker,
) {
    for spec in servers {
        let simulator = Simulator::new(spec, period, output.clone(), StdRng::from_os_rng());
        debug!(
            hostname = %spec.hostname,
            class = %spec.class,
            status = %simulator.state().status,
            "seeded simulator"
        );
        tracker.spawn(
            simulator
                .run(token.child_token())
                .instrument(debug_span!("simulator", hostname = %spec.hostname)),
        );
    }
    info!(servers = servers.len(), ?period, "simulator fleet started");
}
