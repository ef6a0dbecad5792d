use metricast_proto::{EncodeError, Encoding, Payload, Sample};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

mod registry;

pub use registry::{ChannelSubscriber, Subscriber, SubscriberId, SubscriberRegistry, WriteError};

/// Bounded hand-off between the simulators and the broadcaster.
pub fn sample_channel(capacity: usize) -> (mpsc::Sender<Sample>, mpsc::Receiver<Sample>) {
    mpsc::channel(capacity)
}

/// Turns a sample into the bytes every subscriber receives.
pub trait SampleEncoder: Send + Sync {
    fn encode(&self, sample: &Sample) -> Result<Payload, EncodeError>;
}

impl SampleEncoder for Encoding {
    fn encode(&self, sample: &Sample) -> Result<Payload, EncodeError> {
        Encoding::encode(*self, sample)
    }
}

pub struct Broadcaster<E = Encoding> {
    registry: SubscriberRegistry,
    encoder: E,
}

impl<E: SampleEncoder> Broadcaster<E> {
    pub fn new(registry: SubscriberRegistry, encoder: E) -> Self {
        Self { registry, encoder }
    }

    /// Encode once and deliver to every attached subscriber.
    ///
    /// Returns the number of subscribers that accepted the sample, or `None`
    /// if it could not be encoded and was skipped.
    pub async fn broadcast(&self, sample: &Sample) -> Option<usize> {
        let payload = match self.encoder.encode(sample) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(hostname = %sample.hostname, error = %e, "failed to encode sample, skipping");
                return None;
            }
        };

        let delivered = self.registry.deliver(&payload).await;
        trace!(hostname = %sample.hostname, uptime = sample.uptime, delivered, "sample delivered");
        Some(delivered)
    }

    /// Deliver samples in arrival order until cancelled or until every
    /// simulator has gone away.
    ///
    /// Cancellation wins over pending samples: whatever is still queued when
    /// the token fires is discarded.
    pub async fn run(self, mut samples: mpsc::Receiver<Sample>, token: CancellationToken) {
        debug!("broadcaster started");
        let mut forwarded: u64 = 0;

        loop {
            let sample = tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!(forwarded, queued = samples.len(), "broadcaster cancelled");
                    break;
                }
                sample = samples.recv() => match sample {
                    Some(sample) => sample,
                    None => {
                        debug!(forwarded, "sample channel closed, broadcaster stopping");
                        break;
                    }
                },
            };

            if self.broadcast(&sample).await.is_some() {
                forwarded += 1;
            }
        }
    }
}
