//! Periodic publish sweep
//!
//! Once per `publish_delay` every publishing entity is sampled and its value
//! published to `<root>/<topic_suffix>` if the session is dirty or the value
//! changed (beacons publish on dirty sweeps only). A sweep never blocks on the
//! broker: publish failures and sensor errors are logged and the entry is
//! retried on the next sweep.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::registry::{PublishPolicy, TopicRegistry};
use crate::session::SessionHandle;

/// Counters for one sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// The sweep ignored change suppression
    pub forced: bool,
    pub published: usize,
    pub suppressed: usize,
    pub failed: usize,
    /// Entities whose sample could not be read
    pub skipped: usize,
}

pub struct PublishLoop {
    registry: TopicRegistry,
    session: SessionHandle,
    topic_root: String,
    publish_delay: Duration,
    full_publish_cycle: u32,
}

impl PublishLoop {
    pub fn new(
        registry: TopicRegistry,
        session: SessionHandle,
        topic_root: impl Into<String>,
        publish_delay: Duration,
        full_publish_cycle: u32,
    ) -> Self {
        Self {
            registry,
            session,
            topic_root: topic_root.into(),
            publish_delay,
            full_publish_cycle,
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// One pass over all publishing entities
    pub fn sweep(&mut self) -> SweepReport {
        let state = self.session.state().clone();
        let forced = state.with(|s| s.begin_sweep());
        let mut report = SweepReport {
            forced,
            ..SweepReport::default()
        };

        for entry in self.registry.entries_mut() {
            let topic = format!("{}/{}", self.topic_root, entry.topic_suffix());
            let last_value = entry.last_value.clone();
            let Some(publisher) = entry.publisher_mut() else {
                continue;
            };

            let value = match publisher.sample() {
                Ok(value) => value,
                Err(e) => {
                    error!("Could not read value for topic {}: {}", topic, e);
                    report.skipped += 1;
                    continue;
                }
            };

            let changed = last_value.as_deref() != Some(value.as_str());
            let due = match publisher.policy() {
                PublishPolicy::OnChange => forced || changed,
                PublishPolicy::RefreshOnly => forced,
            };
            if !due {
                report.suppressed += 1;
                continue;
            }

            match self.session.publish(&topic, &value, false) {
                Ok(()) => {
                    debug!("Send {} to topic {}", value, topic);
                    entry.last_value = Some(value);
                    report.published += 1;
                }
                Err(e) => {
                    error!("Failed to send message to topic {}: {}", topic, e);
                    report.failed += 1;
                }
            }
        }

        state.with(|s| {
            // A refresh that did not reach the broker is still owed.
            if forced && (report.failed > 0 || report.skipped > 0) {
                s.dirty = true;
            }
            s.finish_sweep(self.full_publish_cycle)
        });
        report
    }

    /// Sweep every `publish_delay` until `shutdown` resolves.
    ///
    /// Sensor reads block, so each sweep runs on the blocking pool.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        info!(
            "Starting publish loop: every {}s, full publish every {} sweeps",
            self.publish_delay.as_secs(),
            self.full_publish_cycle + 1
        );
        tokio::pin!(shutdown);

        let mut publish_loop = self;
        loop {
            let sweep = tokio::task::spawn_blocking(move || {
                let report = publish_loop.sweep();
                (publish_loop, report)
            });
            let (swept, report) = match sweep.await {
                Ok(done) => done,
                Err(e) => {
                    error!("Publish sweep aborted: {}", e);
                    return;
                }
            };
            publish_loop = swept;
            debug!("Sweep finished: {:?}", report);

            tokio::select! {
                _ = &mut shutdown => {
                    warn!("Termination requested. Stop client...");
                    return;
                }
                _ = tokio::time::sleep(publish_loop.publish_delay) => {}
            }
        }
    }
}
