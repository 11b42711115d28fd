//! Bookkeeping for the active sensor subscriptions of one session.
//!
//! Tracks which sensors still owe an initial value and detects the moment the
//! last one arrives, which is when the bridge is considered ready.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use thiserror::Error;

use crate::bridge_logic::sensors::SensorDescriptor;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("sensor '{name}' produced by more than one template")]
    DuplicateSensor { name: String },
}

/// Applies a sampling strategy for one sensor on the transport. Implemented
/// by the portal client; tests substitute their own.
pub trait SamplingSetup {
    fn set_strategy(
        &mut self,
        name: &str,
        strategy: &str,
    ) -> impl Future<Output = Result<(), String>> + Send;
}

#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    sensors: HashMap<String, SensorDescriptor>,
    /// Remote names in registration order, for deterministic strategy setup.
    order: Vec<String>,
    /// Sensors whose initial value is still outstanding.
    waiting: usize,
    completed: bool,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a descriptor set has been installed; updates arriving before
    /// that are not ours to judge.
    pub fn is_registered(&self) -> bool {
        !self.sensors.is_empty()
    }

    pub fn get(&self, remote_name: &str) -> Option<&SensorDescriptor> {
        self.sensors.get(remote_name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn waiting(&self) -> usize {
        self.waiting
    }

    /// Install the descriptor set and initialize the countdown. A remote name
    /// produced by two templates is a configuration error, not a silent
    /// overwrite.
    pub fn insert_all(&mut self, descriptors: Vec<SensorDescriptor>) -> Result<(), TrackerError> {
        for descriptor in descriptors {
            let name = descriptor.remote_name.clone();
            if self.sensors.insert(name.clone(), descriptor).is_some() {
                return Err(TrackerError::DuplicateSensor { name });
            }
            self.order.push(name);
            self.waiting += 1;
        }
        Ok(())
    }

    /// Record that strategy setup failed for a sensor: it will never push an
    /// initial value, so stop waiting for one. Later updates for it are still
    /// stored best-effort but no longer affect completion.
    pub fn strategy_failed(&mut self, remote_name: &str) {
        if let Some(sensor) = self.sensors.get_mut(remote_name) {
            if sensor.waiting {
                sensor.waiting = false;
                self.waiting -= 1;
            }
        }
    }

    /// Record an accepted value for a sensor. Returns true exactly once: when
    /// the last outstanding initial value arrives.
    pub fn on_value_received(&mut self, remote_name: &str) -> bool {
        let Some(sensor) = self.sensors.get_mut(remote_name) else {
            return false;
        };
        if !sensor.waiting {
            return false;
        }
        sensor.waiting = false;
        self.waiting -= 1;
        if self.waiting == 0 && !self.completed {
            self.completed = true;
            return true;
        }
        false
    }

    /// Install `descriptors` and set each sensor's sampling strategy through
    /// `setup`. Setup failures are logged and excluded from the completion
    /// countdown; they do not abort the remaining sensors.
    pub async fn register<S: SamplingSetup>(
        tracker: &Mutex<SubscriptionTracker>,
        descriptors: Vec<SensorDescriptor>,
        setup: &mut S,
    ) -> Result<(), TrackerError> {
        let pending: Vec<(String, String)> = {
            let mut guard = tracker.lock().expect("tracker lock poisoned");
            guard.insert_all(descriptors)?;
            guard
                .order
                .iter()
                .map(|name| (name.clone(), guard.sensors[name].sampling.clone()))
                .collect()
        };
        for (name, strategy) in pending {
            match setup.set_strategy(&name, &strategy).await {
                Ok(()) => {
                    log::info!("Set sampling strategy on {} to {}", name, strategy);
                }
                Err(info) => {
                    log::error!("Failed to set sampling strategy on {}: {}", name, info);
                    // Not going to get any values, so don't wait for it
                    tracker
                        .lock()
                        .expect("tracker lock poisoned")
                        .strategy_failed(&name);
                }
            }
        }
        Ok(())
    }
}
