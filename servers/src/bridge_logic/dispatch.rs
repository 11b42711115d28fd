//! Routing of incoming sensor updates: bootstrap fact resolution, status
//! filtering, value conversion and the state-store write.
//!
//! Every failure class here is isolated to the update that caused it; the
//! feed as a whole keeps flowing.

use crate::bridge_logic::model::SensorUpdate;
use crate::bridge_logic::state::SessionState;
use crate::bridge_logic::store::{StateStore, StoreError};

const ACCEPTED_STATUSES: [&str; 3] = ["nominal", "warn", "error"];

/// Process one update. Returns true on the initial-snapshot completion edge,
/// which fires at most once per session.
pub async fn process_update<S: StateStore>(
    update: &SensorUpdate,
    session: &SessionState,
    store: &mut S,
) -> bool {
    log::debug!("Received update {:?}", update);
    handle_bootstrap(update, session);

    // Copy the descriptor fields we need so no lock is held across the store
    // write below.
    let descriptor = {
        let tracker = session.tracker.lock().expect("tracker lock poisoned");
        if !tracker.is_registered() {
            // Updates arriving before the sensor set exists are not ours yet
            return false;
        }
        tracker
            .get(&update.name)
            .map(|sensor| (sensor.local_name.clone(), sensor.immutable, sensor.convert))
    };

    if !ACCEPTED_STATUSES.contains(&update.status.as_str()) {
        log::warn!(
            "Sensor {} received update '{}' with status '{}' (ignored)",
            update.name,
            update.value,
            update.status
        );
        return false;
    }

    let Some((local_name, immutable, convert)) = descriptor else {
        log::warn!(
            "Sensor {} received update '{}' but we didn't subscribe (ignored)",
            update.name,
            update.value
        );
        return false;
    };

    let value = match convert {
        Some(convert) => match convert.apply(&update.value) {
            Ok(value) => value,
            Err(err) => {
                log::warn!(
                    "Failed to convert {}, ignoring (value was {}): {}",
                    update.name,
                    update.value,
                    err
                );
                return false;
            }
        },
        None => update.value.clone(),
    };

    match store
        .add(&local_name, &value, Some(update.timestamp), immutable)
        .await
    {
        Ok(()) => {
            log::debug!(
                "Updated {} to {} with timestamp {}",
                local_name,
                value,
                update.timestamp
            );
        }
        Err(err @ StoreError::ImmutableKeyConflict { .. }) => {
            log::error!(
                "Failed to set {} to {} with timestamp {}: {}",
                local_name,
                value,
                update.timestamp,
                err
            );
        }
        Err(err) => {
            log::error!("Failed to write {} to the state store: {}", local_name, err);
        }
    }

    // The write outcome does not matter here: the sensor produced a usable
    // value, so it no longer counts as waiting.
    session
        .tracker
        .lock()
        .expect("tracker lock poisoned")
        .on_value_received(&update.name)
}

/// Offer an update to the unresolved bootstrap fact cells. Only the first
/// nominal-status update for each fact resolves it.
fn handle_bootstrap(update: &SensorUpdate, session: &SessionState) {
    if update.status != "nominal" {
        return;
    }
    let Some(names) = session.names() else {
        return;
    };
    let Some(text) = update.value.as_str() else {
        return;
    };
    let facts = &session.facts;

    if update.name == format!("{}_pool_resources", names.sub) {
        if !facts.pool_resources.is_resolved() {
            let resources: Vec<String> = text.split(',').map(str::to_string).collect();
            let receptors: Vec<String> =
                resources.iter().filter(|r| is_receptor(r)).cloned().collect();
            session.set_receptors(receptors);
            facts.pool_resources.resolve(resources);
        }
    } else if update.name == format!("{}_input_labels", names.cbf) {
        if !facts.input_labels.is_resolved() {
            let labels = text.split(',').map(str::to_string).collect();
            facts.input_labels.resolve(labels);
        }
    } else if update.name == format!("{}_band", names.sub) && !facts.band.is_resolved() {
        facts.band.resolve(text.to_string());
    }
}

/// Receptor identifiers look like `m` followed by digits; everything else in
/// the resource pool is a proxy or controller.
fn is_receptor(name: &str) -> bool {
    name.strip_prefix('m')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}
