//! Orchestration of one bridge session: connect, discover the subarray,
//! subscribe, then feed updates into the state store until shutdown.
//!
//! All updates flow through the single select loop in `run`, so the startup
//! sequence can await bootstrap facts while the same loop keeps resolving
//! them.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use tokio::sync::broadcast;

use crate::bridge_logic::config::Settings;
use crate::bridge_logic::dispatch;
use crate::bridge_logic::operator::{OperatorHandle, OperatorServer};
use crate::bridge_logic::portal::{PortalClient, PortalSampling};
use crate::bridge_logic::sensors::sensor_templates;
use crate::bridge_logic::state::SessionState;
use crate::bridge_logic::store::{StateStore, TelescopeState};
use crate::bridge_logic::substitutions::{build_substitutions, SessionNames};
use crate::bridge_logic::tracker::SubscriptionTracker;

/// Well-known state key recording the bridge lifecycle for operators.
pub const STATUS_KEY: &str = "sdp_bridge_status";

pub async fn run(settings: Settings, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let mut store = TelescopeState::connect(&settings.store_url)
        .await
        .context("connecting to the telescope state store")?;
    let session = SessionState::new();
    session.parse_streams(&settings.streams);

    set_status(&mut store, "connecting").await;
    let (portal, mut updates) = PortalClient::connect(&settings.url)
        .await
        .context("connecting to the portal")?;

    let operator_server = OperatorServer::new(&settings.host, settings.port);
    let mut operator: Option<OperatorHandle> = None;

    let mut startup = Box::pin(startup(
        portal.clone(),
        session.clone(),
        store.clone(),
        settings.clone(),
    ));
    let mut startup_done = false;

    loop {
        tokio::select! {
            result = &mut startup, if !startup_done => {
                startup_done = true;
                match result {
                    Ok(()) => log::info!("Startup complete"),
                    Err(err) => {
                        log::error!("Exception during startup: {:#}", err);
                        break;
                    }
                }
            }
            maybe_update = updates.recv() => {
                match maybe_update {
                    Some(update) => {
                        if dispatch::process_update(&update, &session, &mut store).await {
                            log::info!("Initial values for all sensors seen, starting operator server");
                            set_status(&mut store, "ready").await;
                            match operator_server.start().await {
                                Ok(handle) => operator = Some(handle),
                                Err(err) => log::error!("Failed to start operator server: {}", err),
                            }
                        }
                    }
                    None => {
                        log::error!("Portal connection lost");
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                log::info!("Shutdown requested");
                break;
            }
        }
    }

    close(&portal, &session, operator).await;
    Ok(())
}

/// The startup sequence: namespace, subarray names, bootstrap facts, template
/// expansion, subscription and sampling setup. Any error here is fatal to the
/// session.
async fn startup(
    portal: PortalClient,
    session: SessionState,
    mut store: TelescopeState,
    settings: Settings,
) -> Result<()> {
    let namespace = match &settings.namespace {
        Some(namespace) => namespace.clone(),
        None => {
            let sitemap = portal.sitemap().await.context("fetching the portal sitemap")?;
            let sub_nr = sitemap
                .sub_nr
                .ok_or_else(|| anyhow!("subarray number not known"))?;
            format!("sp_subarray_{}", sub_nr)
        }
    };
    session.set_namespace(&namespace);

    let names = SessionNames {
        sub: portal.subarray_lookup("sub").await?,
        cbf: portal.subarray_lookup("cbf").await?,
        sdp: portal.subarray_lookup("sdp").await?,
    };
    session.set_names(names.clone());

    set_status(&mut store, "initialising").await;

    // First find out which resources are allocated to the subarray
    get_resources(&portal, &session, &namespace).await?;

    // Now we can tell which sensors to subscribe to
    let band = session.facts.band.wait().await;
    let input_labels = session.facts.input_labels.wait().await;
    let substitutions = build_substitutions(
        &names,
        &session.receptors(),
        &band,
        &input_labels,
        &session.instruments(),
        &session.streams_with_type(),
        settings.collapse_streams,
    );

    let mut descriptors = Vec::new();
    for template in sensor_templates() {
        let expanded = template.expand(&substitutions)?;
        if expanded.is_empty() {
            log::warn!("No sensors expanded from template {}", template.remote_pattern());
        }
        descriptors.extend(expanded);
    }

    let sensor_names: Vec<String> = descriptors
        .iter()
        .map(|descriptor| descriptor.remote_name.clone())
        .collect();
    let count = portal.subscribe(&namespace, &sensor_names).await?;
    log::info!("Subscribed to {} channels", count);

    let mut sampling = PortalSampling {
        portal: &portal,
        namespace: &namespace,
    };
    SubscriptionTracker::register(&session.tracker, descriptors, &mut sampling).await?;
    Ok(())
}

/// Discover the subarray's resource pool, input labels and band by
/// subscribing to each bootstrap sensor in turn and waiting for its value.
async fn get_resources(
    portal: &PortalClient,
    session: &SessionState,
    namespace: &str,
) -> Result<()> {
    let names = session
        .names()
        .ok_or_else(|| anyhow!("subarray names not resolved"))?;

    let sensor = format!("{}_pool_resources", names.sub);
    subscribe_one(portal, namespace, &sensor).await?;
    // Wait until the update callback delivers the value
    session.facts.pool_resources.wait().await;
    portal.unsubscribe(namespace, Some(std::slice::from_ref(&sensor))).await?;

    let sensor = format!("{}_input_labels", names.cbf);
    subscribe_one(portal, namespace, &sensor).await?;
    session.facts.input_labels.wait().await;
    portal.unsubscribe(namespace, Some(std::slice::from_ref(&sensor))).await?;

    // Finally we need the band
    let sensor = format!("{}_band", names.sub);
    subscribe_one(portal, namespace, &sensor).await?;
    session.facts.band.wait().await;
    portal.unsubscribe(namespace, Some(std::slice::from_ref(&sensor))).await?;

    Ok(())
}

/// Subscribe to a single bootstrap sensor with the plain event strategy. A
/// failure here is fatal to startup, unlike the per-sensor setup later.
async fn subscribe_one(portal: &PortalClient, namespace: &str, sensor: &str) -> Result<()> {
    let count = portal.subscribe(namespace, &[sensor.to_string()]).await?;
    if count != 1 {
        bail!("Expected 1 sensor for {}, found {}", sensor, count);
    }
    let result = portal.set_sampling_strategy(namespace, sensor, "event").await?;
    if result.success {
        log::info!("Set sampling strategy on {} to event", sensor);
        Ok(())
    } else {
        bail!("Failed to set sampling strategy on {}: {}", sensor, result.info)
    }
}

async fn set_status<S: StateStore>(store: &mut S, status: &str) {
    log::info!("Bridge status: {}", status);
    if let Err(err) = store.add(STATUS_KEY, &json!(status), None, false).await {
        log::error!("Failed to update {}: {}", STATUS_KEY, err);
    }
}

/// Orderly teardown. Tolerates a dead portal connection and an operator
/// server that never started.
async fn close(portal: &PortalClient, session: &SessionState, operator: Option<OperatorHandle>) {
    if let Some(namespace) = session.namespace() {
        if let Err(err) = portal.unsubscribe(&namespace, None).await {
            log::warn!("Failed to unsubscribe during shutdown: {}", err);
        }
    }
    portal.disconnect();
    log::info!("disconnected");
    if let Some(handle) = operator {
        handle.stop().await;
        log::info!("operator server shut down");
    }
}
