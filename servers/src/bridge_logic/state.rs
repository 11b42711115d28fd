//! Mutable state of one subarray session, shared between the startup
//! sequence and the update event loop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::bridge_logic::fact::FactCell;
use crate::bridge_logic::substitutions::SessionNames;
use crate::bridge_logic::tracker::SubscriptionTracker;

/// Bootstrap facts resolved by the first matching nominal update.
#[derive(Default)]
pub struct BootstrapFacts {
    /// Resources assigned to the subarray (receptors and proxies).
    pub pool_resources: FactCell<Vec<String>>,
    /// Correlator input labels, positionally numbered.
    pub input_labels: FactCell<Vec<String>>,
    /// Observing band identifier.
    pub band: FactCell<String>,
}

#[derive(Debug, Default)]
struct SessionInner {
    namespace: Option<String>,
    names: Option<SessionNames>,
    receptors: Vec<String>,
    instruments: BTreeSet<String>,
    streams_with_type: BTreeMap<String, String>,
}

/// Cloneable handle to the session state. Locks are held only for brief
/// synchronous sections, never across an await.
#[derive(Clone, Default)]
pub struct SessionState {
    inner: Arc<Mutex<SessionInner>>,
    pub facts: Arc<BootstrapFacts>,
    pub tracker: Arc<Mutex<SubscriptionTracker>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the configured list of streams to populate the instruments and
    /// the stream-type table. A malformed entry is logged and skipped; the
    /// rest of the list still applies.
    pub fn parse_streams(&self, streams: &str) {
        let mut inner = self.lock();
        for stream in streams.split(',') {
            match parse_stream_entry(stream) {
                Some((instrument, uname, stream_type)) => {
                    inner.instruments.insert(instrument);
                    inner.streams_with_type.insert(uname, stream_type);
                }
                None => {
                    log::error!(
                        "Unable to add stream {} to list of subscriptions because it has \
                         an invalid format. Expecting <full_stream_name>:<stream_type>[:<instrument>].",
                        stream
                    );
                }
            }
        }
    }

    pub fn set_namespace(&self, namespace: &str) {
        self.lock().namespace = Some(namespace.to_string());
    }

    pub fn namespace(&self) -> Option<String> {
        self.lock().namespace.clone()
    }

    pub fn set_names(&self, names: SessionNames) {
        self.lock().names = Some(names);
    }

    pub fn names(&self) -> Option<SessionNames> {
        self.lock().names.clone()
    }

    pub fn set_receptors(&self, receptors: Vec<String>) {
        self.lock().receptors = receptors;
    }

    pub fn receptors(&self) -> Vec<String> {
        self.lock().receptors.clone()
    }

    pub fn instruments(&self) -> BTreeSet<String> {
        self.lock().instruments.clone()
    }

    pub fn streams_with_type(&self) -> BTreeMap<String, String> {
        self.lock().streams_with_type.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session lock poisoned")
    }
}

/// Split one `full_stream_name:stream_type[:instrument]` entry. The
/// instrument defaults from the dotted prefix of the full stream name; the
/// stream name is exposed on the portal with `.` and `-` as underscores.
fn parse_stream_entry(entry: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = entry.split(':').collect();
    let (full_stream_name, stream_type) = match parts.as_slice() {
        [name, stream_type] | [name, stream_type, _] => (*name, *stream_type),
        _ => return None,
    };
    let instrument = match parts.get(2) {
        Some(instrument) => instrument.to_string(),
        None => full_stream_name.split_once('.')?.0.to_string(),
    };
    let uname = full_stream_name.replace(['.', '-'], "_");
    Some((instrument, uname, stream_type.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_entry_with_dotted_prefix() {
        let (instrument, uname, stream_type) =
            parse_stream_entry("cbf_1.baseline-correlation-products:visibility").unwrap();
        assert_eq!(instrument, "cbf_1");
        assert_eq!(uname, "cbf_1_baseline_correlation_products");
        assert_eq!(stream_type, "visibility");
    }

    #[test]
    fn test_parse_stream_entry_with_explicit_instrument() {
        let (instrument, uname, stream_type) =
            parse_stream_entry("beam_0x:beamformer:i0").unwrap();
        assert_eq!(instrument, "i0");
        assert_eq!(uname, "beam_0x");
        assert_eq!(stream_type, "beamformer");
    }

    #[test]
    fn test_parse_stream_entry_rejects_bad_shapes() {
        // No type
        assert!(parse_stream_entry("just_a_name").is_none());
        // Too many fields
        assert!(parse_stream_entry("a:b:c:d").is_none());
        // No instrument and no dotted prefix to derive one from
        assert!(parse_stream_entry("plain_name:visibility").is_none());
    }

    #[test]
    fn test_parse_streams_skips_malformed_entries() {
        let session = SessionState::new();
        session.parse_streams("bogus,cbf_1.baseline-correlation-products:visibility,also_bogus");
        let streams = session.streams_with_type();
        assert_eq!(streams.len(), 1);
        assert_eq!(
            streams.get("cbf_1_baseline_correlation_products"),
            Some(&"visibility".to_string())
        );
        assert_eq!(session.instruments(), ["cbf_1".to_string()].into());
    }
}
