//! Substitution table feeding sensor-template expansion.
//!
//! Built once per subarray session from the discovered bootstrap facts.
//! Instruments and streams are iterated in sorted order so the table, and
//! therefore the expanded sensor set, is reproducible across runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Stream types whose local names collapse to a shared prefix under
/// `--collapse-streams`.
pub const COLLAPSE_TYPES: [&str; 2] = ["visibility", "fengine"];

/// Maps a placeholder key to an ordered sequence of (remote, local) value
/// pairs. Unknown keys read as an empty sequence.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    entries: HashMap<String, Vec<(String, String)>>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &str, remote: impl Into<String>, local: impl Into<String>) {
        self.entries
            .entry(key.to_string())
            .or_default()
            .push((remote.into(), local.into()));
    }

    pub fn get(&self, key: &str) -> &[(String, String)] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Control-system names of the subarray and its proxies, resolved after
/// connecting.
#[derive(Debug, Clone)]
pub struct SessionNames {
    pub sub: String,
    pub cbf: String,
    pub sdp: String,
}

/// Build the substitution table for one subarray session.
pub fn build_substitutions(
    names: &SessionNames,
    receptors: &[String],
    band: &str,
    input_labels: &[String],
    instruments: &BTreeSet<String>,
    streams_with_type: &BTreeMap<String, String>,
    collapse_streams: bool,
) -> Substitutions {
    let mut subs = Substitutions::new();

    for receptor in receptors {
        subs.push("receptor", receptor.clone(), receptor.clone());
    }
    let rx_name = format!("rsc_rx{}", band);
    subs.push("receiver", rx_name.clone(), rx_name);
    let dig_name = format!("dig_{}_band", band);
    subs.push("digitiser", dig_name.clone(), dig_name);
    subs.push("subarray", names.sub.clone(), "sub");
    subs.push("cbf", names.cbf.clone(), "data");
    subs.push("sdp", names.sdp.clone(), "data");

    for (number, label) in input_labels.iter().enumerate() {
        subs.push("inputn", format!("input{}", number), label.clone());
    }

    let cbf_prefix = names.cbf.clone();
    for instrument in instruments {
        let remote_instrument = format!("{}_{}", cbf_prefix, instrument);
        let local_instrument = if collapse_streams {
            "cbf".to_string()
        } else {
            format!("cbf_{}", instrument)
        };
        subs.push("instrument", remote_instrument, local_instrument);
    }

    for (full_stream_name, stream_type) in streams_with_type {
        let remote_stream = format!("{}_{}", cbf_prefix, full_stream_name);
        let remote_sub_stream = format!("{}_streams_{}", names.sub, full_stream_name);
        let local_stream = if collapse_streams && COLLAPSE_TYPES.contains(&stream_type.as_str()) {
            "cbf".to_string()
        } else {
            format!("cbf_{}", full_stream_name)
        };
        subs.push("stream", remote_stream.clone(), local_stream.clone());
        subs.push(
            format!("stream_{}", stream_type).as_str(),
            remote_stream,
            local_stream.clone(),
        );
        subs.push("sub_stream", remote_sub_stream.clone(), local_stream.clone());
        subs.push(
            format!("sub_stream_{}", stream_type).as_str(),
            remote_sub_stream,
            local_stream,
        );
    }

    subs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_names() -> SessionNames {
        SessionNames {
            sub: "subarray_2".to_string(),
            cbf: "cbf_2".to_string(),
            sdp: "sdp_2".to_string(),
        }
    }

    fn sample_table(collapse: bool) -> Substitutions {
        let receptors = vec!["m001".to_string(), "m062".to_string()];
        let labels = vec!["m001h".to_string(), "m001v".to_string()];
        let instruments: BTreeSet<String> = ["i0".to_string()].into();
        let streams: BTreeMap<String, String> = [
            ("i0_baseline_correlation_products".to_string(), "visibility".to_string()),
            ("i0_antenna_channelised_voltage".to_string(), "fengine".to_string()),
            ("i0_tied_array_channelised_voltage_0x".to_string(), "beamformer".to_string()),
        ]
        .into();
        build_substitutions(&sample_names(), &receptors, "l", &labels, &instruments, &streams, collapse)
    }

    #[test]
    fn test_missing_key_reads_empty() {
        let subs = Substitutions::new();
        assert!(subs.get("no_such_key").is_empty());
    }

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(remote, local)| (remote.to_string(), local.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_entries() {
        let subs = sample_table(false);
        assert_eq!(subs.get("receptor"), pairs(&[("m001", "m001"), ("m062", "m062")]));
        assert_eq!(subs.get("receiver"), pairs(&[("rsc_rxl", "rsc_rxl")]));
        assert_eq!(subs.get("digitiser"), pairs(&[("dig_l_band", "dig_l_band")]));
        assert_eq!(subs.get("subarray"), pairs(&[("subarray_2", "sub")]));
        assert_eq!(subs.get("cbf"), pairs(&[("cbf_2", "data")]));
        assert_eq!(subs.get("sdp"), pairs(&[("sdp_2", "data")]));
    }

    #[test]
    fn test_input_labels_are_positional() {
        let subs = sample_table(false);
        assert_eq!(
            subs.get("inputn"),
            pairs(&[("input0", "m001h"), ("input1", "m001v")])
        );
    }

    #[test]
    fn test_instrument_entries() {
        let subs = sample_table(false);
        assert_eq!(subs.get("instrument"), pairs(&[("cbf_2_i0", "cbf_i0")]));
        let collapsed = sample_table(true);
        assert_eq!(collapsed.get("instrument"), pairs(&[("cbf_2_i0", "cbf")]));
    }

    #[test]
    fn test_stream_entries_cover_four_keys() {
        let subs = sample_table(false);
        assert_eq!(
            subs.get("stream_visibility"),
            pairs(&[(
                "cbf_2_i0_baseline_correlation_products",
                "cbf_i0_baseline_correlation_products"
            )])
        );
        assert_eq!(
            subs.get("sub_stream_visibility"),
            pairs(&[(
                "subarray_2_streams_i0_baseline_correlation_products",
                "cbf_i0_baseline_correlation_products"
            )])
        );
        // The generic keys accumulate every stream
        assert_eq!(subs.get("stream").len(), 3);
        assert_eq!(subs.get("sub_stream").len(), 3);
    }

    #[test]
    fn test_collapse_applies_only_to_collapse_types() {
        let subs = sample_table(true);
        assert_eq!(subs.get("stream_visibility")[0].1, "cbf");
        assert_eq!(subs.get("stream_fengine")[0].1, "cbf");
        assert_eq!(
            subs.get("stream_beamformer")[0].1,
            "cbf_i0_tied_array_channelised_voltage_0x"
        );
    }

    #[test]
    fn test_streams_iterate_in_sorted_order() {
        let subs = sample_table(false);
        let remotes: Vec<_> = subs.get("stream").iter().map(|pair| pair.0.as_str()).collect();
        let mut sorted = remotes.clone();
        sorted.sort();
        assert_eq!(remotes, sorted);
    }
}
