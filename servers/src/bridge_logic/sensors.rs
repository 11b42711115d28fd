//! Sensor templates and their expansion into concrete sensor descriptors.
//!
//! A template names a family of portal sensors with `{key}` placeholders in
//! its remote pattern. Expansion substitutes every combination of the values
//! registered for those keys, producing one descriptor per combination.

use serde_json::Value;
use thiserror::Error;

use crate::bridge_logic::substitutions::Substitutions;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("local pattern '{pattern}' uses key '{key}' missing from the remote pattern")]
    UnknownLocalKey { pattern: String, key: String },
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("value is not a string")]
    NotAString,
    #[error("invalid literal: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Conversion applied to a raw sensor value before it is written to the
/// telescope state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convert {
    /// Comma-separated string to an array of strings.
    CommaSplit,
    /// String containing JSON to the decoded value.
    JsonDecode,
    /// String containing a Python-style literal list (single quotes, optional
    /// tuple parentheses) to a JSON array.
    ListLiteral,
    /// String of 1s and 0s to an array of booleans. Anything else becomes
    /// null rather than an error.
    Bitmask,
}

impl Convert {
    pub fn apply(&self, value: &Value) -> Result<Value, ConvertError> {
        let text = value.as_str().ok_or(ConvertError::NotAString)?;
        match self {
            Convert::CommaSplit => Ok(Value::Array(
                text.split(',').map(|part| Value::String(part.to_string())).collect(),
            )),
            Convert::JsonDecode => Ok(serde_json::from_str(text)?),
            Convert::ListLiteral => {
                let normalised: String = text
                    .chars()
                    .map(|c| match c {
                        '\'' => '"',
                        '(' => '[',
                        ')' => ']',
                        other => other,
                    })
                    .collect();
                Ok(serde_json::from_str(&normalised)?)
            }
            Convert::Bitmask => {
                if !text.is_empty() && text.bytes().all(|b| b == b'0' || b == b'1') {
                    Ok(Value::Array(text.bytes().map(|b| Value::Bool(b == b'1')).collect()))
                } else {
                    Ok(Value::Null)
                }
            }
        }
    }
}

/// A concrete sensor produced by template expansion.
#[derive(Debug, Clone)]
pub struct SensorDescriptor {
    /// Name of the sensor on the portal.
    pub remote_name: String,
    /// Name of the key in the telescope state.
    pub local_name: String,
    /// Sampling strategy to request from the portal.
    pub sampling: String,
    pub immutable: bool,
    pub convert: Option<Convert>,
    /// Still waiting for an initial value.
    pub waiting: bool,
}

/// A template for a family of sensors. Patterns may contain `{key}`
/// placeholders; the local pattern may only use keys the remote pattern uses.
#[derive(Debug, Clone)]
pub struct SensorTemplate {
    remote_pattern: String,
    local_pattern: String,
    sampling: String,
    immutable: bool,
    convert: Option<Convert>,
}

impl SensorTemplate {
    pub fn new(remote_pattern: &str) -> Self {
        Self {
            remote_pattern: remote_pattern.to_string(),
            local_pattern: remote_pattern.to_string(),
            sampling: "event".to_string(),
            immutable: false,
            convert: None,
        }
    }

    pub fn local_name(mut self, pattern: &str) -> Self {
        self.local_pattern = pattern.to_string();
        self
    }

    pub fn sampling(mut self, strategy: &str) -> Self {
        self.sampling = strategy.to_string();
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn convert(mut self, convert: Convert) -> Self {
        self.convert = Some(convert);
        self
    }

    pub fn remote_pattern(&self) -> &str {
        &self.remote_pattern
    }

    /// Expand the template against a substitution table, producing one
    /// descriptor per combination in the Cartesian product of the referenced
    /// keys' value sequences. A key with no registered values makes the whole
    /// expansion empty.
    pub fn expand(&self, substitutions: &Substitutions) -> Result<Vec<SensorDescriptor>, TemplateError> {
        let keys = placeholder_keys(&self.remote_pattern);
        for key in placeholder_keys(&self.local_pattern) {
            if !keys.contains(&key) {
                return Err(TemplateError::UnknownLocalKey {
                    pattern: self.local_pattern.clone(),
                    key,
                });
            }
        }

        let sequences: Vec<&[(String, String)]> =
            keys.iter().map(|key| substitutions.get(key)).collect();
        if sequences.iter().any(|seq| seq.is_empty()) && !keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut descriptors = Vec::new();
        let mut indices = vec![0usize; keys.len()];
        loop {
            let remote = fill_pattern(&self.remote_pattern, &keys, &sequences, &indices, |pair| &pair.0);
            let local = fill_pattern(&self.local_pattern, &keys, &sequences, &indices, |pair| &pair.1);
            descriptors.push(SensorDescriptor {
                remote_name: normalise_name(&remote),
                local_name: normalise_name(&local),
                sampling: self.sampling.clone(),
                immutable: self.immutable,
                convert: self.convert,
                waiting: true,
            });

            // Advance the odometer over the per-key sequences
            let mut position = keys.len();
            loop {
                if position == 0 {
                    return Ok(descriptors);
                }
                position -= 1;
                indices[position] += 1;
                if indices[position] < sequences[position].len() {
                    break;
                }
                indices[position] = 0;
            }
        }
    }
}

/// Distinct `{key}` placeholders in a pattern, in order of first appearance.
fn placeholder_keys(pattern: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find('}') else { break };
        let key = &rest[..close];
        if !key.is_empty() && !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
        rest = &rest[close + 1..];
    }
    keys
}

/// Substitute one combination of values into a pattern. `side` selects the
/// remote or local half of each pair.
fn fill_pattern(
    pattern: &str,
    keys: &[String],
    sequences: &[&[(String, String)]],
    indices: &[usize],
    side: impl Fn(&(String, String)) -> &String,
) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open + 1..];
        let Some(close) = rest.find('}') else {
            out.push('{');
            break;
        };
        let key = &rest[..close];
        // Keys were extracted from this pattern (or validated against it), so
        // the lookup cannot miss.
        if let Some(position) = keys.iter().position(|k| k == key) {
            out.push_str(side(&sequences[position][indices[position]]));
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Eliminate doubled, leading and trailing underscores.
pub fn normalise_name(name: &str) -> String {
    name.split('_').filter(|part| !part.is_empty()).collect::<Vec<_>>().join("_")
}

/// The fixed catalog of sensor templates collected from the portal.
pub fn sensor_templates() -> Vec<SensorTemplate> {
    vec![
        // Receptor sensors
        SensorTemplate::new("{receptor}_observer"),
        SensorTemplate::new("{receptor}_activity"),
        SensorTemplate::new("{receptor}_target"),
        SensorTemplate::new("{receptor}_pos_request_scan_azim").sampling("period 0.4"),
        SensorTemplate::new("{receptor}_pos_request_scan_elev").sampling("period 0.4"),
        SensorTemplate::new("{receptor}_pos_actual_scan_azim").sampling("period 0.4"),
        SensorTemplate::new("{receptor}_pos_actual_scan_elev").sampling("period 0.4"),
        SensorTemplate::new("{receptor}_pos_adjust_pointm_azim"),
        SensorTemplate::new("{receptor}_pos_adjust_pointm_elev"),
        // TODO: drop the old-style name once all digitisers expose the
        // band-qualified noise diode sensor
        SensorTemplate::new("{receptor}_dig_noise_diode"),
        SensorTemplate::new("{receptor}_{digitiser}_noise_diode"),
        SensorTemplate::new("{receptor}_ap_indexer_position"),
        SensorTemplate::new("{receptor}_ap_point_error_tiltmeter_enabled"),
        SensorTemplate::new("{receptor}_ap_tilt_corr_azim"),
        SensorTemplate::new("{receptor}_ap_tilt_corr_elev"),
        SensorTemplate::new("{receptor}_{receiver}_serial_number"),
        SensorTemplate::new("{receptor}_data_suspect"),
        SensorTemplate::new("{receptor}_ap_version_list").immutable(),
        // Correlator proxy sensors
        SensorTemplate::new("{cbf}_target"),
        SensorTemplate::new("{cbf}_auto_delay_enabled"),
        SensorTemplate::new("{cbf}_input_labels").immutable().convert(Convert::CommaSplit),
        SensorTemplate::new("{cbf}_loaded_delay_correction"),
        SensorTemplate::new("{cbf}_delay_centre_frequency"),
        SensorTemplate::new("{cbf}_delay_adjustments").convert(Convert::JsonDecode),
        SensorTemplate::new("{cbf}_pos_request_offset_azim").sampling("period 0.4"),
        SensorTemplate::new("{cbf}_pos_request_offset_elev").sampling("period 0.4"),
        SensorTemplate::new("{cbf}_cmc_version_list").immutable(),
        // Science-processing proxy sensors
        SensorTemplate::new("{sdp}_spmc_version_list").immutable(),
        // Instrument-specific correlator sensors
        SensorTemplate::new("{instrument}_adc_sample_rate").immutable(),
        SensorTemplate::new("{instrument}_bandwidth").immutable(),
        SensorTemplate::new("{instrument}_n_inputs").immutable(),
        SensorTemplate::new("{instrument}_scale_factor_timestamp").immutable(),
        SensorTemplate::new("{instrument}_sync_time").immutable(),
        // Stream-specific correlator sensors
        SensorTemplate::new("{stream_visibility}_bls_ordering").immutable().convert(Convert::ListLiteral),
        SensorTemplate::new("{stream_visibility}_int_time").immutable(),
        SensorTemplate::new("{stream_visibility}_n_accs").immutable(),
        SensorTemplate::new("{stream_visibility}_n_chans_per_substream").immutable(),
        // Beamformer metadata are not immutable, because controlled by passband
        SensorTemplate::new("{stream_beamformer}_n_chans"),
        SensorTemplate::new("{stream_beamformer}_{inputn}_weight"),
        SensorTemplate::new("{stream_beamformer}_n_chans_per_substream").immutable(),
        SensorTemplate::new("{stream_beamformer}_spectra_per_heap").immutable(),
        SensorTemplate::new("{stream_fengine}_n_samples_between_spectra")
            .local_name("{stream_fengine}_ticks_between_spectra")
            .immutable(),
        SensorTemplate::new("{stream_fengine}_n_chans").immutable(),
        SensorTemplate::new("{sub_stream_fengine}_centre_frequency")
            .local_name("{sub_stream_fengine}_center_freq")
            .immutable(),
        SensorTemplate::new("{stream_fengine}_{inputn}_fft0_shift")
            .local_name("{stream_fengine}_fft_shift"),
        SensorTemplate::new("{stream_fengine}_{inputn}_delay").convert(Convert::ListLiteral),
        SensorTemplate::new("{stream_fengine}_{inputn}_delay_ok"),
        SensorTemplate::new("{stream_fengine}_{inputn}_eq").convert(Convert::ListLiteral),
        // Subarray sensors
        SensorTemplate::new("{subarray}_config_label").immutable(),
        SensorTemplate::new("{subarray}_band").immutable(),
        SensorTemplate::new("{subarray}_product").immutable(),
        SensorTemplate::new("{subarray}_sub_nr").immutable(),
        SensorTemplate::new("{subarray}_dump_rate").immutable(),
        SensorTemplate::new("{subarray}_pool_resources").immutable(),
        SensorTemplate::new("{sub_stream_fengine}_channel_mask").convert(Convert::Bitmask),
        SensorTemplate::new("{subarray}_state"),
        // Site-wide sensors
        SensorTemplate::new("anc_air_pressure"),
        SensorTemplate::new("anc_air_relative_humidity"),
        SensorTemplate::new("anc_air_temperature"),
        SensorTemplate::new("anc_wind_direction"),
        SensorTemplate::new("anc_mean_wind_speed"),
        SensorTemplate::new("anc_siggen_ku_frequency"),
        SensorTemplate::new("mcp_dmc_version_list").immutable(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn receptor_subs() -> Substitutions {
        let mut subs = Substitutions::new();
        subs.push("receptor", "m001", "m001");
        subs.push("receptor", "m002", "m002");
        subs
    }

    #[test]
    fn test_expand_single_key() {
        let template = SensorTemplate::new("{receptor}_target");
        let sensors = template.expand(&receptor_subs()).unwrap();
        let remote: Vec<_> = sensors.iter().map(|s| s.remote_name.as_str()).collect();
        assert_eq!(remote, vec!["m001_target", "m002_target"]);
    }

    #[test]
    fn test_expand_cartesian_product_count() {
        let mut subs = receptor_subs();
        subs.push("band", "l", "l");
        subs.push("band", "u", "u");
        subs.push("band", "s", "s");
        let template = SensorTemplate::new("{receptor}_{band}_gain");
        let sensors = template.expand(&subs).unwrap();
        assert_eq!(sensors.len(), 2 * 3);
    }

    #[test]
    fn test_expand_pairs_remote_and_local_positionally() {
        let mut subs = Substitutions::new();
        subs.push("inputn", "input0", "m001h");
        subs.push("inputn", "input1", "m001v");
        let template = SensorTemplate::new("cbf_{inputn}_eq");
        let sensors = template.expand(&subs).unwrap();
        assert_eq!(sensors[0].remote_name, "cbf_input0_eq");
        assert_eq!(sensors[0].local_name, "cbf_m001h_eq");
        assert_eq!(sensors[1].remote_name, "cbf_input1_eq");
        assert_eq!(sensors[1].local_name, "cbf_m001v_eq");
    }

    #[test]
    fn test_expand_missing_key_gives_empty_result() {
        let template = SensorTemplate::new("{stream_beamformer}_n_chans");
        let sensors = template.expand(&receptor_subs()).unwrap();
        assert!(sensors.is_empty());
    }

    #[test]
    fn test_expand_no_placeholders_gives_one_sensor() {
        let template = SensorTemplate::new("anc_air_pressure").sampling("period 1.0");
        let sensors = template.expand(&Substitutions::new()).unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].remote_name, "anc_air_pressure");
        assert_eq!(sensors[0].sampling, "period 1.0");
        assert!(sensors[0].waiting);
    }

    #[test]
    fn test_expand_rejects_local_only_key() {
        let mut subs = receptor_subs();
        subs.push("band", "l", "l");
        let template = SensorTemplate::new("{receptor}_target").local_name("{band}_target");
        assert!(matches!(
            template.expand(&subs),
            Err(TemplateError::UnknownLocalKey { .. })
        ));
    }

    #[test]
    fn test_expand_carries_template_attributes() {
        let template = SensorTemplate::new("{receptor}_ap_version_list")
            .immutable()
            .convert(Convert::CommaSplit);
        let sensors = template.expand(&receptor_subs()).unwrap();
        assert!(sensors.iter().all(|s| s.immutable));
        assert!(sensors.iter().all(|s| s.convert == Some(Convert::CommaSplit)));
    }

    #[test]
    fn test_normalise_name() {
        assert_eq!(normalise_name("a__b_"), "a_b");
        assert_eq!(normalise_name("_a_b"), "a_b");
        // Idempotent on an already-normal name
        assert_eq!(normalise_name("a_b"), "a_b");
    }

    #[test]
    fn test_expand_normalises_names() {
        let mut subs = Substitutions::new();
        subs.push("prefix", "", "sub");
        let template = SensorTemplate::new("{prefix}_state");
        let sensors = template.expand(&subs).unwrap();
        assert_eq!(sensors[0].remote_name, "state");
        assert_eq!(sensors[0].local_name, "sub_state");
    }

    #[test]
    fn test_placeholder_keys_order_and_dedup() {
        assert_eq!(
            placeholder_keys("{a}_{b}_{a}_x"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(placeholder_keys("no_keys_here").is_empty());
    }

    #[test]
    fn test_convert_comma_split() {
        let out = Convert::CommaSplit.apply(&json!("m001,m002,cbf_1")).unwrap();
        assert_eq!(out, json!(["m001", "m002", "cbf_1"]));
    }

    #[test]
    fn test_convert_json_decode() {
        let out = Convert::JsonDecode.apply(&json!(r#"{"delay": 1.5}"#)).unwrap();
        assert_eq!(out, json!({"delay": 1.5}));
        assert!(Convert::JsonDecode.apply(&json!("not json")).is_err());
        assert!(Convert::JsonDecode.apply(&json!(42)).is_err());
    }

    #[test]
    fn test_convert_list_literal() {
        let out = Convert::ListLiteral
            .apply(&json!("[('m001h', 'm001v'), ('m002h', 'm002v')]"))
            .unwrap();
        assert_eq!(out, json!([["m001h", "m001v"], ["m002h", "m002v"]]));
    }

    #[test]
    fn test_convert_bitmask() {
        assert_eq!(
            Convert::Bitmask.apply(&json!("0110")).unwrap(),
            json!([false, true, true, false])
        );
        // Malformed bitmasks become null, not an error
        assert_eq!(Convert::Bitmask.apply(&json!("01x0")).unwrap(), json!(null));
        assert_eq!(Convert::Bitmask.apply(&json!("")).unwrap(), json!(null));
    }

    #[test]
    fn test_catalog_expands_cleanly_with_full_table() {
        let mut subs = Substitutions::new();
        subs.push("receptor", "m001", "m001");
        subs.push("receiver", "rsc_rxl", "rsc_rxl");
        subs.push("digitiser", "dig_l_band", "dig_l_band");
        subs.push("subarray", "subarray_1", "sub");
        subs.push("cbf", "cbf_1", "data");
        subs.push("sdp", "sdp_1", "data");
        subs.push("inputn", "input0", "m001h");
        subs.push("instrument", "cbf_1_i0", "cbf_i0");
        for key in ["stream", "stream_visibility", "sub_stream", "sub_stream_visibility"] {
            subs.push(key, "cbf_1_i0_baseline_correlation_products", "cbf_i0_baseline_correlation_products");
        }
        for key in ["stream_beamformer", "stream_fengine", "sub_stream_fengine"] {
            subs.push(key, "cbf_1_i0_stream", "cbf_i0_stream");
        }
        for template in sensor_templates() {
            let sensors = template.expand(&subs).unwrap();
            assert!(!sensors.is_empty(), "template {} expanded to nothing", template.remote_pattern());
        }
    }
}
