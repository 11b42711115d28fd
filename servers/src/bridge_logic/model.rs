use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One sensor value update as delivered by the portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub name: String,
    pub timestamp: f64,
    pub status: String,
    pub value: Value,
}

/// An RPC request sent to the portal over the WebSocket connection.
#[derive(Debug, Serialize)]
pub struct PortalRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// An RPC response to a previously issued request.
#[derive(Debug, Deserialize)]
pub struct PortalResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateEnvelope {
    #[serde(default)]
    msg_data: Option<SensorUpdate>,
}

/// A frame received from the portal: either an RPC response or one-or-many
/// sensor updates. Update frames wrap each update in a `msg_data` field; an
/// envelope with a null `msg_data` carries nothing and is skipped.
#[derive(Debug)]
pub enum InboundFrame {
    Response(PortalResponse),
    Updates(Vec<SensorUpdate>),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<InboundFrame, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(items) => {
                let mut updates = Vec::with_capacity(items.len());
                for item in items {
                    let envelope: UpdateEnvelope = serde_json::from_value(item)?;
                    if let Some(update) = envelope.msg_data {
                        updates.push(update);
                    }
                }
                Ok(InboundFrame::Updates(updates))
            }
            other => {
                if other.get("id").is_some() {
                    Ok(InboundFrame::Response(serde_json::from_value(other)?))
                } else {
                    let envelope: UpdateEnvelope = serde_json::from_value(other)?;
                    Ok(InboundFrame::Updates(envelope.msg_data.into_iter().collect()))
                }
            }
        }
    }
}

/// Result of a `set_sampling_strategy` call for one sensor.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyResult {
    pub success: bool,
    #[serde(default)]
    pub info: String,
}

/// The portal sitemap returned on request after connecting.
#[derive(Debug, Clone, Deserialize)]
pub struct Sitemap {
    #[serde(default)]
    pub sub_nr: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_update() {
        let text = r#"{"msg_data": {"name": "m001_target", "timestamp": 1234.5,
                        "status": "nominal", "value": "azel, 10, 20"}}"#;
        match InboundFrame::parse(text).unwrap() {
            InboundFrame::Updates(updates) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].name, "m001_target");
                assert_eq!(updates[0].status, "nominal");
            }
            other => panic!("expected updates, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_list() {
        let text = r#"[{"msg_data": {"name": "a", "timestamp": 1.0, "status": "nominal", "value": 1}},
                       {"msg_data": null},
                       {"msg_data": {"name": "b", "timestamp": 2.0, "status": "warn", "value": 2}}]"#;
        match InboundFrame::parse(text).unwrap() {
            InboundFrame::Updates(updates) => {
                let names: Vec<_> = updates.iter().map(|u| u.name.as_str()).collect();
                assert_eq!(names, vec!["a", "b"]);
            }
            other => panic!("expected updates, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_response() {
        let text = r#"{"id": 7, "result": {"sub_nr": 3}}"#;
        match InboundFrame::parse(text).unwrap() {
            InboundFrame::Response(resp) => {
                assert_eq!(resp.id, 7);
                let sitemap: Sitemap = serde_json::from_value(resp.result.unwrap()).unwrap();
                assert_eq!(sitemap.sub_nr, Some(3));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_null_msg_data_is_empty() {
        match InboundFrame::parse(r#"{"msg_data": null}"#).unwrap() {
            InboundFrame::Updates(updates) => assert!(updates.is_empty()),
            other => panic!("expected updates, got {:?}", other),
        }
    }
}
