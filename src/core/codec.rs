//! Payload codec for the provisioning characteristics.
//!
//! Every value crossing the radio capability is base64 text wrapping UTF-8.
//! Requests to set credentials carry the raw text `"<ssid> <password>"`;
//! responses carry JSON: an array of networks, or a `{status, message?}` object.
//!
//! The credential framing joins the two fields with a single space and no
//! escaping. A network name or secret containing spaces cannot be told apart on
//! the wire. Devices in the field parse it this way, so it must stay as is.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::Value;

use crate::core::error::ProvisionError;

/// One entry of the Wi-Fi list reported by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NetworkDescriptor {
    /// The SSID exactly as reported. May contain control characters.
    pub name: String,
    /// Signal strength in dBm, when the peripheral reports it.
    pub rssi: Option<i16>,
}

impl NetworkDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rssi: None,
        }
    }

    /// The name with control characters escaped, safe to print.
    pub fn display_name(&self) -> String {
        self.name
            .chars()
            .flat_map(|c| {
                if c.is_control() {
                    c.escape_default().collect::<Vec<_>>()
                } else {
                    vec![c]
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningRequest {
    ListNetworks,
    SetCredentials { network: String, secret: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningResponse {
    NetworkList(Vec<NetworkDescriptor>),
    Ack,
    Failure { code: i64, message: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireNetwork {
    Name(String),
    Detailed { ssid: String, rssi: Option<i16> },
}

impl From<WireNetwork> for NetworkDescriptor {
    fn from(entry: WireNetwork) -> Self {
        match entry {
            WireNetwork::Name(name) => NetworkDescriptor { name, rssi: None },
            WireNetwork::Detailed { ssid, rssi } => NetworkDescriptor { name: ssid, rssi },
        }
    }
}

/// Encodes a request into the bytes written to the peripheral.
///
/// `ListNetworks` is served by a plain read of the list characteristic and
/// therefore has an empty payload.
pub fn encode(request: &ProvisioningRequest) -> Vec<u8> {
    match request {
        ProvisioningRequest::ListNetworks => Vec::new(),
        ProvisioningRequest::SetCredentials { network, secret } => {
            let text = format!("{} {}", network, secret);
            BASE64.encode(text.as_bytes()).into_bytes()
        }
    }
}

/// Strips the base64 layer and returns the inner text.
pub fn decode_text(bytes: &[u8]) -> Result<String, ProvisionError> {
    let trimmed = bytes.trim_ascii();
    if trimmed.is_empty() {
        return Err(ProvisionError::MalformedResponse("empty payload".into()));
    }
    let raw = BASE64
        .decode(trimmed)
        .map_err(|e| ProvisionError::MalformedResponse(format!("invalid base64: {}", e)))?;
    String::from_utf8(raw)
        .map_err(|e| ProvisionError::MalformedResponse(format!("invalid UTF-8: {}", e)))
}

/// Decodes a response read from the peripheral. Never panics; the same bad
/// input always yields the same `MalformedResponse`.
pub fn decode(bytes: &[u8]) -> Result<ProvisioningResponse, ProvisionError> {
    let text = decode_text(bytes)?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| ProvisionError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    match value {
        Value::Array(entries) => {
            let networks = entries
                .into_iter()
                .map(|entry| {
                    serde_json::from_value::<WireNetwork>(entry)
                        .map(NetworkDescriptor::from)
                        .map_err(|_| {
                            ProvisionError::MalformedResponse(
                                "network list entry is neither a string nor {ssid, rssi}".into(),
                            )
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ProvisioningResponse::NetworkList(networks))
        }
        Value::Object(map) => {
            let code = map.get("status").and_then(Value::as_i64).ok_or_else(|| {
                ProvisionError::MalformedResponse("status object without integer `status`".into())
            })?;
            let message = match map.get("message") {
                None | Some(Value::Null) => None,
                Some(Value::String(message)) => Some(message.clone()),
                Some(_) => {
                    return Err(ProvisionError::MalformedResponse(
                        "`message` is not a string".into(),
                    ));
                }
            };
            match code {
                200..=299 => Ok(ProvisioningResponse::Ack),
                _ => Ok(ProvisioningResponse::Failure {
                    code,
                    message: message.unwrap_or_else(|| format!("device reported status {}", code)),
                }),
            }
        }
        _ => Err(ProvisionError::MalformedResponse(
            "expected a JSON array or object".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(text: &str) -> Vec<u8> {
        BASE64.encode(text).into_bytes()
    }

    fn credentials(network: &str, secret: &str) -> ProvisioningRequest {
        ProvisioningRequest::SetCredentials {
            network: network.into(),
            secret: secret.into(),
        }
    }

    #[test]
    fn credentials_are_space_joined_text() {
        let bytes = encode(&credentials("home", "abc123"));
        assert_eq!(decode_text(&bytes).unwrap(), "home abc123");
    }

    #[test]
    fn spaces_in_credentials_are_ambiguous_on_the_wire() {
        let a = encode(&credentials("my home", "abc123"));
        let b = encode(&credentials("my", "home abc123"));
        assert_eq!(a, b);
    }

    #[test]
    fn list_networks_has_empty_payload() {
        assert!(encode(&ProvisioningRequest::ListNetworks).is_empty());
    }

    #[test]
    fn decodes_network_list() {
        let response = decode(&wire(r#"["HomeNet","Guest"]"#)).unwrap();
        assert_eq!(
            response,
            ProvisioningResponse::NetworkList(vec![
                NetworkDescriptor::new("HomeNet"),
                NetworkDescriptor::new("Guest"),
            ])
        );
    }

    #[test]
    fn decodes_network_entries_with_signal() {
        let response = decode(&wire(r#"[{"ssid":"Lab","rssi":-61},"Guest"]"#)).unwrap();
        let ProvisioningResponse::NetworkList(list) = response else {
            panic!("expected a list");
        };
        assert_eq!(list[0].rssi, Some(-61));
        assert_eq!(list[1].rssi, None);
    }

    #[test]
    fn classifies_status_objects() {
        assert_eq!(
            decode(&wire(r#"{"status":200}"#)).unwrap(),
            ProvisioningResponse::Ack
        );
        assert_eq!(
            decode(&wire(r#"{"status":400,"message":"bad password"}"#)).unwrap(),
            ProvisioningResponse::Failure {
                code: 400,
                message: "bad password".into()
            }
        );
        assert!(matches!(
            decode(&wire(r#"{"status":503}"#)).unwrap(),
            ProvisioningResponse::Failure { code: 503, .. }
        ));
    }

    #[test]
    fn any_status_outside_success_range_is_a_failure() {
        for code in [100, 302, 600, -1] {
            let payload = wire(&format!(r#"{{"status":{}}}"#, code));
            assert_eq!(
                decode(&payload).unwrap(),
                ProvisioningResponse::Failure {
                    code,
                    message: format!("device reported status {}", code),
                }
            );
        }
        assert_eq!(decode(&wire(r#"{"status":299}"#)).unwrap(), ProvisioningResponse::Ack);
    }

    #[test]
    fn rejects_bad_input_deterministically() {
        let inputs: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"   ".to_vec(),
            b"not base64 at all!".to_vec(),
            wire("[\"trunc"),
            wire("42"),
            wire(r#"{"message":"no status"}"#),
            wire(r#"[1,2,3]"#),
            vec![0xff, 0xfe, 0x00],
        ];
        for input in inputs {
            let first = decode(&input);
            assert!(
                matches!(first, Err(ProvisionError::MalformedResponse(_))),
                "input {:?} gave {:?}",
                input,
                first
            );
            assert_eq!(first, decode(&input));
        }
    }

    #[test]
    fn display_name_escapes_control_characters() {
        let network = NetworkDescriptor::new("cafe\n\u{7}");
        assert_eq!(network.display_name(), "cafe\\n\\u{7}");
    }
}
