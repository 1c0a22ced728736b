use serde::{Deserialize, Serialize};

/// Role of a session description in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A full SDP session description, as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickle ICE candidate in the browser's `RTCIceCandidateInit` shape.
///
/// Optional fields serialize as `null` rather than being omitted, matching
/// what `candidate.toJSON()` produces on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// SDP `a=candidate:` attribute line (without the `a=` prefix)
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Signaling messages exchanged with the remote peer, one JSON object each.
///
/// ```text
/// {"type":"offer","offer":{"type":"offer","sdp":"..."}}
/// {"type":"answer","answer":{"type":"answer","sdp":"..."}}
/// {"type":"candidate","candidate":{"candidate":"...","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// SDP offer from the remote peer
    Offer { offer: SessionDescription },
    /// SDP answer produced locally
    Answer { answer: SessionDescription },
    /// Trickle ICE candidate, either direction
    Candidate { candidate: IceCandidate },
}

const KNOWN_TYPES: [&str; 3] = ["offer", "answer", "candidate"];

impl SignalingMessage {
    /// Parse one inbound signaling payload.
    ///
    /// Returns `Ok(None)` for a well-formed object whose `type` is not one we
    /// handle. A missing or empty `type` and a recognised type with a broken
    /// body are reported as errors so the caller can log them; neither is
    /// ever fatal.
    pub fn parse(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

        let kind = match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) if !kind.is_empty() => kind,
            _ => return Err(ProtocolError::MissingType),
        };

        let Some(kind) = KNOWN_TYPES.iter().copied().find(|k| *k == kind) else {
            return Ok(None);
        };

        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| ProtocolError::Malformed { kind, source })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of this message's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("signaling payload is not a JSON object: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("signaling message is missing its type")]
    MissingType,
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_wire_format() {
        let msg = SignalingMessage::Offer {
            offer: SessionDescription::offer("v=0\r\n..."),
        };
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"offer","offer":{"type":"offer","sdp":"v=0\r\n..."}}"#
        );
    }

    #[test]
    fn answer_wire_format() {
        let msg = SignalingMessage::Answer {
            answer: SessionDescription::answer("v=0\r\nanswer"),
        };
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"answer","answer":{"type":"answer","sdp":"v=0\r\nanswer"}}"#
        );
    }

    #[test]
    fn candidate_serializes_nulls_and_camel_case() {
        let msg = SignalingMessage::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 UDP 2130706431 10.0.0.2 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"candidate""#));
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(json.contains(r#""usernameFragment":null"#));
        assert!(!json.contains("sdp_mid"));
    }

    #[test]
    fn parse_offer() {
        let text = r#"{"type":"offer","offer":{"type":"offer","sdp":"v=0..."}}"#;
        let parsed = SignalingMessage::parse(text).unwrap();
        assert_eq!(
            parsed,
            Some(SignalingMessage::Offer {
                offer: SessionDescription::offer("v=0...")
            })
        );
    }

    #[test]
    fn parse_candidate_from_browser_format() {
        // candidate.toJSON() from Chrome, with all optional fields present
        let text = r#"{
            "type": "candidate",
            "candidate": {
                "candidate": "candidate:842163049 1 udp 1677729535 203.0.113.7 61665 typ srflx raddr 0.0.0.0 rport 0 generation 0",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "Zc3b"
            }
        }"#;
        match SignalingMessage::parse(text).unwrap() {
            Some(SignalingMessage::Candidate { candidate }) => {
                assert!(candidate.candidate.starts_with("candidate:"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.username_fragment.as_deref(), Some("Zc3b"));
            }
            other => panic!("Expected Candidate, got {other:?}"),
        }
    }

    #[test]
    fn parse_candidate_with_missing_optional_fields() {
        let text = r#"{"type":"candidate","candidate":{"candidate":"candidate:1 1 udp 1 1.2.3.4 9 typ host"}}"#;
        match SignalingMessage::parse(text).unwrap() {
            Some(SignalingMessage::Candidate { candidate }) => {
                assert_eq!(candidate.sdp_mid, None);
                assert_eq!(candidate.sdp_mline_index, None);
                assert_eq!(candidate.username_fragment, None);
            }
            other => panic!("Expected Candidate, got {other:?}"),
        }
    }

    #[test]
    fn parse_candidate_with_explicit_nulls() {
        let text = r#"{"type":"candidate","candidate":{"candidate":"c","sdpMid":null,"sdpMLineIndex":null,"usernameFragment":null}}"#;
        assert!(matches!(
            SignalingMessage::parse(text),
            Ok(Some(SignalingMessage::Candidate { .. }))
        ));
    }

    #[test]
    fn empty_type_is_missing_type() {
        let err = SignalingMessage::parse(r#"{"type":""}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn no_type_field_is_missing_type() {
        let err = SignalingMessage::parse(r#"{"foo":"bar"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn non_string_type_is_missing_type() {
        let err = SignalingMessage::parse(r#"{"type":42}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn unknown_type_is_ignored() {
        assert_eq!(SignalingMessage::parse(r#"{"type":"bye"}"#).unwrap(), None);
    }

    #[test]
    fn known_type_with_broken_body_is_malformed() {
        let err = SignalingMessage::parse(r#"{"type":"offer","offer":"nope"}"#).unwrap_err();
        match err {
            ProtocolError::Malformed { kind, .. } => assert_eq!(kind, "offer"),
            other => panic!("Expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn not_json_is_invalid() {
        let err = SignalingMessage::parse("hello").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn kind_matches_wire_tag() {
        let msg = SignalingMessage::Answer {
            answer: SessionDescription::answer("x"),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(&format!(r#""type":"{}""#, msg.kind())));
    }
}
