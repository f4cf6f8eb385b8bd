//! Duplex event protocol between the client and the room service.
//!
//! Every frame on the wire is one JSON object carrying the event name and
//! its payload:
//!
//! ```text
//! {"event": "agent_response", "data": {"agent": "Analyst", "text": "...", ...}}
//! ```
//!
//! The event set is closed; unknown frames are a codec error surfaced as a
//! recoverable protocol notice rather than a crash. Audio payloads travel
//! base64-encoded inside JSON text frames.

use serde::{Deserialize, Serialize};

use crate::rooms::Room;

// ── Client → service events ───────────────────────────────────────

/// Events emitted by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Request to begin a session for the given room config.
    #[serde(rename = "start_session")]
    StartSession { room: Room },

    /// Submit one captured utterance, base64-encoded.
    #[serde(rename = "process_audio")]
    ProcessAudio { audio: String },

    /// Best-effort notice of client-initiated termination.
    #[serde(rename = "end_session")]
    EndSession,
}

impl ClientEvent {
    /// Encode for the wire.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Service → client events ───────────────────────────────────────

/// Agent roster entry resolved by the service on session start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub name: String,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Events received from the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Handshake acknowledgement. `duration` is in minutes; the roster
    /// carries resolved voices.
    #[serde(rename = "session_started")]
    SessionStarted {
        room: String,
        duration: u64,
        #[serde(default)]
        agents: Vec<RosterEntry>,
        greeting: String,
    },

    /// The service's transcript of the submitted utterance.
    #[serde(rename = "transcription")]
    Transcription { text: String },

    /// Coarse progress indicator for the whole turn.
    #[serde(rename = "status")]
    Status {
        message: String,
        #[serde(rename = "type", default)]
        kind: String,
    },

    /// Per-agent progress update. Informational only.
    #[serde(rename = "agent_status")]
    AgentStatus {
        agent: String,
        status: String,
        #[serde(default)]
        message: String,
    },

    /// One agent turn. `remaining_time` is the authoritative session
    /// countdown in seconds and supersedes local extrapolation.
    #[serde(rename = "agent_response")]
    AgentResponse {
        agent: String,
        text: String,
        #[serde(default)]
        audio: Option<String>,
        #[serde(default)]
        voice: Option<String>,
        remaining_time: u64,
        #[serde(default)]
        agent_index: u32,
        #[serde(default)]
        total_agents: u32,
    },

    /// All agents for this turn have responded.
    #[serde(rename = "processing_complete")]
    ProcessingComplete {
        #[serde(default)]
        total_agents: u32,
        remaining_time: u64,
    },

    /// Server-side time budget exhausted.
    #[serde(rename = "session_expired")]
    SessionExpired {
        #[serde(default)]
        message: String,
    },

    /// Server-initiated termination.
    #[serde(rename = "session_ended")]
    SessionEnded {
        #[serde(default)]
        message: String,
    },

    /// Failure notice. Recoverable errors are transient; others end the
    /// session.
    #[serde(rename = "error")]
    Error { message: String, recoverable: bool },
}

impl ServerEvent {
    /// Decode a wire frame.
    pub fn from_frame(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::AgentDescriptor;

    fn strategy_room() -> Room {
        Room {
            name: "Strategy".into(),
            description: None,
            agents: vec![AgentDescriptor {
                name: "Analyst".into(),
                system_prompt: Some("You analyze.".into()),
                voice: Some("aura-asteria-en".into()),
            }],
            session_duration_minutes: 5,
            greeting: "Hi".into(),
        }
    }

    #[test]
    fn start_session_frame_shape() {
        let frame = ClientEvent::StartSession {
            room: strategy_room(),
        }
        .to_frame()
        .unwrap();
        assert!(frame.contains(r#""event":"start_session""#));
        assert!(frame.contains(r#""name":"Strategy""#));
        assert!(frame.contains(r#""session_duration_minutes":5"#));
    }

    #[test]
    fn process_audio_frame_shape() {
        let frame = ClientEvent::ProcessAudio {
            audio: "AAAA".into(),
        }
        .to_frame()
        .unwrap();
        assert!(frame.contains(r#""event":"process_audio""#));
        assert!(frame.contains(r#""audio":"AAAA""#));
    }

    #[test]
    fn end_session_is_bare_event() {
        let frame = ClientEvent::EndSession.to_frame().unwrap();
        assert_eq!(frame, r#"{"event":"end_session"}"#);
    }

    #[test]
    fn parse_session_started() {
        let frame = r#"{"event":"session_started","data":{
            "room":"Strategy","duration":5,"greeting":"Hi",
            "agents":[{"name":"Analyst","voice":"aura-asteria-en"}]}}"#;
        match ServerEvent::from_frame(frame).unwrap() {
            ServerEvent::SessionStarted {
                room,
                duration,
                agents,
                greeting,
            } => {
                assert_eq!(room, "Strategy");
                assert_eq!(duration, 5);
                assert_eq!(greeting, "Hi");
                assert_eq!(agents[0].name, "Analyst");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_agent_response_with_audio() {
        let frame = r#"{"event":"agent_response","data":{
            "agent":"Analyst","text":"Consider the risks.","audio":"UklGRg==",
            "voice":"aura-asteria-en","remaining_time":271,
            "agent_index":0,"total_agents":3}}"#;
        match ServerEvent::from_frame(frame).unwrap() {
            ServerEvent::AgentResponse {
                agent,
                audio,
                remaining_time,
                total_agents,
                ..
            } => {
                assert_eq!(agent, "Analyst");
                assert_eq!(audio.as_deref(), Some("UklGRg=="));
                assert_eq!(remaining_time, 271);
                assert_eq!(total_agents, 3);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_agent_response_without_audio() {
        let frame = r#"{"event":"agent_response","data":{
            "agent":"Skeptic","text":"Doubtful.","remaining_time":200}}"#;
        match ServerEvent::from_frame(frame).unwrap() {
            ServerEvent::AgentResponse { audio, .. } => assert!(audio.is_none()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn status_kind_uses_wire_name_type() {
        let frame = r#"{"event":"status","data":{"message":"Listening...","type":"transcribing"}}"#;
        match ServerEvent::from_frame(frame).unwrap() {
            ServerEvent::Status { message, kind } => {
                assert_eq!(message, "Listening...");
                assert_eq!(kind, "transcribing");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_error_event() {
        let frame = r#"{"event":"error","data":{"message":"No active session","recoverable":false}}"#;
        match ServerEvent::from_frame(frame).unwrap() {
            ServerEvent::Error {
                message,
                recoverable,
            } => {
                assert_eq!(message, "No active session");
                assert!(!recoverable);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_codec_error() {
        assert!(ServerEvent::from_frame(r#"{"event":"telemetry","data":{}}"#).is_err());
        assert!(ServerEvent::from_frame("not json").is_err());
    }

    #[test]
    fn server_events_roundtrip() {
        let events = vec![
            ServerEvent::Transcription {
                text: "hello".into(),
            },
            ServerEvent::ProcessingComplete {
                total_agents: 3,
                remaining_time: 120,
            },
            ServerEvent::SessionEnded {
                message: "Session saved".into(),
            },
        ];
        for ev in events {
            let frame = serde_json::to_string(&ev).unwrap();
            let back = ServerEvent::from_frame(&frame).unwrap();
            assert_eq!(
                serde_json::to_value(&back).unwrap(),
                serde_json::to_value(&ev).unwrap()
            );
        }
    }
}
