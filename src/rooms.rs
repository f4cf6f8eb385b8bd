//! Room catalog collaborator.
//!
//! A room is the static configuration of one conversation: its agent
//! roster, time budget, and greeting. The catalog is served over plain
//! HTTP by the room service; this module is a thin client for it plus the
//! room types shared with the wire protocol.

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

// ── Room types ────────────────────────────────────────────────────

/// One named remote responder contributing a turn per utterance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub name: String,
    /// Prompt driving the agent server-side. Absent in catalog listings
    /// that hide prompts from clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Synthesis voice label. The service substitutes a default when
    /// missing or unrecognized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Configuration of one conversation room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered agent roster; response order follows this list.
    pub agents: Vec<AgentDescriptor>,
    pub session_duration_minutes: u64,
    #[serde(default)]
    pub greeting: String,
}

impl Room {
    /// Session time budget in seconds.
    pub fn duration_secs(&self) -> u64 {
        self.session_duration_minutes * 60
    }
}

/// Agent definition accepted by the custom-room endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CustomAgentSpec {
    pub name: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

#[derive(Debug, Serialize)]
struct CustomRoomRequest<'a> {
    agents: &'a [CustomAgentSpec],
    duration_minutes: u64,
}

#[derive(Debug, Deserialize)]
struct RoomListing {
    #[serde(default)]
    rooms: Vec<Room>,
}

#[derive(Debug, Deserialize)]
struct CustomRoomResponse {
    room: Room,
}

// ── Catalog client ────────────────────────────────────────────────

/// HTTP client for the room catalog.
pub struct RoomCatalog {
    http: reqwest::Client,
    base_url: String,
}

impl RoomCatalog {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the ordered list of available rooms.
    pub async fn list(&self) -> Result<Vec<Room>, CatalogError> {
        let url = format!("{}/api/rooms", self.base_url);
        let response = self.http.get(&url).send().await?;
        let response = Self::check_status(response).await?;
        let listing: RoomListing = response.json().await?;
        tracing::debug!(count = listing.rooms.len(), "fetched room catalog");
        Ok(listing.rooms)
    }

    /// Create a custom room from user-defined agents.
    pub async fn create_custom(
        &self,
        agents: &[CustomAgentSpec],
        duration_minutes: u64,
    ) -> Result<Room, CatalogError> {
        let url = format!("{}/api/custom-room", self.base_url);
        let body = CustomRoomRequest {
            agents,
            duration_minutes,
        };
        let response = self.http.post(&url).json(&body).send().await?;
        let response = Self::check_status(response).await?;
        let created: CustomRoomResponse = response.json().await?;
        Ok(created.room)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CatalogError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CatalogError::Service {
            status: status.as_u16(),
            message,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn strategy_room_json() -> serde_json::Value {
        json!({
            "rooms": [{
                "name": "Strategy",
                "description": "Board-room style debate",
                "session_duration_minutes": 5,
                "greeting": "Hi",
                "agents": [
                    {"name": "Analyst", "voice": "aura-asteria-en"},
                    {"name": "Skeptic", "voice": "aura-orion-en"}
                ]
            }]
        })
    }

    #[test]
    fn room_duration_in_seconds() {
        let room = Room {
            name: "Strategy".into(),
            description: None,
            agents: vec![],
            session_duration_minutes: 5,
            greeting: "Hi".into(),
        };
        assert_eq!(room.duration_secs(), 300);
    }

    #[test]
    fn room_roundtrips_through_json() {
        let value = strategy_room_json();
        let room: Room = serde_json::from_value(value["rooms"][0].clone()).unwrap();
        assert_eq!(room.name, "Strategy");
        assert_eq!(room.agents.len(), 2);
        assert_eq!(room.agents[0].voice.as_deref(), Some("aura-asteria-en"));

        let back = serde_json::to_value(&room).unwrap();
        let again: Room = serde_json::from_value(back).unwrap();
        assert_eq!(again, room);
    }

    #[test]
    fn missing_greeting_defaults_empty() {
        let room: Room = serde_json::from_value(json!({
            "name": "Bare",
            "agents": [],
            "session_duration_minutes": 10
        }))
        .unwrap();
        assert_eq!(room.greeting, "");
    }

    #[tokio::test]
    async fn lists_rooms_from_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rooms"))
            .respond_with(ResponseTemplate::new(200).set_body_json(strategy_room_json()))
            .mount(&server)
            .await;

        let catalog = RoomCatalog::new(server.uri());
        let rooms = catalog.list().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "Strategy");
        assert_eq!(rooms[0].session_duration_minutes, 5);
    }

    #[tokio::test]
    async fn creates_custom_room() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/custom-room"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "room": {
                    "name": "Custom Session",
                    "session_duration_minutes": 5,
                    "greeting": "Welcome! Your three personalized agents are ready.",
                    "agents": [
                        {"name": "Coach", "system_prompt": "You coach.", "voice": "aura-luna-en"}
                    ]
                },
                "success": true
            })))
            .mount(&server)
            .await;

        let catalog = RoomCatalog::new(server.uri());
        let agents = vec![CustomAgentSpec {
            name: "Coach".into(),
            prompt: "You coach.".into(),
            voice: None,
        }];
        let room = catalog.create_custom(&agents, 5).await.unwrap();
        assert_eq!(room.name, "Custom Session");
        assert_eq!(room.agents[0].system_prompt.as_deref(), Some("You coach."));
    }

    #[tokio::test]
    async fn service_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rooms"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let catalog = RoomCatalog::new(server.uri());
        match catalog.list().await {
            Err(CatalogError::Service { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected service error, got {other:?}"),
        }
    }
}
