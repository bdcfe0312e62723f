//! Cast namespace payloads

use serde_json::{json, Value};

use crate::protocol::{PlayerStatus, TrackMetadata};

pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";

/// Platform receiver every device exposes
pub const PLATFORM_RECEIVER_ID: &str = "receiver-0";

/// `metadataType` of generic music metadata
const MUSIC_TRACK_METADATA: u8 = 3;

/// Media description for a LOAD request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    /// Stream id; the client maps it to the URL the device fetches
    pub content_id: String,
    pub content_type: String,
    pub metadata: TrackMetadata,
}

impl MediaInfo {
    pub fn live(content_id: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            content_type: content_type.into(),
            metadata: TrackMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: TrackMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// `media` object of a LOAD request, with `content_url` as `contentId`
    pub fn to_json(&self, content_url: &str) -> Value {
        let mut metadata = json!({ "metadataType": MUSIC_TRACK_METADATA });
        if let Some(title) = &self.metadata.title {
            metadata["title"] = json!(title);
        }
        if let Some(artist) = &self.metadata.artist {
            metadata["artist"] = json!(artist);
        }
        if let Some(album) = &self.metadata.album {
            metadata["albumName"] = json!(album);
        }

        json!({
            "contentId": content_url,
            "streamType": "LIVE",
            "contentType": self.content_type,
            "metadata": metadata,
        })
    }
}

pub fn connect_message() -> Value {
    json!({ "type": "CONNECT", "origin": {} })
}

pub fn close_message() -> Value {
    json!({ "type": "CLOSE" })
}

pub fn ping_message() -> Value {
    json!({ "type": "PING" })
}

pub fn pong_message() -> Value {
    json!({ "type": "PONG" })
}

pub fn launch_request(request_id: i64, app_id: &str) -> Value {
    json!({ "type": "LAUNCH", "requestId": request_id, "appId": app_id })
}

pub fn stop_app_request(request_id: i64, session_id: &str) -> Value {
    json!({ "type": "STOP", "requestId": request_id, "sessionId": session_id })
}

pub fn load_request(request_id: i64, media: &MediaInfo, content_url: &str) -> Value {
    json!({
        "type": "LOAD",
        "requestId": request_id,
        "autoplay": true,
        "currentTime": 0,
        "media": media.to_json(content_url),
    })
}

pub fn message_type(payload: &Value) -> Option<&str> {
    payload.get("type").and_then(Value::as_str)
}

pub fn request_id(payload: &Value) -> Option<i64> {
    payload.get("requestId").and_then(Value::as_i64)
}

/// A launched application on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningApp {
    pub transport_id: String,
    pub session_id: String,
}

/// Find `app_id` in a RECEIVER_STATUS payload
pub fn running_app(payload: &Value, app_id: &str) -> Option<RunningApp> {
    payload
        .get("status")?
        .get("applications")?
        .as_array()?
        .iter()
        .filter(|app| app.get("appId").and_then(Value::as_str) == Some(app_id))
        .find_map(|app| {
            Some(RunningApp {
                transport_id: app.get("transportId")?.as_str()?.to_string(),
                session_id: app.get("sessionId")?.as_str()?.to_string(),
            })
        })
}

/// First entry of a MEDIA_STATUS payload
pub fn parse_media_status(payload: &Value) -> Option<PlayerStatus> {
    if message_type(payload) != Some("MEDIA_STATUS") {
        return None;
    }
    let status = payload.get("status")?.as_array()?.first()?;
    Some(PlayerStatus {
        player_state: status
            .get("playerState")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string(),
        idle_reason: status
            .get("idleReason")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        current_time: status
            .get("currentTime")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        media_session_id: status.get("mediaSessionId").and_then(Value::as_i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_request_is_live_autoplay() {
        let media = MediaInfo::live("bridge-stream-Den", "audio/mp3").with_metadata(TrackMetadata {
            title: Some("AirPlay Stream to Den".into()),
            artist: None,
            album: Some("Live".into()),
        });
        let request = load_request(7, &media, "http://10.0.0.2:8090/stream/bridge-stream-Den");

        assert_eq!(request["type"], "LOAD");
        assert_eq!(request["requestId"], 7);
        assert_eq!(request["autoplay"], true);
        assert_eq!(request["media"]["streamType"], "LIVE");
        assert_eq!(
            request["media"]["contentId"],
            "http://10.0.0.2:8090/stream/bridge-stream-Den"
        );
        assert_eq!(request["media"]["metadata"]["title"], "AirPlay Stream to Den");
        assert_eq!(request["media"]["metadata"]["albumName"], "Live");
        assert!(request["media"]["metadata"].get("artist").is_none());
    }

    #[test]
    fn test_running_app_lookup() {
        let status = json!({
            "type": "RECEIVER_STATUS",
            "requestId": 1,
            "status": {
                "applications": [
                    { "appId": "E8C28D3C", "transportId": "backdrop", "sessionId": "a" },
                    { "appId": "CC1AD845", "transportId": "web-5", "sessionId": "b" }
                ]
            }
        });
        assert_eq!(
            running_app(&status, "CC1AD845"),
            Some(RunningApp {
                transport_id: "web-5".into(),
                session_id: "b".into(),
            })
        );
        assert_eq!(running_app(&status, "233637DE"), None);
    }

    #[test]
    fn test_media_status() {
        let payload = json!({
            "type": "MEDIA_STATUS",
            "status": [{
                "mediaSessionId": 3,
                "playerState": "IDLE",
                "idleReason": "ERROR",
                "currentTime": 12.5
            }]
        });
        let status = parse_media_status(&payload).unwrap();
        assert_eq!(status.player_state, "IDLE");
        assert_eq!(status.idle_reason.as_deref(), Some("ERROR"));
        assert_eq!(status.media_session_id, Some(3));

        assert!(parse_media_status(&json!({ "type": "MEDIA_STATUS", "status": [] })).is_none());
        assert!(parse_media_status(&json!({ "type": "PONG" })).is_none());
    }
}
