use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::vec3::Vec3;

/// Protocol version - increment when making breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

// Every frame is `{"event": <name>, "data": <payload>}`, one JSON object per
// WebSocket text message.

// === Server -> Client ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "event", content = "data")]
pub enum ServerMsg {
    #[serde(rename = "welcome")]
    Welcome(WelcomeMsg),
    /// Connection id of a peer that is (or just became) present.
    #[serde(rename = "playerJoined")]
    PlayerJoined(String),
    #[serde(rename = "playerUpdate")]
    PlayerUpdate(PlayerUpdateMsg),
    /// Connection id of a peer that left.
    #[serde(rename = "playerDisconnected")]
    PlayerDisconnected(String),
    #[serde(rename = "objectSpawned")]
    ObjectSpawned(ObjectSpawnedMsg),
    #[serde(rename = "voice-offer")]
    VoiceOffer(VoiceOfferMsg),
    #[serde(rename = "voice-answer")]
    VoiceAnswer(VoiceAnswerMsg),
    #[serde(rename = "voice-ice-candidate")]
    VoiceIceCandidate(VoiceIceCandidateMsg),
    #[serde(rename = "voice-speaking")]
    VoiceSpeaking(VoiceSpeakingMsg),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeMsg {
    pub protocol_version: u32,
    pub self_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PlayerUpdateMsg {
    pub id: String,
    pub position: Vec3,
    pub rotation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSpawnedMsg {
    pub id: String,
    pub asset_id: String,
    pub position: Vec3,
    /// Owner's connection id
    pub player_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VoiceOfferMsg {
    pub from: String,
    pub offer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VoiceAnswerMsg {
    pub from: String,
    pub answer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VoiceIceCandidateMsg {
    pub from: String,
    pub candidate: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSpeakingMsg {
    pub player_id: String,
    pub is_speaking: bool,
}

// === Client -> Server ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "event", content = "data")]
pub enum ClientMsg {
    #[serde(rename = "updatePosition")]
    UpdatePosition(UpdatePositionMsg),
    #[serde(rename = "spawnObject")]
    SpawnObject(SpawnObjectMsg),
    #[serde(rename = "voice-offer")]
    VoiceOffer(VoiceOfferRequest),
    #[serde(rename = "voice-answer")]
    VoiceAnswer(VoiceAnswerRequest),
    #[serde(rename = "voice-ice-candidate")]
    VoiceIceCandidate(VoiceIceCandidateRequest),
    #[serde(rename = "voice-speaking")]
    VoiceSpeaking(VoiceSpeakingRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct UpdatePositionMsg {
    pub position: Vec3,
    pub rotation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SpawnObjectMsg {
    pub id: String,
    pub asset_id: String,
    pub position: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VoiceOfferRequest {
    pub to: String,
    pub offer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VoiceAnswerRequest {
    pub to: String,
    pub answer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VoiceIceCandidateRequest {
    pub to: String,
    pub candidate: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSpeakingRequest {
    pub is_speaking: bool,
}
