//! Wire messages exchanged with the live voice endpoint

use serde::{Deserialize, Serialize};

use crate::voice::TransportEnvelope;

/// Message sent by the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Session configuration, sent once right after connecting
    Setup(Setup),
    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

/// Session configuration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    /// Model resource name, e.g. `models/gemini-2.5-flash-native-audio-preview-09-2025`
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

/// Generation parameters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// Response modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Voice selection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceSelection,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSelection {
    pub prebuilt_voice_config: PrebuiltVoice,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoice {
    pub voice_name: String,
}

impl SpeechConfig {
    /// Select a prebuilt voice by name
    #[must_use]
    pub fn prebuilt(voice_name: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceSelection {
                prebuilt_voice_config: PrebuiltVoice {
                    voice_name: voice_name.into(),
                },
            },
        }
    }
}

/// Streamed input chunk
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<TransportEnvelope>,
}

impl From<TransportEnvelope> for RealtimeInput {
    fn from(envelope: TransportEnvelope) -> Self {
        Self {
            media_chunks: vec![envelope],
        }
    }
}

/// Multi-part content, shared with the one-shot generation API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// Single text part
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }
}

/// One part of a content message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<TransportEnvelope>,
}

impl Part {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    #[must_use]
    pub const fn inline(envelope: TransportEnvelope) -> Self {
        Self {
            text: None,
            inline_data: Some(envelope),
        }
    }
}

/// Message received from the server
///
/// Unknown fields are ignored; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

/// Model output and turn signals
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    /// The user started speaking over the model
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

/// Server notice that the connection will end soon
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    /// Whether this message completes session setup
    #[must_use]
    pub const fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Whether queued playback must be discarded
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    /// Whether the model finished its turn
    #[must_use]
    pub fn is_turn_complete(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.turn_complete)
    }

    /// Inline audio parts in arrival order
    pub fn audio_parts(&self) -> impl Iterator<Item = &TransportEnvelope> {
        self.server_content
            .iter()
            .filter_map(|c| c.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.is_audio())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_serializes_to_expected_shape() {
        let msg = ClientMessage::Setup(Setup {
            model: "models/test".to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: Some(SpeechConfig::prebuilt("Kore")),
            },
            system_instruction: Some(Content::text("be kind")),
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/test",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Kore" } }
                        }
                    },
                    "systemInstruction": { "parts": [ { "text": "be kind" } ] }
                }
            })
        );
    }

    #[test]
    fn realtime_input_wraps_envelope() {
        let envelope = TransportEnvelope {
            data: "AAA=".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        let value = serde_json::to_value(ClientMessage::RealtimeInput(envelope.into())).unwrap();
        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "mediaChunks": [ { "data": "AAA=", "mimeType": "audio/pcm;rate=16000" } ]
                }
            })
        );
    }

    #[test]
    fn server_message_exposes_audio_and_interrupt() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "data": "AAA=", "mimeType": "audio/pcm;rate=24000" } },
                        { "text": "thinking" },
                        { "inlineData": { "data": "BBB=", "mimeType": "audio/pcm;rate=24000" } }
                    ]
                },
                "interrupted": true
            }
        }))
        .unwrap();

        let data: Vec<_> = msg.audio_parts().map(|p| p.data.as_str()).collect();
        assert_eq!(data, vec!["AAA=", "BBB="]);
        assert!(msg.is_interrupted());
        assert!(!msg.is_setup_complete());
    }

    #[test]
    fn non_audio_inline_data_is_skipped() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [ { "inlineData": { "data": "AAA=", "mimeType": "image/png" } } ]
                }
            }
        }))
        .unwrap();
        assert_eq!(msg.audio_parts().count(), 0);
    }

    #[test]
    fn setup_complete_and_unknown_fields() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"setupComplete":{},"usageMetadata":{"totalTokenCount":3}}"#)
                .unwrap();
        assert!(msg.is_setup_complete());
        assert!(!msg.is_interrupted());
        assert_eq!(msg.audio_parts().count(), 0);
    }
}
