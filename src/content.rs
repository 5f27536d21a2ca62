//! One-shot content generation
//!
//! Turns a product photo into marketing copy, or into an enhanced product
//! shot, with a single `generateContent` request each.

use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{Config, ContentSettings};
use crate::live::{Content, Part};
use crate::voice::TransportEnvelope;
use crate::{Error, Result};

const POST_PROMPT: &str = r#"You are a viral social media expert. Analyze this product image and write a "Social Media Master Kit" using SIMPLE, EVERYDAY ENGLISH.

The goal is to sell this product and make people love it.

1. Product Name: A creative title that CLEARLY describes what the product is (e.g., "Handmade Clay Water Pot", not just "Earthen Delight").
2. Tagline: A short, punchy slogan that sticks in the mind.
3. Social Caption: Write a caption for Instagram/Facebook. Start with a hook (a question or exciting statement), focus on the feeling of owning the product, use friendly emojis and keep it easy to read.
4. Professional Story: A heartwarming story for LinkedIn/WhatsApp about the behind the scenes, the hard work or the quality of materials.
5. Hashtags: 10-15 powerful hashtags mixed with niche tags.
6. Target Audience: Be specific (e.g., "Busy moms who love decor", "Students looking for cool gifts").
7. Alternatives: 2 creative ideas for how to use or gift this product.

Return the response in JSON format."#;

const POST_SYSTEM_INSTRUCTION: &str = "You are a warm, creative social media copywriter. You write in simple English but your ideas are brilliant and emotional.";

const ENHANCE_PROMPT: &str = "Generate a professional product photography version of this image. Improve lighting, clarity, and composition to make it look high-end.";

const NO_IMAGE_MESSAGE: &str = "AI could not generate an image from this input.";

/// Marketing copy derived from a product photo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedContent {
    pub product_name: String,
    pub tagline: String,
    /// Instagram-style caption opening with a hook
    pub short_caption: String,
    /// Longer story for professional networks
    pub promotional_caption: String,
    pub hashtags: String,
    pub audience: String,
    /// Ideas for using or gifting the product
    pub alternatives: String,
    /// Generation time, milliseconds since the epoch
    #[serde(default)]
    pub timestamp: i64,
}

/// Image returned by the enhancement model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedImage {
    /// Base64 image bytes
    pub data: String,
    pub mime_type: String,
}

impl EnhancedImage {
    /// Decode the image bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the payload is not valid base64
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        TransportEnvelope {
            data: self.data.clone(),
            mime_type: self.mime_type.clone(),
        }
        .to_bytes()
    }
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

impl GenerateResponse {
    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .into_iter()
            .flat_map(|content| content.parts.iter())
    }

    fn text(&self) -> String {
        self.parts().filter_map(|p| p.text.as_deref()).collect()
    }
}

/// Client for the one-shot generation REST API
pub struct ContentClient {
    client: reqwest::Client,
    api_key: SecretString,
    settings: ContentSettings,
}

impl ContentClient {
    #[must_use]
    pub fn new(settings: ContentSettings, api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            settings,
        }
    }

    /// Build a client from loaded configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no API key is configured
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.content.clone(), config.require_api_key()?))
    }

    /// Derive marketing copy from a product photo
    ///
    /// # Errors
    ///
    /// Returns `Error::Content` if the request fails or the reply is not the expected JSON
    pub async fn generate_post_content(&self, image: &[u8], mime_type: &str) -> Result<GeneratedContent> {
        let body = post_content_request(image, mime_type);
        let response = self.generate(&self.settings.text_model, &body).await?;

        let text = response.text();
        if text.trim().is_empty() {
            return Err(Error::Content("no response from model".to_string()));
        }

        let mut content = parse_post_content(&text)?;
        content.timestamp = chrono::Utc::now().timestamp_millis();

        tracing::info!(product = %content.product_name, "generated post content");
        Ok(content)
    }

    /// Produce a professional-looking version of a product photo
    ///
    /// # Errors
    ///
    /// Returns `Error::Content` with the model's explanation if no image comes back
    pub async fn generate_enhanced_image(&self, image: &[u8], mime_type: &str) -> Result<EnhancedImage> {
        let body = enhance_request(image, mime_type);
        let response = self.generate(&self.settings.image_model, &body).await?;
        let enhanced = extract_image(&response)?;

        tracing::info!(mime_type = %enhanced.mime_type, "generated enhanced image");
        Ok(enhanced)
    }

    async fn generate(&self, model: &str, body: &Value) -> Result<GenerateResponse> {
        let url = format!(
            "{}/models/{model}:generateContent",
            self.settings.endpoint.trim_end_matches('/')
        );

        tracing::debug!(model, "sending generateContent request");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Content(format!("generateContent error {status}: {body}")));
        }

        Ok(response.json().await?)
    }
}

fn image_content(image: &[u8], mime_type: &str, prompt: &str) -> Content {
    Content {
        role: Some("user".to_string()),
        parts: vec![
            Part::inline(TransportEnvelope::from_bytes(image, mime_type)),
            Part::text(prompt),
        ],
    }
}

fn post_content_request(image: &[u8], mime_type: &str) -> Value {
    let fields = [
        "productName",
        "alternatives",
        "shortCaption",
        "promotionalCaption",
        "hashtags",
        "audience",
        "tagline",
    ];
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|&name| (name.to_string(), json!({ "type": "STRING" })))
        .collect();

    json!({
        "contents": [image_content(image, mime_type, POST_PROMPT)],
        "systemInstruction": Content::text(POST_SYSTEM_INSTRUCTION),
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "OBJECT",
                "properties": properties,
                "required": fields,
            }
        }
    })
}

fn enhance_request(image: &[u8], mime_type: &str) -> Value {
    json!({ "contents": [image_content(image, mime_type, ENHANCE_PROMPT)] })
}

/// Strip a Markdown code fence wrapped around a JSON reply
#[must_use]
pub fn strip_json_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a JSON reply into marketing copy
///
/// # Errors
///
/// Returns `Error::Content` if the reply is not the expected JSON object
pub fn parse_post_content(text: &str) -> Result<GeneratedContent> {
    serde_json::from_str(strip_json_fence(text))
        .map_err(|e| Error::Content(format!("unexpected content reply: {e}")))
}

fn extract_image(response: &GenerateResponse) -> Result<EnhancedImage> {
    let image = response
        .parts()
        .filter_map(|p| p.inline_data.as_ref())
        .find(|blob| !blob.data.is_empty());

    if let Some(blob) = image {
        let mime_type = if blob.mime_type.is_empty() {
            "image/png".to_string()
        } else {
            blob.mime_type.clone()
        };
        return Ok(EnhancedImage {
            data: blob.data.clone(),
            mime_type,
        });
    }

    let text = response.text();
    tracing::warn!(output = %text, "no image in enhancement reply");
    if text.trim().is_empty() {
        Err(Error::Content(NO_IMAGE_MESSAGE.to_string()))
    } else {
        Err(Error::Content(text))
    }
}

/// Guess an image MIME type from a file extension
#[must_use]
pub fn image_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "image/png",
    }
}

/// File extension for an image MIME type
#[must_use]
pub fn image_extension(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(value: Value) -> GenerateResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn fence_is_stripped() {
        assert_eq!(strip_json_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_json_fence("  {\"b\":2} "), "{\"b\":2}");
    }

    #[test]
    fn post_content_parses_fenced_reply() {
        let reply = r##"```json
{"productName":"Handmade Clay Water Pot","tagline":"Cool water, warm hands","shortCaption":"Thirsty?","promotionalCaption":"Every pot is shaped by hand.","hashtags":"#clay #handmade","audience":"Home decor lovers","alternatives":"Planter; gift"}
```"##;
        let content = parse_post_content(reply).unwrap();
        assert_eq!(content.product_name, "Handmade Clay Water Pot");
        assert_eq!(content.hashtags, "#clay #handmade");
        assert_eq!(content.timestamp, 0);
    }

    #[test]
    fn post_content_rejects_incomplete_reply() {
        let err = parse_post_content(r#"{"productName":"Pot"}"#).unwrap_err();
        assert!(matches!(err, Error::Content(_)));
    }

    #[test]
    fn post_request_asks_for_json_schema() {
        let body = post_content_request(b"img", "image/jpeg");
        let config = &body["generationConfig"];
        assert_eq!(config["responseMimeType"], "application/json");
        assert_eq!(config["responseSchema"]["required"].as_array().unwrap().len(), 7);
        assert_eq!(
            body["contents"][0]["parts"][0]["inlineData"]["mimeType"],
            "image/jpeg"
        );
        assert_eq!(body["contents"][0]["parts"][0]["inlineData"]["data"], "aW1n");
        assert!(body["systemInstruction"]["parts"][0]["text"].is_string());
    }

    #[test]
    fn first_inline_image_is_returned() {
        let reply = response(json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "Here you go" },
                    { "inlineData": { "data": "iVBO", "mimeType": "image/jpeg" } },
                    { "inlineData": { "data": "second", "mimeType": "image/png" } }
                ]}
            }]
        }));

        let image = extract_image(&reply).unwrap();
        assert_eq!(image.data, "iVBO");
        assert_eq!(image.mime_type, "image/jpeg");
    }

    #[test]
    fn missing_mime_defaults_to_png() {
        let reply = response(json!({
            "candidates": [{ "content": { "parts": [ { "inlineData": { "data": "AAAA" } } ] } }]
        }));
        assert_eq!(extract_image(&reply).unwrap().mime_type, "image/png");
    }

    #[test]
    fn refusal_text_becomes_error() {
        let reply = response(json!({
            "candidates": [{ "content": { "parts": [ { "text": "I can't " }, { "text": "do that." } ] } }]
        }));
        let err = extract_image(&reply).unwrap_err();
        assert!(matches!(err, Error::Content(ref msg) if msg == "I can't do that."));
    }

    #[test]
    fn empty_reply_uses_default_message() {
        let err = extract_image(&GenerateResponse::default()).unwrap_err();
        assert!(matches!(err, Error::Content(ref msg) if msg == NO_IMAGE_MESSAGE));
    }

    #[test]
    fn mime_types_from_extension() {
        assert_eq!(image_mime_type(Path::new("pot.JPG")), "image/jpeg");
        assert_eq!(image_mime_type(Path::new("pot.webp")), "image/webp");
        assert_eq!(image_mime_type(Path::new("pot")), "image/png");
        assert_eq!(image_extension("image/jpeg"), "jpg");
    }
}
