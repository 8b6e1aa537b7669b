use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::llm::media::supported_image_mime;
use crate::llm::{ImageGenerationError, ImageModel, ImageRequest, SourceImage, VisionModel, VisionRequest};
use crate::utils::http::get_http_client;
use crate::utils::text::truncate_for_log;
use crate::utils::timing::log_llm_timing;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_VISION_MAX_ATTEMPTS: usize = 2;
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

/// REST client for the Gemini `generateContent` endpoint, serving both the
/// vision (structured JSON) and image-generation roles.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_key: String,
    base_url: String,
    vision_model: String,
    image_model: String,
    temperature: f32,
    safety_profile: String,
    request_timeout: Duration,
}

impl GeminiClient {
    pub fn from_config(config: &Config) -> Self {
        GeminiClient {
            api_key: config.gemini_api_key.clone(),
            base_url: GEMINI_BASE_URL.to_string(),
            vision_model: config.gemini_vision_model.clone(),
            image_model: config.gemini_image_model.clone(),
            temperature: config.gemini_temperature,
            safety_profile: config.gemini_safety_settings.clone(),
            request_timeout: Duration::from_secs(config.gemini_request_timeout_seconds.max(5)),
        }
    }

    fn redact_api_key(&self, text: &str) -> String {
        let key = self.api_key.trim();
        if key.is_empty() {
            return text.to_string();
        }
        text.replace(key, "[redacted]")
    }

    fn build_safety_settings(&self) -> Vec<Value> {
        let threshold = match self.safety_profile.as_str() {
            "standard" => "BLOCK_MEDIUM_AND_ABOVE",
            "permissive" => "OFF",
            other => {
                warn!(
                    "Unknown Gemini safety profile '{}', using permissive defaults.",
                    other
                );
                "OFF"
            }
        };

        vec![
            json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
            json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
            json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
            json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
        ]
    }

    async fn call_api(
        &self,
        model: &str,
        payload: Value,
        operation: &str,
        max_attempts: usize,
    ) -> Result<GeminiResponse> {
        let client = get_http_client();
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        if tracing::enabled!(tracing::Level::DEBUG) {
            let payload_summary = summarize_gemini_payload(&payload);
            debug!(target: "llm.gemini", model = model, operation = operation, payload = %payload_summary);
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .timeout(self.request_timeout)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let err_text = self.redact_api_key(&err.to_string());
                    let should_retry = gemini_should_retry_error(&err) && attempt < max_attempts;
                    warn!(
                        "Gemini request failed to send: {} (operation={}, timeout={}, connect={}, retrying={})",
                        err_text,
                        operation,
                        err.is_timeout(),
                        err.is_connect(),
                        should_retry
                    );
                    if should_retry {
                        tokio::time::sleep(gemini_retry_delay(attempt)).await;
                        continue;
                    }
                    return Err(anyhow!("Gemini request failed: {}", err_text));
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let (message, body_summary) = summarize_error_body(&body);
                let should_retry = gemini_should_retry_status(status) && attempt < max_attempts;
                warn!(
                    "Gemini API error: operation={}, status={}, body={}, retrying={}",
                    operation, status, body_summary, should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                let detail = message.unwrap_or(body_summary);
                return Err(anyhow!(
                    "Gemini request failed with status {}: {}",
                    status,
                    self.redact_api_key(&detail)
                ));
            }

            let value = response.json::<GeminiResponse>().await?;
            if tracing::enabled!(tracing::Level::DEBUG) {
                let response_summary = summarize_gemini_response(&value);
                debug!(target: "llm.gemini", model = model, operation = operation, response = %response_summary);
            }
            return Ok(value);
        }
    }
}

impl VisionModel for GeminiClient {
    fn model_name(&self) -> &str {
        &self.vision_model
    }

    async fn analyze(&self, request: VisionRequest) -> Result<String> {
        let parts = build_parts(&request.prompt, &request.images, true);
        let mut generation_config = json!({
            "temperature": self.temperature,
            "maxOutputTokens": 1024,
        });
        if request.expect_json {
            if let Some(config_object) = generation_config.as_object_mut() {
                config_object.insert(
                    "responseMimeType".to_string(),
                    json!("application/json"),
                );
            }
        }
        let payload = json!({
            "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
            "safetySettings": self.build_safety_settings(),
        });

        let model = self.vision_model.as_str();
        let metadata = json!({ "images": request.images.len() });
        log_llm_timing("gemini", model, request.operation, Some(metadata), || async {
            let response = self
                .call_api(model, payload, request.operation, GEMINI_VISION_MAX_ATTEMPTS)
                .await?;
            let text = extract_text_from_response(response);
            if text.trim().is_empty() {
                return Err(anyhow!("Gemini returned no text for {}", request.operation));
            }
            Ok(text)
        })
        .await
    }
}

impl ImageModel for GeminiClient {
    fn model_name(&self) -> &str {
        &self.image_model
    }

    async fn generate(&self, request: ImageRequest) -> Result<Vec<u8>, ImageGenerationError> {
        let parts = build_parts(&request.prompt, &request.images, false);
        let payload = json!({
            "systemInstruction": { "parts": [{ "text": "Edit the images based on the prompt. CRITICAL: respond with an image, NOT TEXT." }] },
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": build_image_config(&request.aspect_ratio, &request.image_size),
            },
            "safetySettings": self.build_safety_settings(),
        });

        let model = self.image_model.as_str();
        let metadata = json!({
            "aspectRatio": request.aspect_ratio,
            "imageSize": request.image_size,
            "promptChars": request.prompt.chars().count(),
        });
        // Single attempt: the orchestrator owns the retry policy for renders.
        let response = log_llm_timing("gemini", model, "render", Some(metadata), || async {
            self.call_api(model, payload, "render", 1).await
        })
        .await
        .map_err(|err| ImageGenerationError(err.to_string()))?;

        let finish_reason = response
            .candidates
            .as_ref()
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.finish_reason.clone());
        let mut images = extract_images_from_response(response);
        if images.is_empty() {
            return Err(ImageGenerationError(format!(
                "No images returned by Gemini (model: {}, finish_reason: {})",
                model,
                finish_reason.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        Ok(images.swap_remove(0))
    }
}

fn gemini_should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn gemini_should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn build_image_config(aspect_ratio: &str, image_size: &str) -> Value {
    let mut map = Map::new();
    let aspect_ratio = aspect_ratio.trim();
    if !aspect_ratio.is_empty() {
        map.insert("aspectRatio".to_string(), json!(aspect_ratio));
    }
    let image_size = image_size.trim();
    if !image_size.is_empty() {
        map.insert("imageSize".to_string(), json!(image_size));
    }
    Value::Object(map)
}

fn build_parts(prompt: &str, images: &[SourceImage], text_after_media: bool) -> Vec<Value> {
    let mut parts = Vec::new();
    let text_part = json!({ "text": prompt });

    if !text_after_media {
        parts.push(text_part.clone());
    }

    for image in images {
        if image.is_empty() {
            warn!("Skipping empty image part");
            continue;
        }
        let mime_type = if supported_image_mime(image.mime_type()) {
            image.mime_type()
        } else {
            "image/png"
        };
        parts.push(json!({
            "inlineData": {
                "mimeType": mime_type,
                "data": general_purpose::STANDARD.encode(image.bytes())
            }
        }));
    }

    if text_after_media {
        parts.push(text_part);
    }

    parts
}

fn summarize_gemini_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| {
            if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                json!({ "text": truncate_for_log(text, 200) })
            } else if let Some(inline_data) = part.get("inlineData") {
                let mime_type = inline_data
                    .get("mimeType")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                let data_len = inline_data
                    .get("data")
                    .and_then(|value| value.as_str())
                    .map(|value| value.len())
                    .unwrap_or(0);
                json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
            } else {
                json!({ "unknownPart": true })
            }
        })
        .collect()
}

fn summarize_gemini_payload(payload: &Value) -> Value {
    let mut summary = Map::new();

    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        let summarized = contents
            .iter()
            .map(|content| {
                let parts = content
                    .get("parts")
                    .and_then(|value| value.as_array())
                    .map(|parts| summarize_gemini_parts(parts))
                    .unwrap_or_default();
                json!({ "parts": parts })
            })
            .collect::<Vec<_>>();
        summary.insert("contents".to_string(), Value::Array(summarized));
    }

    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }

    Value::Object(summary)
}

fn summarize_gemini_response(response: &GeminiResponse) -> Value {
    let mut text_parts = 0usize;
    let mut image_parts = 0usize;
    let mut text_preview = None;

    for candidate in response.candidates.as_deref().unwrap_or(&[]) {
        let Some(parts) = candidate.content.as_ref().and_then(|c| c.parts.as_ref()) else {
            continue;
        };
        for part in parts {
            match part {
                GeminiPart::Text { text } => {
                    text_parts += 1;
                    if text_preview.is_none() && !text.trim().is_empty() {
                        text_preview = Some(truncate_for_log(text, 200));
                    }
                }
                GeminiPart::InlineData { inline_data } => {
                    if inline_data.mime_type.starts_with("image/") {
                        image_parts += 1;
                    }
                }
            }
        }
    }

    json!({
        "candidates": response.candidates.as_ref().map(|c| c.len()).unwrap_or(0),
        "textParts": text_parts,
        "imageParts": image_parts,
        "textPreview": text_preview
    })
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string());
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn extract_text_from_response(response: GeminiResponse) -> String {
    let mut text_parts = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
            if let GeminiPart::Text { text } = part {
                if !text.trim().is_empty() {
                    text_parts.push(text);
                }
            }
        }
    }
    text_parts.join("\n")
}

fn extract_images_from_response(response: GeminiResponse) -> Vec<Vec<u8>> {
    let mut images = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
            if let GeminiPart::InlineData { inline_data } = part {
                if !inline_data.mime_type.starts_with("image/") {
                    continue;
                }
                match general_purpose::STANDARD.decode(inline_data.data) {
                    Ok(bytes) => images.push(bytes),
                    Err(err) => warn!("Discarding undecodable Gemini image part: {}", err),
                }
            }
        }
    }
    images
}
