use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use replica_contracts::PipelineError;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::builder::BuildBrief;
use crate::services::{
    CodeService, GeneratedImage, ImageGenRequest, ImageGenService, InlineImage, TextRequest,
    TextService, VisionRequest, VisionService,
};
use crate::util::{non_empty_env, truncate_text, value_as_f64};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini `generateContent` transport shared by every capability.
#[derive(Clone)]
pub struct GeminiClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
    timeout_s: f64,
    max_retries: usize,
    retry_backoff_s: f64,
}

impl GeminiClient {
    /// Reads `GEMINI_API_KEY` (or `GOOGLE_API_KEY`) and `GEMINI_API_BASE`.
    pub fn from_env() -> Result<Self, PipelineError> {
        let api_key = non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .ok_or_else(|| {
                PipelineError::Configuration("GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string())
            })?;
        let mut client = Self::new(api_key, non_empty_env("GEMINI_API_BASE"));
        client.timeout_s = value_as_f64(
            non_empty_env("REPLICA_REQUEST_TIMEOUT").as_deref(),
            90.0,
            15.0,
            300.0,
        );
        client.max_retries = value_as_f64(
            non_empty_env("REPLICA_TRANSPORT_RETRIES").as_deref(),
            2.0,
            0.0,
            4.0,
        )
        .round() as usize;
        Ok(client)
    }

    pub fn new(api_key: impl Into<String>, api_base: Option<String>) -> Self {
        Self {
            api_base: api_base
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: api_key.into(),
            http: HttpClient::new(),
            timeout_s: 90.0,
            max_retries: 2,
            retry_backoff_s: 1.2,
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn generate_content(&self, model: &str, payload: &Value) -> Result<Value> {
        let endpoint = self.endpoint_for_model(model);
        let response = self.post_with_transport_retries(&endpoint, payload)?;
        response_json_or_error("Gemini", response)
    }

    fn post_with_transport_retries(&self, endpoint: &str, payload: &Value) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", self.api_key.as_str())])
                .timeout(Duration::from_secs_f64(self.timeout_s))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay_s = self.retry_backoff_s * attempt as f64;
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }
    }
}

fn inline_part(image: &InlineImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.base64(),
        }
    })
}

fn text_payload(system: &str, parts: Vec<Value>, json_output: bool) -> Value {
    let mut payload = Map::new();
    if !system.trim().is_empty() {
        payload.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system }] }),
        );
    }
    payload.insert(
        "contents".to_string(),
        json!([{ "role": "user", "parts": parts }]),
    );
    let mut generation_config = Map::new();
    generation_config.insert("temperature".to_string(), json!(0.2));
    if json_output {
        generation_config.insert("responseMimeType".to_string(), json!("application/json"));
    }
    payload.insert(
        "generationConfig".to_string(),
        Value::Object(generation_config),
    );
    Value::Object(payload)
}

fn candidate_parts(response_payload: &Value) -> Vec<Value> {
    response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|candidate| {
            candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .collect()
}

fn extract_text(response_payload: &Value) -> Result<String> {
    let text: String = candidate_parts(response_payload)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        let reason = response_payload
            .get("candidates")
            .and_then(|candidates| candidates.get(0))
            .and_then(|candidate| candidate.get("finishReason"))
            .and_then(Value::as_str)
            .unwrap_or("no text parts");
        bail!("Gemini returned no text ({reason})");
    }
    Ok(text)
}

fn extract_image(response_payload: &Value) -> Result<GeneratedImage> {
    for part in candidate_parts(response_payload) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .context("Gemini image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png")
            .to_string();
        return Ok(GeneratedImage { bytes, mime_type });
    }
    bail!("Gemini returned no image data")
}

/// Snaps a `WIDTHxHEIGHT` hint to the closest aspect ratio the image models
/// accept.
fn nearest_ratio_from_size(size: &str) -> &'static str {
    let (width, height) = super::parse_dims(size);
    let target = width as f64 / height as f64;
    let candidates = [
        ("1:1", 1.0f64),
        ("2:3", 2.0 / 3.0),
        ("3:2", 3.0 / 2.0),
        ("3:4", 3.0 / 4.0),
        ("4:3", 4.0 / 3.0),
        ("9:16", 9.0 / 16.0),
        ("16:9", 16.0 / 9.0),
        ("21:9", 21.0 / 9.0),
    ];
    let mut best = candidates[0];
    for candidate in candidates {
        if (candidate.1 - target).abs() < (best.1 - target).abs() {
            best = candidate;
        }
    }
    best.0
}

impl VisionService for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn analyze(&self, request: &VisionRequest) -> Result<String> {
        let payload = text_payload(
            "",
            vec![inline_part(&request.image), json!({ "text": request.prompt })],
            true,
        );
        let response = self
            .generate_content(&request.model, &payload)
            .context("vision analysis request failed")?;
        extract_text(&response)
    }
}

impl TextService for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn complete(&self, request: &TextRequest) -> Result<String> {
        let payload = text_payload(
            &request.system,
            vec![json!({ "text": request.prompt })],
            true,
        );
        let response = self
            .generate_content(&request.model, &payload)
            .context("text completion request failed")?;
        extract_text(&response)
    }
}

impl CodeService for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, brief: &BuildBrief) -> Result<String> {
        let mut parts = Vec::new();
        if let Some(reference) = brief.reference.as_ref() {
            parts.push(inline_part(reference));
        }
        parts.push(json!({ "text": brief.user_prompt() }));
        let payload = text_payload(&brief.system_prompt(), parts, true);
        let response = self
            .generate_content(&brief.model, &payload)
            .context("code generation request failed")?;
        extract_text(&response)
    }
}

impl ImageGenService for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &ImageGenRequest) -> Result<GeneratedImage> {
        let mut parts = Vec::new();
        if let Some(reference) = request.reference.as_ref() {
            parts.push(inline_part(reference));
        }
        parts.push(json!({ "text": request.prompt }));
        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": nearest_ratio_from_size(&request.size) },
            },
        });
        let response = self
            .generate_content(&request.model, &payload)
            .context("image generation request failed")?;
        extract_image(&response)
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::json;

    use super::{extract_image, extract_text, nearest_ratio_from_size, text_payload, GeminiClient};

    #[test]
    fn endpoint_accepts_bare_and_prefixed_models() {
        let client = GeminiClient::new("key", Some("https://example.test/v1beta/".to_string()));
        assert_eq!(
            client.endpoint_for_model("gemini-2.5-pro"),
            "https://example.test/v1beta/models/gemini-2.5-pro:generateContent"
        );
        assert_eq!(
            client.endpoint_for_model("models/gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn text_parts_are_joined_across_candidates() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{
                "content": {"parts": [{"text": "{\"a\":"}, {"text": "1}"}]}
            }]
        });
        assert_eq!(extract_text(&payload)?, "{\"a\":1}");
        let blocked = json!({"candidates": [{"finishReason": "SAFETY"}]});
        let err = extract_text(&blocked).expect_err("no text");
        assert!(err.to_string().contains("SAFETY"));
        Ok(())
    }

    #[test]
    fn inline_image_data_is_decoded() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "here"},
                    {"inline_data": {"mime_type": "image/jpeg", "data": BASE64.encode([1u8, 2, 3])}}
                ]}
            }]
        });
        let image = extract_image(&payload)?;
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.mime_type, "image/jpeg");
        assert!(extract_image(&json!({"candidates": []})).is_err());
        Ok(())
    }

    #[test]
    fn payload_carries_system_instruction_and_json_mime() {
        let payload = text_payload("be terse", vec![json!({"text": "hi"})], true);
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            json!("be terse")
        );
        assert_eq!(
            payload["generationConfig"]["responseMimeType"],
            json!("application/json")
        );
        assert!(text_payload("", vec![], false).get("systemInstruction").is_none());
    }

    #[test]
    fn size_hints_snap_to_supported_ratios() {
        assert_eq!(nearest_ratio_from_size("1536x864"), "16:9");
        assert_eq!(nearest_ratio_from_size("512x512"), "1:1");
        assert_eq!(nearest_ratio_from_size("1024x768"), "4:3");
    }
}
