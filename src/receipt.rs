//! Receipt parsing via an external vision model
//!
//! The provider is an OpenAI-compatible chat-completions endpoint; the base
//! URL is configurable so tests can point it at a stub server. The model is
//! instructed to answer with schema-only JSON, which is decoded into
//! `ReceiptParseResult` and normalized before it reaches clients.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::currency;
use crate::error::{AppError, AppResult};

/// Upper bound on a single vision-model call
pub const VISION_TIMEOUT: Duration = Duration::from_secs(45);

const RESULT_SCHEMA: &str = r#"{
  "merchant": "string or null",
  "items": [
    {
      "name": "string",
      "quantity": "number or null",
      "unit_price_cents": "int or null",
      "line_price_cents": "int or null",
      "discount_cents": "int or null",
      "discount_percent": "number or null",
      "raw_text": "string or null"
    }
  ],
  "subtotal_cents": "int or null",
  "tax_cents": "int or null",
  "total_cents": "int or null",
  "currency": "ISO-4217 code or null",
  "fees": "array of strings",
  "warnings": "array of strings",
  "confidence": "number between 0 and 1",
  "unparsed_lines": "array of strings"
}"#;

const SYSTEM_PROMPT: &str = "You are a receipt parser. Return ONLY valid JSON that matches the schema. If you are uncertain, set the field to null and add a warning. Do not include markdown.";

/// Structured result of parsing one receipt image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptParseResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(default)]
    pub items: Vec<ReceiptItem>,
    #[serde(default)]
    pub subtotal_cents: Option<i64>,
    #[serde(default)]
    pub tax_cents: Option<i64>,
    #[serde(default)]
    pub total_cents: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fees: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unparsed_lines: Vec<String>,
}

/// One parsed receipt line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptItem {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit_price_cents: Option<i64>,
    #[serde(default)]
    pub line_price_cents: Option<i64>,
    #[serde(default)]
    pub discount_cents: Option<i64>,
    #[serde(default)]
    pub discount_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Validate an uploaded content type; only images are accepted and the
/// HEIC/HEIF container is rejected with a user-facing message.
pub fn check_image_type(content_type: &str) -> AppResult<()> {
    let normalized = content_type.to_ascii_lowercase();
    if normalized.starts_with("image/heic") || normalized.starts_with("image/heif") {
        return Err(AppError::BadRequest(
            "HEIC images are not supported; please upload a JPEG or PNG".to_string(),
        ));
    }
    if !normalized.starts_with("image/") {
        return Err(AppError::BadRequest("file must be an image".to_string()));
    }
    Ok(())
}

/// Send one receipt image to the vision model and decode its answer.
pub async fn parse_receipt(
    client: &reqwest::Client,
    config: &Config,
    image: &[u8],
) -> AppResult<ReceiptParseResult> {
    let url = format!(
        "{}/v1/chat/completions",
        config.openai_base_url.trim_end_matches('/')
    );
    let response = client
        .post(&url)
        .bearer_auth(&config.openai_api_key)
        .json(&build_vision_request(image))
        .timeout(VISION_TIMEOUT)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(AppError::Upstream(format!(
            "vision model returned status {}",
            response.status().as_u16()
        )));
    }
    let completion: ChatCompletion = response.json().await?;
    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(AppError::Upstream("no response from vision model".to_string()));
    };
    let mut result: ReceiptParseResult = serde_json::from_str(&choice.message.content)
        .map_err(|err| AppError::Upstream(format!("vision model returned invalid JSON: {err}")))?;
    normalize_currency(&mut result);
    Ok(result)
}

/// Nullify unsupported currency codes, appending a warning.
pub fn normalize_currency(result: &mut ReceiptParseResult) {
    if let Some(code) = result.currency.take() {
        let upper = code.trim().to_uppercase();
        if currency::is_supported(&upper) {
            result.currency = Some(upper);
        } else {
            result
                .warnings
                .push(format!("unrecognized currency \"{code}\" ignored"));
        }
    }
}

fn build_vision_request(image: &[u8]) -> serde_json::Value {
    let encoded = BASE64_STANDARD.encode(image);
    serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [
            {
                "role": "system",
                "content": SYSTEM_PROMPT,
            },
            {
                "role": "user",
                "content": [
                    {
                        "type": "text",
                        "text": format!("Parse this receipt and return JSON with the schema: {RESULT_SCHEMA}"),
                    },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{encoded}") },
                    }
                ],
            }
        ],
        "temperature": 0.2,
        "max_tokens": 1500,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("image/jpeg", true ; "jpeg accepted")]
    #[test_case("image/png", true ; "png accepted")]
    #[test_case("IMAGE/JPEG", true ; "case insensitive")]
    #[test_case("image/heic", false ; "heic rejected")]
    #[test_case("image/heif", false ; "heif rejected")]
    #[test_case("application/pdf", false ; "non image rejected")]
    #[test_case("", false ; "missing type rejected")]
    fn test_check_image_type(content_type: &str, accepted: bool) {
        assert_eq!(check_image_type(content_type).is_ok(), accepted);
    }

    #[test]
    fn test_normalize_currency_uppercases_supported_codes() {
        let mut result = ReceiptParseResult {
            currency: Some("usd".to_string()),
            ..Default::default()
        };
        normalize_currency(&mut result);
        assert_eq!(result.currency.as_deref(), Some("USD"));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_normalize_currency_nullifies_unknown_codes() {
        let mut result = ReceiptParseResult {
            currency: Some("ZORKMID".to_string()),
            ..Default::default()
        };
        normalize_currency(&mut result);
        assert!(result.currency.is_none());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_vision_request_embeds_image_as_data_url() {
        let body = build_vision_request(&[0xFF, 0xD8, 0xFF]);
        assert_eq!(body["model"], "gpt-4o-mini");
        let user_content = &body["messages"][1]["content"];
        let image_url = user_content[1]["image_url"]["url"]
            .as_str()
            .expect("url present");
        assert!(image_url.starts_with("data:image/jpeg;base64,"));
    }
}
