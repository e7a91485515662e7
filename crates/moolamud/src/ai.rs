use std::time::Duration;

use reqwest::StatusCode;

pub const API_BASE_DEFAULT: &str = "https://api.openai.com/v1";
pub const MODEL_DEFAULT: &str = "gpt-4o-mini";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REPLY_TOKENS: u32 = 256;

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub base: String,
    pub model: String,
    pub api_key: String,
}

impl AiConfig {
    /// `None` (feature off) when no API key is configured.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty())?;
        let base = std::env::var("OPENAI_API_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| API_BASE_DEFAULT.to_string());
        let model = std::env::var("MOOLAMUD_AI_MODEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| MODEL_DEFAULT.to_string());
        Some(Self {
            base,
            model,
            api_key,
        })
    }
}

/// One best-effort chat completion. Callers run this after any ledger
/// effect is already committed and treat every error as non-fatal.
pub async fn complete(cfg: &AiConfig, prompt: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let url = format!("{}/chat/completions", cfg.base.trim_end_matches('/'));
    let req = serde_json::json!({
        "model": cfg.model,
        "messages": [
            {"role": "user", "content": prompt}
        ],
        "max_tokens": MAX_REPLY_TOKENS,
    });

    let resp = client
        .post(url)
        .bearer_auth(&cfg.api_key)
        .json(&req)
        .send()
        .await?;
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status != StatusCode::OK {
        anyhow::bail!("chat http={}", status.as_u16());
    }

    let content = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("choices")?
                .as_array()?
                .first()?
                .get("message")?
                .get("content")?
                .as_str()
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "(no content)".to_string());

    Ok(content.trim().to_string())
}
