use super::{Generation, GenerationRequest, Generator, GeneratorError};
use crate::usage::Usage;
use crate::util::truncate;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// OpenRouter chat completions endpoint.
pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1/chat/completions";

pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

const MAX_TOKENS: u32 = 16384;

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

const SYSTEM_PROMPT: &str = "You are a security engineer fixing a vulnerability in a C/C++ or Java \
project. Reply with a single unified diff, relative to the repository root, inside one ```diff \
fenced block. Do not modify tests, fuzz harnesses or build scripts.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Usage block as reported by OpenRouter.
#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default, alias = "total_cost")]
    cost: Option<f64>,
}

impl From<ApiUsage> for Usage {
    fn from(api: ApiUsage) -> Self {
        Usage::new(
            api.prompt_tokens,
            api.completion_tokens,
            api.cost.unwrap_or(0.0),
        )
    }
}

/// Chat-completion generator. The reply's fenced diff is the candidate patch.
pub struct OpenRouterGenerator {
    name: String,
    model: String,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenRouterGenerator {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        api_base: Option<&str>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            api_base: api_base.unwrap_or(DEFAULT_API_BASE).to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Build a generator whose key comes from `OPENROUTER_API_KEY`.
    pub fn from_env(name: &str, model: &str, api_base: Option<&str>) -> anyhow::Result<Self> {
        let key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("{} is not set", API_KEY_ENV))?;
        Ok(Self::new(name, model, api_base, key))
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<(String, Option<Usage>)> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: MAX_TOKENS,
            stream: false,
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .client
                .post(&self.api_base)
                .header("Content-Type", "application/json")
                .header("X-Title", "patchbench")
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to parse completion response: {}\n{}",
                        e,
                        truncate(&text, 400)
                    )
                })?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                return Ok((content, parsed.usage.map(Usage::from)));
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text).unwrap_or_else(|| {
                    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1)) / 1000
                });
                tracing::warn!(
                    generator = %self.name,
                    retry_after,
                    retry_count,
                    "rate limited, backing off"
                );
                tokio::time::sleep(std::time::Duration::from_secs(retry_after)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => format!("Invalid API key (check {})", API_KEY_ENV),
                429 => format!("Rate limited after {} retries", retry_count),
                500..=599 => format!("Completion server error ({})", status),
                _ => format!("API error {}: {}", status, truncate(&text, 200)),
            };
            return Err(anyhow::anyhow!(message));
        }
    }
}

#[async_trait]
impl Generator for OpenRouterGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<Generation, GeneratorError> {
        let (content, usage) = self.complete(request.prompt).await?;
        if let Some(dir) = request.artifact_dir {
            if let Err(err) = std::fs::write(dir.join("response.md"), &content) {
                tracing::debug!(error = %err, "could not store completion text");
            }
        }
        Ok(Generation {
            diff: extract_diff(&content).map(String::into_bytes),
            usage,
        })
    }
}

/// Extract a retry-after hint (seconds) from an error body.
fn parse_retry_after(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    let pos = lower.find("retry")?;
    lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

fn fenced_diff_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:diff|patch)[^\n]*\n(.*?)```").ok())
        .as_ref()
}

/// Pull the unified diff out of a model reply.
///
/// Every fenced `diff`/`patch` block is concatenated in order. A reply that is
/// itself a bare diff is taken as-is.
pub fn extract_diff(content: &str) -> Option<String> {
    let mut blocks = String::new();
    let captures = fenced_diff_re()
        .map(|re| re.captures_iter(content).collect::<Vec<_>>())
        .unwrap_or_default();
    for cap in captures {
        if let Some(body) = cap.get(1) {
            let body = body.as_str();
            if body.trim().is_empty() {
                continue;
            }
            blocks.push_str(body);
            if !body.ends_with('\n') {
                blocks.push('\n');
            }
        }
    }
    if !blocks.is_empty() {
        return Some(blocks);
    }
    let trimmed = content.trim_start();
    if trimmed.starts_with("diff --git") || trimmed.starts_with("--- ") {
        let mut diff = trimmed.trim_end().to_string();
        diff.push('\n');
        return Some(diff);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_fenced_block() {
        let reply = "Here is the fix:\n```diff\n--- a/x.c\n+++ b/x.c\n@@ -1 +1 @@\n-a\n+b\n```\nDone.";
        let diff = extract_diff(reply).unwrap();
        assert!(diff.starts_with("--- a/x.c"));
        assert!(diff.ends_with("+b\n"));
    }

    #[test]
    fn concatenates_blocks_in_order() {
        let reply = "```diff\n--- a/one\n```\ntext\n```patch\n--- a/two\n```";
        assert_eq!(extract_diff(reply).unwrap(), "--- a/one\n--- a/two\n");
    }

    #[test]
    fn accepts_bare_diff_reply() {
        let reply = "diff --git a/x b/x\n--- a/x\n+++ b/x\n";
        assert_eq!(extract_diff(reply).unwrap(), reply);
    }

    #[test]
    fn prose_only_reply_has_no_diff() {
        assert!(extract_diff("I could not find the bug.").is_none());
        assert!(extract_diff("```diff\n\n```").is_none());
        assert!(extract_diff("```c\nint x;\n```").is_none());
    }

    #[test]
    fn retry_after_hint() {
        assert_eq!(parse_retry_after("Please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("rate limited"), None);
        assert_eq!(parse_retry_after("retry in 9999 seconds"), None);
    }

    #[test]
    fn usage_block_accepts_total_cost_alias() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"hi"}}],
                "usage":{"prompt_tokens":10,"completion_tokens":4,"total_cost":0.002}}"#,
        )
        .unwrap();
        let usage = Usage::from(parsed.usage.unwrap());
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.cost_micros, 2_000);

        let missing: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(missing.usage.is_none());
    }
}
