use super::{Generation, GenerationRequest, Generator, GeneratorError};
use crate::git_ops;
use crate::usage::Usage;
use crate::util::run_command_async;
use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Runs an external coding agent inside the checkout.
///
/// The prompt is written to the agent's stdin; whatever the agent leaves in
/// the working tree is collected with `git diff`. If the last non-empty stdout
/// line is a JSON object carrying token or cost fields, it becomes the call's
/// usage.
pub struct AgentCommandGenerator {
    name: String,
    command: Vec<String>,
    model: Option<String>,
    timeout: Duration,
}

impl AgentCommandGenerator {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        model: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        if command.first().map(|c| c.trim().is_empty()).unwrap_or(true) {
            return Err(anyhow!("agent command must not be empty"));
        }
        Ok(Self {
            name: name.into(),
            command,
            model,
            timeout,
        })
    }
}

#[async_trait]
impl Generator for AgentCommandGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<Generation, GeneratorError> {
        let mut cmd = tokio::process::Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).current_dir(request.checkout);
        if let Some(model) = &self.model {
            cmd.env("PATCHBENCH_MODEL", model);
        }

        let output = run_command_async(&mut cmd, Some(request.prompt.as_bytes()), self.timeout)
            .await
            .map_err(|e| anyhow!("{}: {}", self.command[0], e))?;
        if output.timed_out {
            return Err(GeneratorError::TimedOut(self.timeout));
        }

        if let Some(dir) = request.artifact_dir {
            let log = format!("{}\n--- stderr ---\n{}", output.stdout, output.stderr);
            if let Err(err) = std::fs::write(dir.join("agent_output.txt"), log) {
                tracing::debug!(error = %err, "could not store agent output");
            }
        }

        if !output.success() {
            return Err(GeneratorError::Failed(anyhow!(
                "agent failed ({}): {}",
                output
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no status".to_string()),
                output.output_tail(400)
            )));
        }

        let usage = parse_usage_line(&output.stdout);
        let checkout = request.checkout.to_path_buf();
        let diff = tokio::task::spawn_blocking(move || git_ops::working_tree_diff(&checkout))
            .await
            .map_err(|e| anyhow!("diff task failed: {}", e))??;

        Ok(Generation {
            diff: if diff.trim().is_empty() {
                None
            } else {
                Some(diff.into_bytes())
            },
            usage,
        })
    }
}

#[derive(Deserialize, Default)]
struct UsageFields {
    #[serde(default, alias = "input_tokens")]
    prompt_tokens: Option<u64>,
    #[serde(default, alias = "output_tokens")]
    completion_tokens: Option<u64>,
    #[serde(default, alias = "total_cost_usd", alias = "total_cost")]
    cost: Option<f64>,
}

impl UsageFields {
    fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none() && self.cost.is_none()
    }
}

#[derive(Deserialize)]
struct UsageLine {
    #[serde(default)]
    usage: Option<UsageFields>,
    #[serde(flatten)]
    top: UsageFields,
}

/// Usage from the agent's last stdout line, when it reports any.
fn parse_usage_line(stdout: &str) -> Option<Usage> {
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let line: UsageLine = serde_json::from_str(last.trim()).ok()?;
    let nested = line.usage.unwrap_or_default();
    if line.top.is_empty() && nested.is_empty() {
        return None;
    }
    Some(Usage::new(
        line.top.prompt_tokens.or(nested.prompt_tokens).unwrap_or(0),
        line.top
            .completion_tokens
            .or(nested.completion_tokens)
            .unwrap_or(0),
        line.top.cost.or(nested.cost).unwrap_or(0.0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_ops::test_support::setup_repo;

    #[test]
    fn usage_from_flat_line() {
        let out = "working...\n{\"prompt_tokens\": 12, \"completion_tokens\": 3, \"cost\": 0.5}\n";
        let usage = parse_usage_line(out).unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.cost_micros, 500_000);
    }

    #[test]
    fn usage_from_nested_agent_summary() {
        let out = r#"{"type":"result","total_cost_usd":0.25,"usage":{"input_tokens":100,"output_tokens":7}}"#;
        let usage = parse_usage_line(out).unwrap();
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.cost_micros, 250_000);
    }

    #[test]
    fn missing_usage_is_none() {
        assert!(parse_usage_line("").is_none());
        assert!(parse_usage_line("done, patched one file").is_none());
        assert!(parse_usage_line(r#"{"status":"ok"}"#).is_none());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(AgentCommandGenerator::new("a", vec![], None, Duration::from_secs(1)).is_err());
        assert!(
            AgentCommandGenerator::new("a", vec![" ".into()], None, Duration::from_secs(1))
                .is_err()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collects_diff_left_in_checkout() {
        let (_tmp, repo) = setup_repo();
        let script = "cat > /dev/null; echo 'int f(void) { return 2; }' > src/lib.c; \
                      echo '{\"cost\": 0.01}'";
        let generator = AgentCommandGenerator::new(
            "sh-agent",
            vec!["sh".into(), "-c".into(), script.into()],
            None,
            Duration::from_secs(30),
        )
        .unwrap();
        let request = GenerationRequest {
            prompt: "fix it",
            checkout: &repo,
            artifact_dir: None,
        };
        let generation = generator.generate(&request).await.unwrap();
        let diff = String::from_utf8(generation.diff.unwrap()).unwrap();
        assert!(diff.contains("+int f(void) { return 2; }"));
        assert_eq!(generation.usage.unwrap().cost_micros, 10_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn agent_timeout_is_reported() {
        let (_tmp, repo) = setup_repo();
        let generator = AgentCommandGenerator::new(
            "slow",
            vec!["sleep".into(), "30".into()],
            None,
            Duration::from_millis(200),
        )
        .unwrap();
        let request = GenerationRequest {
            prompt: "",
            checkout: &repo,
            artifact_dir: None,
        };
        let err = generator.generate(&request).await.unwrap_err();
        assert!(matches!(err, GeneratorError::TimedOut(_)));
    }
}
