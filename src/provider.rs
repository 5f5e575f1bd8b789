use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The provider CLI families the bridge knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Codex,
    Gemini,
}

impl Provider {
    pub fn program(&self) -> &'static str {
        match self {
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    /// Argument vector for one invocation. The prompt always travels on
    /// stdin, never in the argument list.
    pub fn args(&self, model: Option<&str>) -> Vec<String> {
        match self {
            Provider::Codex => {
                let mut args = vec!["exec".to_string()];
                if let Some(model) = model {
                    args.push("-m".to_string());
                    args.push(model.to_string());
                }
                args.push("--json".to_string());
                args.push("--full-auto".to_string());
                args
            }
            Provider::Gemini => {
                let mut args = vec!["--yolo".to_string()];
                if let Some(model) = model {
                    args.push("--model".to_string());
                    args.push(model.to_string());
                }
                args
            }
        }
    }

    /// Extract the agent's response from raw stdout.
    ///
    /// Gemini prints plain text. Codex streams one JSON event per line; the
    /// response is the concatenation of agent-message texts, with the raw
    /// stdout as fallback when no event carried any.
    pub fn parse_response(&self, stdout: &str) -> String {
        match self {
            Provider::Gemini => stdout.trim().to_string(),
            Provider::Codex => parse_codex_stream(stdout),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

fn parse_codex_stream(stdout: &str) -> String {
    let mut parts: Vec<String> = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Undecodable lines are progress noise, not messages.
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("item.completed") => {
                let item = event.get("item");
                let is_agent_message = item
                    .and_then(|i| i.get("type"))
                    .and_then(Value::as_str)
                    == Some("agent_message");
                if is_agent_message
                    && let Some(text) = item.and_then(|i| i.get("text")).and_then(Value::as_str)
                {
                    parts.push(text.to_string());
                }
            }
            Some("message") | Some("output_text") => {
                if let Some(text) = event.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        stdout.to_string()
    } else {
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codex_args_include_model_and_json() {
        assert_eq!(
            Provider::Codex.args(Some("o4")),
            vec!["exec", "-m", "o4", "--json", "--full-auto"]
        );
        assert_eq!(
            Provider::Codex.args(None),
            vec!["exec", "--json", "--full-auto"]
        );
    }

    #[test]
    fn gemini_args_are_yolo_with_optional_model() {
        assert_eq!(Provider::Gemini.args(None), vec!["--yolo"]);
        assert_eq!(
            Provider::Gemini.args(Some("flash")),
            vec!["--yolo", "--model", "flash"]
        );
    }

    #[test]
    fn gemini_response_is_trimmed_stdout() {
        assert_eq!(Provider::Gemini.parse_response("  done \n"), "done");
    }

    #[test]
    fn codex_collects_agent_messages() {
        let stdout = concat!(
            r#"{"type":"item.started","item":{"type":"command_execution"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"first"}}"#,
            "\n",
            "not json at all\n",
            r#"{"type":"item.completed","item":{"type":"command_execution","text":"ls"}}"#,
            "\n",
            r#"{"type":"message","text":"second"}"#,
            "\n",
            r#"{"type":"output_text","text":"third"}"#,
            "\n",
        );
        assert_eq!(Provider::Codex.parse_response(stdout), "first\nsecond\nthird");
    }

    #[test]
    fn codex_falls_back_to_raw_stdout() {
        let stdout = "plain output without events\n";
        assert_eq!(Provider::Codex.parse_response(stdout), stdout);
    }

    #[test]
    fn provider_round_trips_through_serde() {
        let p: Provider = serde_json::from_str(r#""codex""#).unwrap();
        assert_eq!(p, Provider::Codex);
        assert_eq!(serde_json::to_string(&Provider::Gemini).unwrap(), r#""gemini""#);
    }
}
