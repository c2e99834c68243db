//! Validation of the relay's JSON request body.

use serde_json::Value;

use super::RelayError;

/// Limits applied to incoming prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    /// Maximum prompt length in characters (Unicode scalar values).
    pub max_prompt_chars: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_prompt_chars: 10_000,
        }
    }
}

/// A validated relay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    /// The prompt, trimmed of surrounding whitespace.
    pub prompt: String,
    /// The prior assistant turn to prepend, if the client sent a non-empty one.
    pub previous_response: Option<String>,
}

impl RelayRequest {
    /// Validates a raw body of the form
    /// `{ "prompt": string, "previousC1Response"?: string }`.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Malformed`] if the body is not JSON at all.
    /// - [`RelayError::Validation`] if the prompt is missing, not a string,
    ///   blank, or longer than `rules.max_prompt_chars`.
    pub fn from_body(body: &[u8], rules: &ValidationRules) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_slice(body)?;

        let prompt = value
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                RelayError::Validation(
                    "Prompt is required and must be a non-empty string.".to_owned(),
                )
            })?;

        if prompt.chars().count() > rules.max_prompt_chars {
            return Err(RelayError::Validation(format!(
                "Prompt is too long. Maximum {} characters allowed.",
                group_thousands(rules.max_prompt_chars)
            )));
        }

        // A non-string or empty prior response is treated as absent.
        let previous_response = value
            .get("previousC1Response")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(str::to_owned);

        Ok(Self {
            prompt: prompt.to_owned(),
            previous_response,
        })
    }
}

/// `10000` → `"10,000"`.
fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
