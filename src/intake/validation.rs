//! Request validation for the intake surface
//!
//! Collects every offending rule instead of failing on the first, so a
//! client sees the full list in one round trip.

use crate::{constants::MIN_TIMEOUT_MS, ForgeError, Result};
use regex::Regex;

/// Agent type aliases accepted on the wire, with their canonical agent ids.
const KNOWN_AGENT_TYPES: &[(&str, &str)] = &[
    ("web-dev", "web-dev-agent"),
    ("research", "research-agent"),
    ("system", "system-agent"),
    ("web-dev-agent", "web-dev-agent"),
    ("research-agent", "research-agent"),
    ("system-agent", "system-agent"),
];

/// Control characters other than tab/newline are never legitimate input.
const CONTROL_CHAR_PATTERN: &str = r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]";

#[derive(Debug, Clone)]
pub struct RequestValidator {
    max_input_length: usize,
    max_timeout_ms: u64,
    control_chars: Regex,
}

impl RequestValidator {
    pub fn new(max_input_length: usize, max_timeout_ms: u64) -> Result<Self> {
        let control_chars = Regex::new(CONTROL_CHAR_PATTERN)
            .map_err(|e| ForgeError::Configuration(format!("invalid validation pattern: {e}")))?;
        Ok(Self {
            max_input_length,
            max_timeout_ms,
            control_chars,
        })
    }

    /// Validate a submission. Returns every violated rule at once.
    pub fn validate(
        &self,
        input: &str,
        agent: Option<&str>,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let mut errors = Vec::new();

        if input.trim().is_empty() {
            errors.push("input must not be empty".to_string());
        }
        if input.len() > self.max_input_length {
            errors.push(format!(
                "input exceeds maximum length of {} characters",
                self.max_input_length
            ));
        }
        if self.control_chars.is_match(input) {
            errors.push("input contains control characters".to_string());
        }

        if let Some(agent) = agent {
            if canonical_agent_id(agent).is_none() {
                errors.push(format!(
                    "unknown agent type '{agent}' (expected web-dev, research or system)"
                ));
            }
        }

        if let Some(timeout) = timeout_ms {
            if timeout < MIN_TIMEOUT_MS || timeout > self.max_timeout_ms {
                errors.push(format!(
                    "timeout must be between {}ms and {}ms",
                    MIN_TIMEOUT_MS, self.max_timeout_ms
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForgeError::Validation(errors))
        }
    }
}

/// Canonical agent id for an accepted agent type alias.
pub fn canonical_agent_id(agent_type: &str) -> Option<&'static str> {
    KNOWN_AGENT_TYPES
        .iter()
        .find(|(alias, _)| *alias == agent_type)
        .map(|(_, id)| *id)
}
