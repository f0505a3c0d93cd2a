//! Input validation for task descriptions and goal success criteria -
//! content that ultimately reaches a remote agent sidecar and, via
//! goal decomposition, HTTP responses and webhook-triggered frames.

use crate::AgentComError;
use html_escape::encode_text;
use regex::Regex;
use std::collections::HashSet;

pub const MAX_TASK_CONTENT_LENGTH: usize = 10_000;
pub const MAX_CONTEXT_KEY_LENGTH: usize = 100;
pub const MAX_CONTEXT_VALUE_LENGTH: usize = 1_000;

static SAFE_TASK_CONTENT_REGEX: &str =
    r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "&&",
    "||",
    ";rm",
    ";del",
    "`rm",
    "`del",
    "$(rm",
    "$(del",
    "';",
    "\";",
    "union select",
    "drop table",
    "delete from",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
    "c:\\windows\\system32",
];

#[derive(Debug, Clone)]
pub struct TaskContentValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl TaskContentValidator {
    pub fn new() -> Result<Self, AgentComError> {
        let safe_content_regex = Regex::new(SAFE_TASK_CONTENT_REGEX)
            .map_err(|e| AgentComError::Configuration(format!("invalid regex pattern: {e}")))?;

        let dangerous_patterns: HashSet<String> = DANGEROUS_PATTERNS
            .iter()
            .map(|s| s.to_lowercase())
            .collect();

        Ok(Self {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    fn check_dangerous(&self, lowered: &str) -> Result<(), AgentComError> {
        for pattern in &self.dangerous_patterns {
            if lowered.contains(pattern) {
                return Err(AgentComError::Validation(
                    "content contains a disallowed pattern".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn validate_and_sanitize_task_content(&self, content: &str) -> Result<String, AgentComError> {
        if content.len() > MAX_TASK_CONTENT_LENGTH {
            return Err(AgentComError::Validation(format!(
                "task content exceeds maximum length of {MAX_TASK_CONTENT_LENGTH} characters"
            )));
        }
        if content.trim().is_empty() {
            return Err(AgentComError::Validation("task content cannot be empty".to_string()));
        }

        self.check_dangerous(&content.to_lowercase())?;

        if !self.safe_content_regex.is_match(content) {
            return Err(AgentComError::Validation(
                "task content contains invalid characters".to_string(),
            ));
        }

        Ok(encode_text(content).to_string())
    }

    pub fn validate_context_key(&self, key: &str) -> Result<(), AgentComError> {
        if key.is_empty() || key.len() > MAX_CONTEXT_KEY_LENGTH {
            return Err(AgentComError::Validation(format!(
                "context key must be non-empty and under {MAX_CONTEXT_KEY_LENGTH} characters"
            )));
        }
        if !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(AgentComError::Validation(
                "context keys can only contain alphanumeric characters and underscores".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_and_sanitize_context_value(&self, value: &str) -> Result<String, AgentComError> {
        if value.len() > MAX_CONTEXT_VALUE_LENGTH {
            return Err(AgentComError::Validation(format!(
                "context value exceeds maximum length of {MAX_CONTEXT_VALUE_LENGTH} characters"
            )));
        }
        self.check_dangerous(&value.to_lowercase())?;
        Ok(encode_text(value).to_string())
    }

    /// Validates a goal's list of success criteria strings the same way
    /// as task content, one entry at a time.
    pub fn validate_success_criteria(&self, criteria: &[String]) -> Result<Vec<String>, AgentComError> {
        criteria
            .iter()
            .map(|c| self.validate_and_sanitize_task_content(c))
            .collect()
    }
}

impl Default for TaskContentValidator {
    fn default() -> Self {
        Self::new().expect("built-in regex pattern is always valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_content() {
        let validator = TaskContentValidator::new().unwrap();
        let result =
            validator.validate_and_sanitize_task_content("Create a hello world function in Rust");
        assert!(result.is_ok());
    }

    #[test]
    fn test_script_injection_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        let result = validator
            .validate_and_sanitize_task_content("Create a function <script>alert('xss')</script>");
        assert!(result.is_err());
    }

    #[test]
    fn test_command_injection_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        let result = validator.validate_and_sanitize_task_content("Create file && rm -rf /");
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_content_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        assert!(validator.validate_and_sanitize_task_content("").is_err());
    }

    #[test]
    fn test_content_length_boundary() {
        let validator = TaskContentValidator::new().unwrap();
        let at_limit = "x".repeat(MAX_TASK_CONTENT_LENGTH);
        assert!(validator.validate_and_sanitize_task_content(&at_limit).is_ok());

        let over_limit = "x".repeat(MAX_TASK_CONTENT_LENGTH + 1);
        assert!(validator.validate_and_sanitize_task_content(&over_limit).is_err());
    }

    #[test]
    fn test_context_key_validation() {
        let validator = TaskContentValidator::new().unwrap();
        for key in ["project_type", "file_path", "language"] {
            assert!(validator.validate_context_key(key).is_ok());
        }
        for key in ["", "key with spaces", "key-with-dashes", "key/with/slashes"] {
            assert!(validator.validate_context_key(key).is_err());
        }
    }

    #[test]
    fn test_success_criteria_rejects_any_dangerous_entry() {
        let validator = TaskContentValidator::new().unwrap();
        let criteria = vec![
            "tests pass".to_string(),
            "<script>alert(1)</script>".to_string(),
        ];
        assert!(validator.validate_success_criteria(&criteria).is_err());
    }

    #[test]
    fn test_success_criteria_accepts_clean_entries() {
        let validator = TaskContentValidator::new().unwrap();
        let criteria = vec!["tests pass".to_string(), "docs updated".to_string()];
        let sanitized = validator.validate_success_criteria(&criteria).unwrap();
        assert_eq!(sanitized.len(), 2);
    }
}
