use crate::error::AnvilError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

/// JSON body of every failed request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

fn hint_for(err: &AnvilError) -> Option<&'static str> {
    match err {
        AnvilError::InvalidTransition { .. } => Some("check the instance status and retry"),
        AnvilError::OperationInProgress { .. } => {
            Some("wait for the running operation or cancel it")
        }
        AnvilError::InstanceRunning { .. } => Some("stop the instance first"),
        AnvilError::InvalidArchiveShape(_) => {
            Some("the archive must contain exactly one top-level directory")
        }
        AnvilError::Spawn(_) => Some("check the launch template and the installed files"),
        _ => None,
    }
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }
}

impl From<&AnvilError> for ErrorPayload {
    fn from(err: &AnvilError) -> Self {
        // Internal errors carry the whole anyhow chain.
        let message = match err {
            AnvilError::Internal(e) => format!("{e:#}"),
            other => other.to_string(),
        };
        Self::new(err.code(), message, hint_for(err).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_truncated_on_a_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let p = ErrorPayload::new("test", long, None);
        assert!(p.message.len() <= MAX_MESSAGE_BYTES);
        assert!(p.message.ends_with("…(truncated)"));
    }

    #[test]
    fn hint_is_truncated() {
        let p = ErrorPayload::new("test", "msg", Some("c".repeat(MAX_HINT_BYTES + 1024)));
        let hint = p.hint.unwrap();
        assert!(hint.len() <= MAX_HINT_BYTES);
        assert!(hint.ends_with("…(truncated)"));
    }

    #[test]
    fn payload_from_error_keeps_code_and_chain() {
        let err = AnvilError::Internal(anyhow::anyhow!("disk full").context("write instance.json"));
        let p = ErrorPayload::from(&err);
        assert_eq!(p.code, "internal");
        assert_eq!(p.message, "write instance.json: disk full");
        assert_eq!(p.hint, None);

        let p = ErrorPayload::from(&AnvilError::NameConflict("world".to_string()));
        assert_eq!(p.code, "name_conflict");

        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("hint").is_none());
    }
}
