use thiserror::Error;

/// Failure taxonomy surfaced by pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("API key not set. Please configure your API key in settings.")]
    Configuration,
    #[error("{0}")]
    Input(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{message}")]
    Extraction { message: String, raw_text: String },
    #[error("render failed: {0}")]
    Render(String),
    #[error("storage failed: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn upstream(err: &anyhow::Error) -> Self {
        PipelineError::Upstream(error_chain_text(err, 600))
    }

    pub fn storage(err: &anyhow::Error) -> Self {
        PipelineError::Storage(error_chain_text(err, 400))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration => "configuration",
            PipelineError::Input(_) => "input",
            PipelineError::Upstream(_) => "upstream",
            PipelineError::Extraction { .. } => "extraction",
            PipelineError::Render(_) => "render",
            PipelineError::Storage(_) => "storage",
        }
    }

    /// Unparsed upstream text kept for diagnosing format drift.
    pub fn raw_text(&self) -> Option<&str> {
        match self {
            PipelineError::Extraction { raw_text, .. } => Some(raw_text.as_str()),
            _ => None,
        }
    }
}

/// Flattens an anyhow chain into one line, skipping repeated causes.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::{error_chain_text, truncate_text, PipelineError};

    #[test]
    fn chain_text_joins_causes_once() {
        let err = Err::<(), _>(anyhow::anyhow!("connection reset"))
            .context("Gemini request failed")
            .unwrap_err();
        assert_eq!(
            error_chain_text(&err, 200),
            "Gemini request failed | caused by: connection reset"
        );
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        assert_eq!(truncate_text("ééééé", 3), "ééé…");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn extraction_errors_expose_raw_text() {
        let err = PipelineError::Extraction {
            message: "no JSON".to_string(),
            raw_text: "I cannot see a cat".to_string(),
        };
        assert_eq!(err.raw_text(), Some("I cannot see a cat"));
        assert_eq!(err.kind(), "extraction");
        assert!(PipelineError::Configuration.raw_text().is_none());
    }
}
