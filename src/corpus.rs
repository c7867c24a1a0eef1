//! Seed statement corpus for control-vector training

use anyhow::{Context, Result};
use std::path::Path;

/// A pool of neutral factual statements, the raw material the contrastive
/// dataset builder truncates and reframes.
#[derive(Debug, Clone)]
pub struct StatementCorpus {
    statements: Vec<String>,
}

impl StatementCorpus {
    /// Load a corpus from a JSON array of strings.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus file {}", path.display()))?;
        let statements: Vec<String> = serde_json::from_str(&content)
            .with_context(|| format!("Corpus file {} is not a JSON string array", path.display()))?;
        Ok(Self { statements })
    }

    /// Build a corpus from in-memory statements.
    pub fn from_statements(statements: Vec<String>) -> Self {
        Self { statements }
    }

    /// Number of statements.
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Check if the corpus is empty.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// All statements.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_statements() {
        let corpus = StatementCorpus::from_statements(vec![
            "The sky is blue.".to_string(),
            "Water boils at 100 degrees Celsius at sea level.".to_string(),
        ]);
        assert_eq!(corpus.len(), 2);
        assert!(!corpus.is_empty());
    }
}
