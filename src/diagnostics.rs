use tracing::warn;

/// Warning sink threaded through every pipeline stage.
///
/// Stages stay pure: anything recoverable is recorded here instead of being
/// logged and forgotten, and the orchestrator copies the deduplicated list
/// into the snapshot metadata.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    warnings: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, needle: &str) -> bool {
        self.warnings.iter().any(|w| w.contains(needle))
    }

    /// Warnings in first-seen order with repeats removed.
    pub fn unique(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.warnings
            .iter()
            .filter(|w| seen.insert(w.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_keeps_first_seen_order() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.warn("b");
        diagnostics.warn("a");
        diagnostics.warn("b");
        assert_eq!(diagnostics.len(), 3);
        assert_eq!(diagnostics.unique(), vec!["b".to_string(), "a".to_string()]);
    }
}
