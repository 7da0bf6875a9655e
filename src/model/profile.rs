//! Context profile: the file/tool scope a phase operates within.

use serde::{Deserialize, Serialize};

/// Declares the schemas, tools, and file globs in scope for a phase.
///
/// Consumed by the decomposer and by context-paging collaborators; the
/// scheduler itself only carries the id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextProfile {
    pub id: String,
    /// Required schema tags.
    #[serde(default)]
    pub schemas: Vec<String>,
    /// Required tool names.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Glob patterns describing files in scope.
    #[serde(default)]
    pub file_patterns: Vec<String>,
}

impl ContextProfile {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_file_patterns(mut self, patterns: Vec<String>) -> Self {
        self.file_patterns = patterns;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_round_trip() {
        let profile = ContextProfile::new("profile_auth")
            .with_file_patterns(vec!["auth/**/*.go".to_string()])
            .with_tools(vec!["test-runner".to_string()]);
        let json = serde_json::to_string(&profile).unwrap();
        let back: ContextProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "profile_auth");
        assert_eq!(back.file_patterns.len(), 1);
    }
}
