//! Pre-admission artifact screening. The deep (LLM-backed) half of the
//! scanner is an external collaborator; the in-tree implementation is the
//! static pattern scan applied before anything touches a compute node.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ScanVerdict {
    pub admitted: bool,
    pub issues: Vec<String>,
}

impl ScanVerdict {
    pub fn admit() -> Self {
        Self {
            admitted: true,
            issues: Vec::new(),
        }
    }

    pub fn reject(issues: Vec<String>) -> Self {
        Self {
            admitted: false,
            issues,
        }
    }
}

#[async_trait]
pub trait ArtifactScanner: Send + Sync {
    async fn scan(&self, artifact: &str, competition: &str) -> ScanVerdict;
}

/// Substring scan for constructs that have no business in a grading
/// submission. Anything matched here rejects outright; subtler cases are
/// the deep scanner's problem.
pub struct StaticScanner {
    rules: Vec<(&'static str, &'static str)>,
}

impl Default for StaticScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticScanner {
    pub fn new() -> Self {
        Self {
            rules: vec![
                ("os.system", "system command execution"),
                ("subprocess", "subprocess execution"),
                ("eval(", "dynamic code evaluation"),
                ("exec(", "dynamic code execution"),
                ("__import__", "dynamic imports"),
                ("socket.", "raw network access"),
                ("urllib", "network access"),
                ("requests.", "network access"),
                ("paramiko", "ssh access"),
                ("ftplib", "ftp access"),
            ],
        }
    }
}

#[async_trait]
impl ArtifactScanner for StaticScanner {
    async fn scan(&self, artifact: &str, competition: &str) -> ScanVerdict {
        let issues: Vec<String> = self
            .rules
            .iter()
            .filter(|(needle, _)| artifact.contains(needle))
            .map(|(needle, reason)| format!("{reason} ({needle})"))
            .collect();
        if issues.is_empty() {
            ScanVerdict::admit()
        } else {
            tracing::warn!(competition, issues = ?issues, "artifact rejected by static scan");
            ScanVerdict::reject(issues)
        }
    }
}
