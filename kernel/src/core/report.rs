//! Accumulated output of one step execution.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::digest::sha256_hex;

/// Opaque rendered body plus the client libraries it needs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fragment {
    pub body: String,
    #[serde(default)]
    pub includes: Vec<String>,
}

impl Fragment {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            includes: Vec::new(),
        }
    }

    pub fn with_include(mut self, include: impl Into<String>) -> Self {
        self.includes.push(include.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Report {
    pub body: Vec<String>,
    /// Library include tags, deduplicated in first-seen order.
    pub includes: Vec<String>,
    /// Files written by the step, relative to the step's output directory.
    pub files: Vec<String>,
    pub stdout: String,
    /// Epoch seconds of the last display mutation.
    pub last_update_time: Option<f64>,
}

impl Report {
    pub fn append(&mut self, fragment: Fragment, now: f64) {
        self.body.push(fragment.body);
        for include in fragment.includes {
            self.add_include(include);
        }
        self.last_update_time = Some(now);
    }

    pub fn add_include(&mut self, include: String) {
        if !self.includes.contains(&include) {
            self.includes.push(include);
        }
    }

    pub fn add_file(&mut self, file: String, now: f64) {
        if !self.files.contains(&file) {
            self.files.push(file);
        }
        self.last_update_time = Some(now);
    }

    pub fn append_stdout(&mut self, text: &str, now: f64) {
        if text.is_empty() {
            return;
        }
        self.stdout.push_str(text);
        self.last_update_time = Some(now);
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty() && self.files.is_empty() && self.stdout.is_empty()
    }

    /// Hash over display content only; timestamps excluded.
    pub fn content_hash(&self) -> String {
        let stable = json!({
            "body": self.body,
            "includes": self.includes,
            "files": self.files,
            "stdout": self.stdout,
        });
        sha256_hex(stable.to_string().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_are_deduplicated_in_order() {
        let mut report = Report::default();
        report.append(Fragment::new("<p>a</p>").with_include("plotly"), 1.0);
        report.append(
            Fragment::new("<p>b</p>")
                .with_include("katex")
                .with_include("plotly"),
            2.0,
        );
        assert_eq!(report.includes, vec!["plotly", "katex"]);
        assert_eq!(report.last_update_time, Some(2.0));
    }

    #[test]
    fn content_hash_ignores_update_time() {
        let mut a = Report::default();
        a.append(Fragment::new("x"), 1.0);
        let mut b = Report::default();
        b.append(Fragment::new("x"), 50.0);
        assert_eq!(a.content_hash(), b.content_hash());

        b.append_stdout("more\n", 51.0);
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
