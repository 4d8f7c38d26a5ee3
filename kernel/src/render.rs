//! Display layer contract: values in, opaque body fragments out.

use serde_json::Value;

use crate::core::report::Fragment;

/// Turns step display output into fragments for a step report.
pub trait Renderer: Send + Sync {
    fn text(&self, text: &str) -> Fragment;
    fn json(&self, value: &Value) -> Fragment;
    fn markdown(&self, source: &str) -> Fragment;
    fn html(&self, body: &str) -> Fragment;

    /// Dispatch on a display record's `kind` (`text`, `json`, `markdown`, `html`).
    fn display(&self, kind: &str, value: &Value) -> Fragment {
        let as_text = || match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match kind {
            "json" => self.json(value),
            "markdown" => self.markdown(&as_text()),
            "html" => self.html(&as_text()),
            _ => self.text(&as_text()),
        }
    }
}

/// Minimal renderer: escaped text and pretty JSON blocks. Markdown is passed
/// through for client-side rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicRenderer;

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

impl Renderer for BasicRenderer {
    fn text(&self, text: &str) -> Fragment {
        Fragment::new(format!("<pre class=\"kn-text\">{}</pre>", escape_html(text)))
    }

    fn json(&self, value: &Value) -> Fragment {
        let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Fragment::new(format!("<pre class=\"kn-json\">{}</pre>", escape_html(&pretty)))
    }

    fn markdown(&self, source: &str) -> Fragment {
        let body = format!(
            "<div class=\"kn-markdown\" data-source=\"{}\"></div>",
            escape_html(source)
        );
        let fragment = Fragment::new(body).with_include("markdown");
        if source.contains("$$") {
            fragment.with_include("katex")
        } else {
            fragment
        }
    }

    fn html(&self, body: &str) -> Fragment {
        Fragment::new(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_is_escaped() {
        let fragment = BasicRenderer.text("<b>&</b>");
        assert_eq!(
            fragment.body,
            "<pre class=\"kn-text\">&lt;b&gt;&amp;&lt;/b&gt;</pre>"
        );
        assert!(fragment.includes.is_empty());
    }

    #[test]
    fn markdown_with_math_requests_katex() {
        let fragment = BasicRenderer.markdown("$$x^2$$");
        assert_eq!(fragment.includes, vec!["markdown", "katex"]);
    }

    #[test]
    fn display_dispatches_on_kind() {
        let fragment = BasicRenderer.display("json", &json!({"a": 1}));
        assert!(fragment.body.starts_with("<pre class=\"kn-json\">"));
        let fragment = BasicRenderer.display("html", &json!("<p>x</p>"));
        assert_eq!(fragment.body, "<p>x</p>");
    }
}
