//! Minijinja rendering for alert payloads.
//!
//! A job's alert payload is an arbitrary template string, so a fresh
//! [`minijinja::Environment`] is created per render call.

use crate::traits::AlertError;

/// Data available to alert payload templates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertContext {
    pub job: JobContext,
    pub result: ResultContext,
    /// Current timestamp in ISO 8601 format.
    pub now: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobContext {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub method: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResultContext {
    pub status: i32,
    pub message: String,
    pub response_time_ms: u64,
}

/// Renders alert payload templates.
#[derive(Debug, Default)]
pub struct PayloadRenderer {
    _private: (),
}

impl PayloadRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.add_filter("truncate_chars", truncate_chars);
        env
    }

    /// Render `template` with `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Template`] if the template is invalid or
    /// rendering fails.
    pub fn render(&self, template: &str, ctx: &AlertContext) -> Result<String, AlertError> {
        Self::build_env()
            .render_str(template, ctx)
            .map_err(|e| AlertError::Template(e.to_string()))
    }

    /// Render `template`, falling back to the raw text if it does not render.
    pub fn render_or_raw(&self, template: &str, ctx: &AlertContext) -> String {
        match self.render(template, ctx) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::warn!(job_id = %ctx.job.id, error = %e, "alert payload did not render, sending as-is");
                template.to_string()
            }
        }
    }
}

/// Keep at most `n` characters; response bodies can be large.
fn truncate_chars(value: String, n: Option<usize>) -> String {
    let n = n.unwrap_or(200);
    if value.chars().count() <= n {
        value
    } else {
        value.chars().take(n).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AlertContext {
        AlertContext {
            job: JobContext {
                id: "4b0c".into(),
                name: "homepage".into(),
                endpoint: "https://example.com/".into(),
                method: "GET".into(),
            },
            result: ResultContext {
                status: 503,
                message: "upstream unavailable".into(),
                response_time_ms: 42,
            },
            now: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn renders_job_and_result_fields() {
        let out = PayloadRenderer::new()
            .render(
                r#"{"job":"{{ job.name }}","status":{{ result.status }}}"#,
                &ctx(),
            )
            .unwrap();
        assert_eq!(out, r#"{"job":"homepage","status":503}"#);
    }

    #[test]
    fn truncate_filter_shortens_long_messages() {
        let out = PayloadRenderer::new()
            .render("{{ result.message | truncate_chars(8) }}", &ctx())
            .unwrap();
        assert_eq!(out, "upstream...");
    }

    #[test]
    fn plain_text_passes_through() {
        let out = PayloadRenderer::new().render("site is down", &ctx()).unwrap();
        assert_eq!(out, "site is down");
    }

    #[test]
    fn broken_template_falls_back_to_raw() {
        let renderer = PayloadRenderer::new();
        assert!(renderer.render("{{ unclosed", &ctx()).is_err());
        assert_eq!(renderer.render_or_raw("{{ unclosed", &ctx()), "{{ unclosed");
    }
}
