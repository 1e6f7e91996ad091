//! Message rendering with `{{variable}}` merge tags.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use drip_core::{SequencerError, SequencerResult};
use drip_sequences::types::StepContent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        subject: &str,
        content: &StepContent,
        vars: &HashMap<String, String>,
    ) -> SequencerResult<RenderedEmail>;
}

/// A stored email body referenced by `StepContent::Template`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub name: String,
    pub html: String,
}

/// Renders inline bodies and registered templates, substituting
/// `{{name}}` tags. Unknown tags render as empty strings.
#[derive(Default)]
pub struct MergeTagRenderer {
    templates: DashMap<Uuid, EmailTemplate>,
}

impl MergeTagRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_template(&self, name: impl Into<String>, html: impl Into<String>) -> Uuid {
        let template = EmailTemplate {
            id: Uuid::new_v4(),
            name: name.into(),
            html: html.into(),
        };
        let id = template.id;
        self.templates.insert(id, template);
        id
    }

    pub fn get_template(&self, id: &Uuid) -> Option<EmailTemplate> {
        self.templates.get(id).map(|t| t.clone())
    }

    fn body(&self, content: &StepContent) -> SequencerResult<String> {
        match content {
            StepContent::Inline { html } => Ok(html.clone()),
            StepContent::Template { template_id } => self
                .templates
                .get(template_id)
                .map(|t| t.html.clone())
                .ok_or_else(|| SequencerError::Render(format!("template {} not found", template_id))),
        }
    }
}

#[async_trait]
impl TemplateRenderer for MergeTagRenderer {
    async fn render(
        &self,
        subject: &str,
        content: &StepContent,
        vars: &HashMap<String, String>,
    ) -> SequencerResult<RenderedEmail> {
        let body = self.body(content)?;
        Ok(RenderedEmail {
            subject: substitute(subject, vars),
            html: substitute(&body, vars),
        })
    }
}

/// Replaces every `{{ name }}` with its value. An unterminated `{{` is
/// copied through as text.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<String, String> {
        HashMap::from([
            ("first_name".to_string(), "Jane".to_string()),
            ("company".to_string(), "Acme Labs".to_string()),
        ])
    }

    #[test]
    fn test_substitute() {
        assert_eq!(
            substitute("Hi {{first_name}} at {{ company }}!", &vars()),
            "Hi Jane at Acme Labs!"
        );
        assert_eq!(substitute("Hi {{missing}}.", &vars()), "Hi .");
        assert_eq!(substitute("Broken {{first_name", &vars()), "Broken {{first_name");
        assert_eq!(substitute("no tags", &vars()), "no tags");
    }

    #[tokio::test]
    async fn test_render_inline_and_template() {
        let renderer = MergeTagRenderer::new();
        let inline = StepContent::Inline {
            html: "<p>Hello {{first_name}}</p>".into(),
        };
        let rendered = renderer
            .render("Welcome, {{first_name}}", &inline, &vars())
            .await
            .unwrap();
        assert_eq!(rendered.subject, "Welcome, Jane");
        assert_eq!(rendered.html, "<p>Hello Jane</p>");

        let id = renderer.register_template("follow-up", "<p>{{company}} samples</p>");
        let rendered = renderer
            .render("Samples", &StepContent::Template { template_id: id }, &vars())
            .await
            .unwrap();
        assert_eq!(rendered.html, "<p>Acme Labs samples</p>");
    }

    #[tokio::test]
    async fn test_missing_template_is_render_error() {
        let renderer = MergeTagRenderer::new();
        let err = renderer
            .render(
                "x",
                &StepContent::Template {
                    template_id: Uuid::new_v4(),
                },
                &vars(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::Render(_)));
        assert!(err.is_transient());
    }
}
