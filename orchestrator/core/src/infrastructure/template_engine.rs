// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Template Engine
//!
//! Handlebars rendering of step prompts and deterministic `template`
//! transforms. Placeholders resolve against the step inputs, so a step with
//! input `ticket` can use `{{ticket.title}}`.
//!
//! Missing variables render as empty strings and output is not HTML-escaped.

use handlebars::Handlebars;
use serde::Serialize;

use crate::domain::errors::ExecutionError;

pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    pub fn render<T: Serialize>(&self, template: &str, data: &T) -> Result<String, ExecutionError> {
        self.handlebars
            .render_template(template, data)
            .map_err(|e| ExecutionError::validation(format!("failed to render template: {e}")))
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_nested_and_missing() {
        let engine = TemplateEngine::new();
        let data = json!({"ticket": {"title": "Disk <full>"}});
        let out = engine.render("Title: {{ticket.title}} / {{missing}}", &data).unwrap();
        assert_eq!(out, "Title: Disk <full> / ");
    }

    #[test]
    fn test_invalid_template_is_validation_error() {
        let engine = TemplateEngine::new();
        let err = engine.render("{{#if}}", &json!({})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
