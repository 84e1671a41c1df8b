//! Templated prompt construction. Each extractor/deduplicator/evaluator
//! call site renders a named template with a small set of named variables
//! rather than hand-concatenating strings, so prompt text can be tuned per
//! org without touching Rust code.

use std::collections::HashMap;

/// A named prompt template with `{{var}}`-style placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub body: String,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self { name: name.into(), body: body.into() }
    }

    /// Substitutes every `{{key}}` occurrence with its value. Unresolved
    /// placeholders are left verbatim so a missing variable is visible in
    /// the rendered prompt rather than silently dropped.
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let mut rendered = self.body.clone();
        for (key, value) in vars {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        }
        rendered
    }
}

/// A small in-process registry of prompt templates, keyed by name.
/// Grounded on the teacher's `engine::traits` adapter style: a thin handle
/// passed through service constructors, not a process-global singleton
/// (spec §9's guidance against singletons applies here too).
#[derive(Debug, Clone, Default)]
pub struct PromptManager {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: PromptTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn render(&self, name: &str, vars: &HashMap<&str, String>) -> Option<String> {
        self.templates.get(name).map(|t| t.render(vars))
    }

    /// The default template set used when an org does not override a
    /// given prompt name.
    pub fn with_defaults() -> Self {
        let mut mgr = Self::new();
        mgr.register(PromptTemplate::new(
            "profile_extraction",
            "Given the following conversation window for user {{user_id}}:\n{{window}}\n\
             Return profiles_to_add, profiles_to_delete (by existing profile_id), and \
             profiles_to_mention.",
        ));
        mgr.register(PromptTemplate::new(
            "profile_dedup",
            "Do these two candidate profile additions describe the same fact?\nA: {{a}}\nB: {{b}}",
        ));
        mgr.register(PromptTemplate::new(
            "feedback_extraction",
            "Given the following conversation window:\n{{window}}\n\
             Extract do_action, do_not_action, when_condition, and an optional blocking_issue.",
        ));
        mgr.register(PromptTemplate::new(
            "feedback_cluster_consolidation",
            "Consolidate the following raw feedback items into one aggregated feedback:\n{{items}}",
        ));
        mgr.register(PromptTemplate::new(
            "evaluation_success_only",
            "Given the request below, judge whether the agent succeeded:\n{{request}}",
        ));
        mgr.register(PromptTemplate::new(
            "evaluation_shadow_comparison",
            "Given the request below with two candidate agent replies, Request A and \
             Request B, judge success of the production reply and compare A against B:\n\
             {{request}}\nRequest A: {{request_a}}\nRequest B: {{request_b}}",
        ));
        mgr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_vars_and_leaves_unknown_ones() {
        let template = PromptTemplate::new("t", "hello {{name}}, missing {{other}}");
        let mut vars = HashMap::new();
        vars.insert("name", "world".to_string());
        assert_eq!(template.render(&vars), "hello world, missing {{other}}");
    }

    #[test]
    fn default_manager_registers_all_call_sites() {
        let mgr = PromptManager::with_defaults();
        for name in [
            "profile_extraction",
            "profile_dedup",
            "feedback_extraction",
            "feedback_cluster_consolidation",
            "evaluation_success_only",
            "evaluation_shadow_comparison",
        ] {
            assert!(mgr.render(name, &HashMap::new()).is_some(), "missing template {name}");
        }
    }
}
