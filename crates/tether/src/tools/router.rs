//! Keyword-driven tool subset selection.
//!
//! Sending every tool schema on every turn wastes context and makes weaker
//! models pick the wrong tool. [`ToolRouter`] looks at the raw user message
//! and advertises only a bounded subset:
//!
//! - a baseline of tools that are always included,
//! - every tool in a category whose keywords appear in the message,
//! - a default set when no keyword group matched.
//!
//! Routing only narrows what the model is offered. The conversation loop
//! works the same without a router (the full registry is sent).

use super::core::ToolRegistry;
use super::names;
use crate::ToolDef;
use std::collections::HashSet;

/// Default cap on advertised tools per turn.
pub const DEFAULT_MAX_TOOLS: usize = 8;

/// Keywords that switch on one tool category.
#[derive(Debug, Clone)]
pub struct KeywordGroup {
    /// Registry category this group selects.
    pub category: String,
    /// Lowercase keywords; any substring match in the message activates
    /// the group.
    pub keywords: Vec<String>,
}

impl KeywordGroup {
    pub fn new(category: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            category: category.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// Whether any keyword occurs in the (already lowercased) message.
    pub fn matches(&self, lowered_message: &str) -> bool {
        self.keywords
            .iter()
            .any(|kw| !kw.is_empty() && lowered_message.contains(kw.as_str()))
    }
}

/// Selects which tool definitions to advertise for a user message.
#[derive(Debug, Clone)]
pub struct ToolRouter {
    groups: Vec<KeywordGroup>,
    baseline: Vec<String>,
    default_set: Vec<String>,
    max_tools: usize,
}

impl ToolRouter {
    pub fn new(max_tools: usize) -> Self {
        Self {
            groups: Vec::new(),
            baseline: Vec::new(),
            default_set: Vec::new(),
            max_tools,
        }
    }

    /// Add a keyword group (builder pattern).
    pub fn with_group(mut self, group: KeywordGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Add a keyword group.
    pub fn add_group(&mut self, group: KeywordGroup) {
        self.groups.push(group);
    }

    /// Tools always advertised, ahead of any matched group.
    pub fn with_baseline(mut self, tool_names: &[&str]) -> Self {
        self.baseline
            .extend(tool_names.iter().map(|n| (*n).to_string()));
        self
    }

    /// Tools advertised when no keyword group matched.
    pub fn with_default_set(mut self, tool_names: &[&str]) -> Self {
        self.default_set
            .extend(tool_names.iter().map(|n| (*n).to_string()));
        self
    }

    pub fn max_tools(&self) -> usize {
        self.max_tools
    }

    pub fn groups(&self) -> &[KeywordGroup] {
        &self.groups
    }

    /// Categories whose keywords occur in `message`, in declaration order.
    pub fn matched_categories(&self, message: &str) -> Vec<&str> {
        let lowered = message.to_lowercase();
        self.groups
            .iter()
            .filter(|g| g.matches(&lowered))
            .map(|g| g.category.as_str())
            .collect()
    }

    /// Pick the tool subset for one user message.
    ///
    /// Order is baseline, then matched groups in declaration order (or the
    /// default set when nothing matched). Names are deduplicated, names the
    /// registry does not know are dropped, and the list is capped at
    /// `max_tools`.
    pub fn select(&self, message: &str, registry: &ToolRegistry) -> Vec<ToolDef> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut picked: Vec<String> = Vec::new();
        let mut push = |name: &String, picked: &mut Vec<String>| {
            if registry.contains(name) && seen.insert(name.clone()) {
                picked.push(name.clone());
            }
        };

        for name in &self.baseline {
            push(name, &mut picked);
        }

        let matched = self.matched_categories(message);
        if matched.is_empty() {
            for name in &self.default_set {
                push(name, &mut picked);
            }
        } else {
            for category in matched {
                for name in registry.names_in_category(category) {
                    push(&name, &mut picked);
                }
            }
        }

        picked.truncate(self.max_tools);
        registry.definitions_for(&picked)
    }

    /// Router preloaded with groups for the bundled tools in
    /// [`builtin`](super::builtin).
    pub fn with_builtin_groups(self) -> Self {
        self.with_baseline(&[names::CURRENT_TIME])
            .with_default_set(&[names::CALCULATE])
            .with_group(KeywordGroup::new(
                names::CATEGORY_TIME,
                &["time", "date", "today", "clock", "timezone"],
            ))
            .with_group(KeywordGroup::new(
                names::CATEGORY_MATH,
                &["calculate", "sum", "add", "multiply", "divide", "math", "+", "*"],
            ))
    }
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOOLS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::core::{Tool, ToolFuture};
    use serde_json::json;

    struct Named {
        name: &'static str,
        category: &'static str,
    }

    impl Tool for Named {
        fn definition(&self) -> ToolDef {
            ToolDef::new(self.name, format!("{} tool", self.name), json!({}))
        }
        fn category(&self) -> &str {
            self.category
        }
        fn execute(&self, _arguments: &serde_json::Value) -> ToolFuture<'_> {
            Box::pin(async { Ok(String::new()) })
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        for (name, category) in [
            ("think", "core"),
            ("read_file", "files"),
            ("list_dir", "files"),
            ("grep", "search"),
            ("web_search", "web"),
            ("fetch_url", "web"),
            ("shell", "system"),
        ] {
            r.register(Named { name, category });
        }
        r
    }

    fn names(defs: &[ToolDef]) -> Vec<&str> {
        defs.iter().map(|d| d.name.as_str()).collect()
    }

    fn router() -> ToolRouter {
        ToolRouter::new(8)
            .with_baseline(&["think"])
            .with_default_set(&["read_file", "shell"])
            .with_group(KeywordGroup::new("files", &["file", "directory"]))
            .with_group(KeywordGroup::new("web", &["search the web", "url", "http"]))
    }

    #[test]
    fn keyword_selects_category() {
        let defs = router().select("Please open the FILE config.toml", &registry());
        assert_eq!(names(&defs), vec!["think", "read_file", "list_dir"]);
    }

    #[test]
    fn multiple_groups_keep_declaration_order() {
        let defs = router().select("fetch this url and save it to a file", &registry());
        assert_eq!(
            names(&defs),
            vec!["think", "read_file", "list_dir", "web_search", "fetch_url"]
        );
    }

    #[test]
    fn no_match_falls_back_to_default_set() {
        let defs = router().select("hi there", &registry());
        assert_eq!(names(&defs), vec!["think", "read_file", "shell"]);
    }

    #[test]
    fn cap_limits_selection() {
        let router = ToolRouter::new(2)
            .with_baseline(&["think"])
            .with_group(KeywordGroup::new("web", &["web"]));
        let defs = router.select("web", &registry());
        assert_eq!(names(&defs), vec!["think", "web_search"]);
    }

    #[test]
    fn unknown_names_and_duplicates_dropped() {
        let router = ToolRouter::new(8)
            .with_baseline(&["missing", "read_file"])
            .with_group(KeywordGroup::new("files", &["file"]));
        let defs = router.select("file", &registry());
        assert_eq!(names(&defs), vec!["read_file", "list_dir"]);
    }

    #[test]
    fn matched_categories_are_case_insensitive() {
        let router = router();
        assert_eq!(router.matched_categories("HTTP request"), vec!["web"]);
        assert!(router.matched_categories("nothing relevant").is_empty());
    }
}
