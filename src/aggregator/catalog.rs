//! Aggregate catalog construction
//!
//! Each connected upstream contributes a slice of tools, resources, and
//! prompts. Rebuilding merges the slices in connection order, namespacing
//! every item with the upstream's prefix. Name collisions resolve
//! first-wins: the earlier entry stays, the later one is dropped with a
//! warning. Snapshots are immutable; readers hold an `Arc` and never block
//! a rebuild.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::aggregator::policy::ToolPolicy;
use crate::protocol::{Prompt, Resource, Tool};

/// A catalog entry mapping one public tool name to its upstream
#[derive(Debug, Clone)]
pub struct ToolCatalogEntry {
    /// Owning upstream label
    pub upstream: String,
    /// Tool name on the upstream (pre-namespacing)
    pub upstream_name: String,
    /// The tool definition, with the public name and blocked flag applied
    pub tool: Tool,
}

/// One upstream's contribution to the catalog
#[derive(Debug, Clone, Default)]
pub struct UpstreamCatalog {
    /// Tools listed by the upstream
    pub tools: Vec<Tool>,
    /// Resources listed by the upstream
    pub resources: Vec<Resource>,
    /// Prompts listed by the upstream
    pub prompts: Vec<Prompt>,
}

/// A catalog entry mapping one public prompt name to its upstream
#[derive(Debug, Clone)]
pub struct PromptCatalogEntry {
    /// Owning upstream label
    pub upstream: String,
    /// Prompt name on the upstream (pre-namespacing)
    pub upstream_name: String,
    /// The prompt definition with the public name applied
    pub prompt: Prompt,
}

/// An immutable merged catalog
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    /// Monotonic rebuild counter
    pub version: u64,
    tools: BTreeMap<String, ToolCatalogEntry>,
    resources: BTreeMap<String, (String, Resource)>,
    prompts: BTreeMap<String, PromptCatalogEntry>,
}

impl CatalogSnapshot {
    /// Merge upstream slices, in connection order, into a new snapshot
    #[must_use]
    pub fn build(
        version: u64,
        slices: &[(String, String, UpstreamCatalog)],
        policy: &ToolPolicy,
    ) -> Self {
        let mut snapshot = Self {
            version,
            ..Self::default()
        };

        for (label, prefix, slice) in slices {
            for tool in &slice.tools {
                let public = format!("{prefix}{}", tool.name);
                if snapshot.tools.contains_key(&public) {
                    warn!(
                        tool = %public,
                        upstream = %label,
                        "Tool name collision, keeping earlier entry"
                    );
                    continue;
                }
                let mut public_tool = tool.clone();
                public_tool.name = public.clone();
                public_tool.blocked = policy.blocks(&public);
                snapshot.tools.insert(
                    public,
                    ToolCatalogEntry {
                        upstream: label.clone(),
                        upstream_name: tool.name.clone(),
                        tool: public_tool,
                    },
                );
            }

            for resource in &slice.resources {
                let public = format!("{prefix}{}", resource.name);
                if snapshot.resources.contains_key(&public) {
                    warn!(
                        resource = %public,
                        upstream = %label,
                        "Resource name collision, keeping earlier entry"
                    );
                    continue;
                }
                let mut public_resource = resource.clone();
                public_resource.name = public.clone();
                snapshot
                    .resources
                    .insert(public, (label.clone(), public_resource));
            }

            for prompt in &slice.prompts {
                let public = format!("{prefix}{}", prompt.name);
                if snapshot.prompts.contains_key(&public) {
                    warn!(
                        prompt = %public,
                        upstream = %label,
                        "Prompt name collision, keeping earlier entry"
                    );
                    continue;
                }
                let mut public_prompt = prompt.clone();
                public_prompt.name = public.clone();
                snapshot.prompts.insert(
                    public,
                    PromptCatalogEntry {
                        upstream: label.clone(),
                        upstream_name: prompt.name.clone(),
                        prompt: public_prompt,
                    },
                );
            }
        }

        snapshot
    }

    /// Resolve a public tool name
    #[must_use]
    pub fn tool(&self, public_name: &str) -> Option<&ToolCatalogEntry> {
        self.tools.get(public_name)
    }

    /// All public tools, name-ordered
    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.values().map(|e| e.tool.clone()).collect()
    }

    /// Public tools contributed by one upstream
    #[must_use]
    pub fn tools_of(&self, upstream: &str) -> Vec<Tool> {
        self.tools
            .values()
            .filter(|e| e.upstream == upstream)
            .map(|e| e.tool.clone())
            .collect()
    }

    /// All public tool names
    #[must_use]
    pub fn tool_names(&self) -> BTreeSet<String> {
        self.tools.keys().cloned().collect()
    }

    /// All public resources, name-ordered
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.values().map(|(_, r)| r.clone()).collect()
    }

    /// Resolve a resource by URI to its owning upstream
    #[must_use]
    pub fn resource_owner(&self, uri: &str) -> Option<&str> {
        self.resources
            .values()
            .find(|(_, r)| r.uri == uri)
            .map(|(upstream, _)| upstream.as_str())
    }

    /// All public prompts, name-ordered
    #[must_use]
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.values().map(|e| e.prompt.clone()).collect()
    }

    /// Resolve a public prompt name
    #[must_use]
    pub fn prompt(&self, public_name: &str) -> Option<&PromptCatalogEntry> {
        self.prompts.get(public_name)
    }

    /// Number of public tools
    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: json!({"type": "object"}),
            blocked: false,
        }
    }

    fn slices() -> Vec<(String, String, UpstreamCatalog)> {
        vec![
            (
                "u1".to_string(),
                "u1_".to_string(),
                UpstreamCatalog {
                    tools: vec![tool("foo"), tool("bar")],
                    ..Default::default()
                },
            ),
            (
                "u2".to_string(),
                "u2_".to_string(),
                UpstreamCatalog {
                    tools: vec![tool("bar"), tool("baz")],
                    ..Default::default()
                },
            ),
        ]
    }

    #[test]
    fn namespacing_prefixes_every_tool() {
        let policy = ToolPolicy::new(false);
        let snapshot = CatalogSnapshot::build(1, &slices(), &policy);
        assert_eq!(
            snapshot.tool_names(),
            ["u1_foo", "u1_bar", "u2_bar", "u2_baz"]
                .iter()
                .map(ToString::to_string)
                .collect()
        );
        let entry = snapshot.tool("u2_baz").unwrap();
        assert_eq!(entry.upstream, "u2");
        assert_eq!(entry.upstream_name, "baz");
    }

    #[test]
    fn collision_first_wins() {
        let policy = ToolPolicy::new(false);
        let mut slices = slices();
        // Same prefix on both upstreams forces a public-name collision.
        slices[0].1 = "x_".to_string();
        slices[1].1 = "x_".to_string();

        let snapshot = CatalogSnapshot::build(1, &slices, &policy);
        // x_bar appears once, owned by the earlier upstream.
        assert_eq!(snapshot.tool("x_bar").unwrap().upstream, "u1");
        assert_eq!(
            snapshot.tool_names(),
            ["x_foo", "x_bar", "x_baz"].iter().map(ToString::to_string).collect()
        );
    }

    #[test]
    fn blocked_flag_follows_policy() {
        let slices = vec![(
            "u1".to_string(),
            "u1_".to_string(),
            UpstreamCatalog {
                tools: vec![tool("delete_stuff"), tool("read_stuff")],
                ..Default::default()
            },
        )];

        let strict = ToolPolicy::new(false);
        let snapshot = CatalogSnapshot::build(1, &slices, &strict);
        assert!(snapshot.tool("u1_delete_stuff").unwrap().tool.blocked);
        assert!(!snapshot.tool("u1_read_stuff").unwrap().tool.blocked);

        let yolo = ToolPolicy::new(true);
        let snapshot = CatalogSnapshot::build(2, &slices, &yolo);
        assert!(!snapshot.tool("u1_delete_stuff").unwrap().tool.blocked);
    }

    #[test]
    fn tools_of_filters_by_upstream() {
        let policy = ToolPolicy::new(false);
        let snapshot = CatalogSnapshot::build(1, &slices(), &policy);
        let u2_tools: Vec<String> = snapshot.tools_of("u2").into_iter().map(|t| t.name).collect();
        assert_eq!(u2_tools, vec!["u2_bar".to_string(), "u2_baz".to_string()]);
    }

    #[test]
    fn namespace_never_exposes_duplicates() {
        let policy = ToolPolicy::new(false);
        let snapshot = CatalogSnapshot::build(1, &slices(), &policy);
        let names: Vec<String> = snapshot.tools().into_iter().map(|t| t.name).collect();
        let unique: BTreeSet<&String> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
    }
}
