//! Argument templating and response-field extraction
//!
//! Lifecycle tool arguments are JSON templates whose strings may contain
//! `{{ name }}` placeholders resolved over the instance's creation
//! parameters and runtime service data. A string that is exactly one
//! placeholder splices the raw JSON value (numbers stay numbers); anything
//! else is string interpolation.
//!
//! Response mappings are dotted paths (`result.status`, `items[0].id`)
//! compiled once at class load.

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Resolution context for placeholder lookup
///
/// Lookup order for a bare name: service data, then parameters, then the
/// reserved `label`. The `params.` and `data.` prefixes force a scope.
pub struct TemplateContext {
    label: String,
    params: Map<String, Value>,
    data: Map<String, Value>,
}

impl TemplateContext {
    /// Build a context from an instance's label, frozen parameters, and
    /// current service data rendering
    #[must_use]
    pub fn new(label: &str, params: &Map<String, Value>, data: &Value) -> Self {
        let data = match data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Self {
            label: label.to_string(),
            params: params.clone(),
            data,
        }
    }

    /// Expose the tool-reported service id as `{{ serviceId }}`
    #[must_use]
    pub fn with_service_id(mut self, service_id: Option<&str>) -> Self {
        if let Some(id) = service_id {
            self.data
                .insert("serviceId".to_string(), Value::String(id.to_string()));
        }
        self
    }

    fn resolve(&self, name: &str) -> Option<Value> {
        if name == "label" {
            return Some(Value::String(self.label.clone()));
        }
        if let Some(rest) = name.strip_prefix("params.") {
            return lookup_path(&self.params, rest);
        }
        if let Some(rest) = name.strip_prefix("data.") {
            return lookup_path(&self.data, rest);
        }
        lookup_path(&self.data, name).or_else(|| lookup_path(&self.params, name))
    }
}

fn lookup_path(map: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut current: Option<&Value> = None;
    for (i, segment) in path.split('.').enumerate() {
        current = match (i, current) {
            (0, _) => map.get(segment),
            (_, Some(Value::Object(obj))) => obj.get(segment),
            _ => return None,
        };
        current?;
    }
    current.cloned()
}

/// Render a JSON template against a context
///
/// # Errors
///
/// `Validation` when a placeholder cannot be resolved.
pub fn render(template: &Value, ctx: &TemplateContext) -> Result<Value> {
    match template {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, ctx))
            .collect::<Result<Vec<Value>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), render(value, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, ctx: &TemplateContext) -> Result<Value> {
    // Whole-string placeholder splices the raw value.
    if let Some(name) = sole_placeholder(s) {
        return ctx
            .resolve(name)
            .ok_or_else(|| unresolved(name));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| Error::validation("arguments", format!("unclosed placeholder in '{s}'")))?;
        let name = after[..close].trim();
        let value = ctx.resolve(name).ok_or_else(|| unresolved(name))?;
        match value {
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn unresolved(name: &str) -> Error {
    Error::validation(name, "placeholder not found in parameters or service data")
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    let name = inner.trim();
    if name.is_empty() || name.contains("{{") {
        return None;
    }
    Some(name)
}

/// Collect every placeholder name appearing in a template
#[must_use]
pub fn placeholders(template: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_placeholders(template, &mut names);
    names
}

fn collect_placeholders(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(open) = rest.find("{{") {
                let after = &rest[open + 2..];
                let Some(close) = after.find("}}") else { break };
                names.push(after[..close].trim().to_string());
                rest = &after[close + 2..];
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_placeholders(item, names);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_placeholders(item, names);
            }
        }
        _ => {}
    }
}

// ============================================================================
// Response-field extraction
// ============================================================================

/// One segment of a compiled extraction path
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A dotted extraction path compiled at class load
#[derive(Debug, Clone)]
pub struct FieldPath {
    source: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Compile a dotted path like `result.items[0].id`
    ///
    /// # Errors
    ///
    /// `Validation` on empty segments or malformed index brackets.
    pub fn compile(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            return Err(Error::validation("outputs", "empty extraction path"));
        }
        let mut segments = Vec::new();
        for raw in path.split('.') {
            let mut rest = raw;
            let key_end = rest.find('[').unwrap_or(rest.len());
            let key = &rest[..key_end];
            if key.is_empty() {
                return Err(Error::validation(
                    "outputs",
                    format!("empty segment in path '{path}'"),
                ));
            }
            segments.push(Segment::Key(key.to_string()));
            rest = &rest[key_end..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']').ok_or_else(|| {
                    Error::validation("outputs", format!("unclosed index in path '{path}'"))
                })?;
                let index: usize = stripped[..close].parse().map_err(|_| {
                    Error::validation("outputs", format!("bad index in path '{path}'"))
                })?;
                segments.push(Segment::Index(index));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(Error::validation(
                    "outputs",
                    format!("trailing characters in path '{path}'"),
                ));
            }
        }
        Ok(Self {
            source: path.to_string(),
            segments,
        })
    }

    /// The original path expression
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Extract the addressed value, if present
    #[must_use]
    pub fn extract<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => current.get(key.as_str())?,
                Segment::Index(index) => current.get(index)?,
            };
        }
        Some(current)
    }
}
