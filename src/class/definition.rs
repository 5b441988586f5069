//! ServiceClass definition types
//!
//! These map directly to the YAML class definition format. A class binds
//! lifecycle events (start/stop/restart/health-check/status) to aggregator
//! tool calls with argument templates and response-field mappings, and may
//! expose extra named operations as MCP tools.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;
use crate::class::template::{self, FieldPath};
use crate::service::{ServiceData, ServiceKind};

/// A declarative service template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassDef {
    /// Unique class name
    pub name: String,
    /// Class version
    pub version: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Service configuration
    pub service_config: ServiceConfig,
    /// Extra operations exposed as MCP tools
    #[serde(default)]
    pub operations: BTreeMap<String, OperationDef>,
}

/// Service configuration within a class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Built-in kind produced by this class; defaults to a custom kind
    /// named after the class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    /// Services (labels, class names, or kinds) instances depend on
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Template for the instance label when none is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_label: Option<String>,
    /// Prefix for this class's tools in the aggregate namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_prefix: Option<String>,
    /// Lifecycle event bindings
    pub lifecycle_tools: LifecycleTools,
    /// Health-check policy
    #[serde(default)]
    pub health_check: HealthCheckPolicy,
    /// Operation timeouts
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Automatic retry policy for failed starts
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Declared creation parameters
    #[serde(default)]
    pub create_parameters: BTreeMap<String, ParameterDef>,
}

/// Lifecycle event to tool-call bindings; start and stop are mandatory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleTools {
    /// Start binding
    pub start: ToolCall,
    /// Stop binding
    pub stop: ToolCall,
    /// Restart binding; stop-then-start when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<ToolCall>,
    /// Health-check binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<ToolCall>,
    /// Status binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCall>,
}

/// One tool invocation: name, argument template, response-field mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Aggregator tool name
    pub tool: String,
    /// Argument template rendered over parameters and service data
    #[serde(default)]
    pub arguments: Value,
    /// Response mapping: target field name to extraction path
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// A named operation exposed as an MCP tool on available classes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDef {
    /// Operation description
    #[serde(default)]
    pub description: String,
    /// The tool invocation behind the operation
    #[serde(flatten)]
    pub call: ToolCall,
}

/// Health-check scheduling and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckPolicy {
    /// Interval between checks
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive failures before the service is declared unhealthy
    pub failure_threshold: u32,
    /// Consecutive successes (after failure) before healthy again
    pub success_threshold: u32,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 3,
            success_threshold: 1,
        }
    }
}

/// Per-operation timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Start tool timeout
    #[serde(with = "humantime_serde")]
    pub start: Duration,
    /// Stop tool timeout
    #[serde(with = "humantime_serde")]
    pub stop: Duration,
    /// Health-check tool timeout
    #[serde(with = "humantime_serde")]
    pub health_check: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(60),
            stop: Duration::from_secs(30),
            health_check: Duration::from_secs(10),
        }
    }
}

/// Automatic retry policy applied after a failed start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Whether automatic retries are enabled
    pub enabled: bool,
    /// Maximum start attempts per retry cycle
    pub max_attempts: u32,
    /// Delay between attempts
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Declared creation parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDef {
    /// Expected JSON type
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the parameter must be supplied
    #[serde(default)]
    pub required: bool,
    /// Default applied when the parameter is omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Parameter description
    #[serde(default)]
    pub description: String,
}

/// JSON type of a declared parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// JSON string
    String,
    /// JSON number
    Number,
    /// JSON integer
    Integer,
    /// JSON boolean
    Boolean,
    /// JSON object
    Object,
    /// JSON array
    Array,
}

impl ParamType {
    /// Whether a JSON value matches this type
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// Lifecycle events a class can bind tools to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Start the service
    Start,
    /// Stop the service
    Stop,
    /// Restart the service
    Restart,
    /// Probe health
    HealthCheck,
    /// Query status
    Status,
}

impl ServiceClassDef {
    /// Kind of the services this class produces
    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        self.service_config
            .service_type
            .clone()
            .map_or_else(|| ServiceKind::Custom(self.name.clone()), ServiceKind::from)
    }

    /// Tool binding for a lifecycle event
    #[must_use]
    pub fn tool_call(&self, event: LifecycleEvent) -> Option<&ToolCall> {
        let tools = &self.service_config.lifecycle_tools;
        match event {
            LifecycleEvent::Start => Some(&tools.start),
            LifecycleEvent::Stop => Some(&tools.stop),
            LifecycleEvent::Restart => tools.restart.as_ref(),
            LifecycleEvent::HealthCheck => tools.health_check.as_ref(),
            LifecycleEvent::Status => tools.status.as_ref(),
        }
    }

    /// Union of every tool name this class references
    #[must_use]
    pub fn required_tools(&self) -> BTreeSet<String> {
        let tools = &self.service_config.lifecycle_tools;
        let mut set = BTreeSet::new();
        set.insert(tools.start.tool.clone());
        set.insert(tools.stop.tool.clone());
        for opt in [&tools.restart, &tools.health_check, &tools.status] {
            if let Some(call) = opt {
                set.insert(call.tool.clone());
            }
        }
        for op in self.operations.values() {
            set.insert(op.call.tool.clone());
        }
        set
    }

    fn tool_calls(&self) -> Vec<(&'static str, &ToolCall)> {
        let tools = &self.service_config.lifecycle_tools;
        let mut calls = vec![("start", &tools.start), ("stop", &tools.stop)];
        if let Some(call) = &tools.restart {
            calls.push(("restart", call));
        }
        if let Some(call) = &tools.health_check {
            calls.push(("healthCheck", call));
        }
        if let Some(call) = &tools.status {
            calls.push(("status", call));
        }
        calls
    }

    /// Validate the definition, collecting every problem found
    ///
    /// # Errors
    ///
    /// One `Validation` error per problem; an empty `Ok` means the class is
    /// well-formed.
    pub fn validate(&self) -> std::result::Result<(), Vec<Error>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(Error::validation("name", "class name must not be empty"));
        }
        if self.version.trim().is_empty() {
            errors.push(Error::validation("version", "class version must not be empty"));
        }

        for (name, def) in &self.service_config.create_parameters {
            if let Some(default) = &def.default {
                if !def.param_type.accepts(default) {
                    errors.push(Error::validation(
                        name.clone(),
                        "default value does not match declared type",
                    ));
                }
            }
        }

        let kind = self.kind();
        for (event, call) in self.tool_calls() {
            if call.tool.trim().is_empty() {
                errors.push(Error::validation(
                    event,
                    "lifecycle binding must name a tool",
                ));
            }
            self.check_placeholders(event, &call.arguments, &mut errors);
            self.check_outputs(event, call, &kind, &mut errors);
        }

        for (op_name, op) in &self.operations {
            if op.call.tool.trim().is_empty() {
                errors.push(Error::validation(
                    op_name.clone(),
                    "operation must name a tool",
                ));
            }
            self.check_placeholders(op_name, &op.call.arguments, &mut errors);
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn check_placeholders(&self, context: &str, arguments: &Value, errors: &mut Vec<Error>) {
        for name in template::placeholders(arguments) {
            let bare = name
                .strip_prefix("params.")
                .map(|rest| (true, rest))
                .unwrap_or((false, name.as_str()));
            match bare {
                // data.*, label, and serviceId resolve at runtime; only
                // parameter references can be checked statically.
                (false, n) if n == "label" || n == "serviceId" || n.starts_with("data.") => {}
                (forced, n) => {
                    let head = n.split('.').next().unwrap_or(n);
                    let declared = self.service_config.create_parameters.contains_key(head);
                    if forced && !declared {
                        errors.push(Error::validation(
                            format!("{context}.arguments"),
                            format!("placeholder '{name}' references an undeclared parameter"),
                        ));
                    } else if !forced && !declared {
                        // Bare names may also resolve from service data at
                        // runtime, so only flag clearly-static misses where
                        // the kind's data fields are known.
                        if let Some(fields) = ServiceData::known_fields(&self.kind()) {
                            if !fields.contains(&head) {
                                errors.push(Error::validation(
                                    format!("{context}.arguments"),
                                    format!(
                                        "placeholder '{name}' matches neither a declared parameter nor a data field"
                                    ),
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    fn check_outputs(
        &self,
        event: &str,
        call: &ToolCall,
        kind: &ServiceKind,
        errors: &mut Vec<Error>,
    ) {
        for (target, path) in &call.outputs {
            if let Err(e) = FieldPath::compile(path) {
                errors.push(Error::validation(
                    format!("{event}.outputs.{target}"),
                    e.to_string(),
                ));
            }
            if target == "serviceId" || target == "health" {
                continue;
            }
            if let Some(fields) = ServiceData::known_fields(kind) {
                if !fields.contains(&target.as_str()) {
                    errors.push(Error::validation(
                        format!("{event}.outputs.{target}"),
                        format!("'{target}' is not a data field of kind '{kind}'"),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn minimal_class(name: &str) -> ServiceClassDef {
        serde_yaml::from_str(&format!(
            r"
name: {name}
version: '1.0'
description: test class
serviceConfig:
  lifecycleTools:
    start:
      tool: x_start
    stop:
      tool: x_stop
"
        ))
        .unwrap()
    }

    #[test]
    fn yaml_deserializes_full_definition() {
        let yaml = r"
name: port-forward
version: '1.2'
description: kubectl port-forward tunnel
serviceConfig:
  serviceType: port-forward
  dependencies: [kube-connection]
  defaultLabel: 'pf-{{ service }}'
  lifecycleTools:
    start:
      tool: k8s_port_forward
      arguments:
        service: '{{ service }}'
        localPort: '{{ localPort }}'
      outputs:
        localPort: result.localPort
        target: result.target
    stop:
      tool: k8s_stop_forward
      arguments:
        target: '{{ data.target }}'
    healthCheck:
      tool: k8s_check_forward
  healthCheck:
    interval: 15s
    failureThreshold: 5
    successThreshold: 2
  timeouts:
    start: 20s
    stop: 10s
    healthCheck: 5s
  retry:
    enabled: true
    maxAttempts: 4
    backoff: 1s
  createParameters:
    service:
      type: string
      required: true
    localPort:
      type: integer
      required: true
operations:
  describe:
    description: Describe the forward target
    tool: k8s_describe
    arguments:
      target: '{{ data.target }}'
";
        let def: ServiceClassDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.kind(), ServiceKind::PortForward);
        assert_eq!(def.service_config.health_check.failure_threshold, 5);
        assert_eq!(
            def.service_config.timeouts.start,
            Duration::from_secs(20)
        );
        assert!(def.service_config.retry.enabled);
        assert_eq!(
            def.required_tools(),
            ["k8s_port_forward", "k8s_stop_forward", "k8s_check_forward", "k8s_describe"]
                .iter()
                .map(ToString::to_string)
                .collect()
        );
        def.validate().unwrap();
    }

    #[test]
    fn defaults_are_sane() {
        let def = minimal_class("x");
        assert_eq!(def.service_config.timeouts.start, Duration::from_secs(60));
        assert_eq!(def.service_config.health_check.failure_threshold, 3);
        assert!(!def.service_config.retry.enabled);
        assert_eq!(def.kind(), ServiceKind::Custom("x".into()));
    }

    #[test]
    fn missing_stop_tool_fails_deserialization() {
        let yaml = r"
name: broken
version: '1.0'
serviceConfig:
  lifecycleTools:
    start:
      tool: x_start
";
        assert!(serde_yaml::from_str::<ServiceClassDef>(yaml).is_err());
    }

    #[test]
    fn empty_name_collected_as_validation_error() {
        let mut def = minimal_class("x");
        def.name = String::new();
        let errors = def.validate().unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            Error::Validation { field, .. } if field == "name"
        )));
    }

    #[test]
    fn undeclared_param_placeholder_rejected() {
        let mut def = minimal_class("x");
        def.service_config.lifecycle_tools.start.arguments =
            json!({"name": "{{ params.ghost }}"});
        let errors = def.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn bad_output_path_rejected() {
        let mut def = minimal_class("x");
        def.service_config
            .lifecycle_tools
            .start
            .outputs
            .insert("endpoint".into(), "result..x".into());
        assert!(def.validate().is_err());
    }

    #[test]
    fn output_target_checked_against_kind_fields() {
        let mut def = minimal_class("x");
        def.service_config.service_type = Some("mcp-server".into());
        def.service_config
            .lifecycle_tools
            .start
            .outputs
            .insert("bogus".into(), "result.x".into());
        assert!(def.validate().is_err());

        def.service_config.lifecycle_tools.start.outputs.clear();
        def.service_config
            .lifecycle_tools
            .start
            .outputs
            .insert("endpoint".into(), "result.endpoint".into());
        def.service_config
            .lifecycle_tools
            .start
            .outputs
            .insert("serviceId".into(), "result.id".into());
        def.validate().unwrap();
    }

    #[test]
    fn param_type_acceptance() {
        assert!(ParamType::String.accepts(&json!("x")));
        assert!(ParamType::Integer.accepts(&json!(3)));
        assert!(!ParamType::Integer.accepts(&json!(3.5)));
        assert!(ParamType::Number.accepts(&json!(3.5)));
        assert!(ParamType::Boolean.accepts(&json!(true)));
        assert!(ParamType::Object.accepts(&json!({})));
        assert!(!ParamType::Array.accepts(&json!({})));
    }
}
