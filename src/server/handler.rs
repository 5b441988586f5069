//! JSON-RPC method handler for the aggregated endpoint
//!
//! Serves `initialize`, `tools/list`, `tools/call`, `resources/list`,
//! `resources/read`, `prompts/list`, and `prompts/get`. Tool calls resolve
//! in order: control-plane tools, ServiceClass operations, then the
//! aggregated upstream catalog.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use crate::MCP_PROTOCOL_VERSION;
use crate::aggregator::Aggregator;
use crate::class::template::{self, TemplateContext};
use crate::class::{ServiceClassDef, ServiceClassManager};
use crate::config::ConfigStore;
use crate::error::rpc_codes;
use crate::orchestrator::Orchestrator;
use crate::protocol::{
    Content, InitializeResult, Info, JsonRpcRequest, JsonRpcResponse, PromptsGetParams,
    ResourcesReadParams, ServerCapabilities, Tool, ToolsCallParams,
};
use crate::server::control;
use crate::{Error, Result};

/// Shared request handler behind the `/message` endpoint
pub struct McpHandler {
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) aggregator: Arc<Aggregator>,
    pub(crate) classes: Arc<ServiceClassManager>,
    pub(crate) config: Arc<ConfigStore>,
}

impl McpHandler {
    /// Wire the handler to the control plane
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        aggregator: Arc<Aggregator>,
        classes: Arc<ServiceClassManager>,
        config: Arc<ConfigStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            aggregator,
            classes,
            config,
        })
    }

    /// Handle one JSON-RPC request, always producing a response
    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        debug!(method = %request.method, id = %id, "Handling request");

        let result = match request.method.as_str() {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.all_tools()})),
            "tools/call" => self.tools_call(request.params).await,
            "resources/list" => Ok(json!({"resources": self.aggregator.catalog().resources()})),
            "resources/read" => self.resources_read(request.params).await,
            "prompts/list" => Ok(json!({"prompts": self.aggregator.catalog().prompts()})),
            "prompts/get" => self.prompts_get(request.params).await,
            other => Err(Error::json_rpc(
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string()),
        }
    }

    fn initialize(&self) -> Value {
        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::aggregator(),
            server_info: Info {
                name: "envctl".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        serde_json::to_value(result).unwrap_or(Value::Null)
    }

    /// Control tools, operations of available classes, then the catalog
    fn all_tools(&self) -> Vec<Tool> {
        let mut tools = control::definitions();
        tools.extend(self.operation_tools());
        tools.extend(self.aggregator.catalog().tools());
        tools
    }

    fn operation_tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        for summary in self.classes.list() {
            if !summary.available {
                continue;
            }
            let Some(class) = self.classes.get(&summary.name) else {
                continue;
            };
            for (op_name, op) in &class.operations {
                tools.push(Tool {
                    name: format!("{}_{op_name}", class.name),
                    description: Some(if op.description.is_empty() {
                        format!("{op_name} operation of class {}", class.name)
                    } else {
                        op.description.clone()
                    }),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "label": {
                                "type": "string",
                                "description": "Target service instance",
                            },
                        },
                        "required": ["label"],
                    }),
                    blocked: false,
                });
            }
        }
        tools
    }

    async fn tools_call(&self, params: Option<Value>) -> Result<Value> {
        let params: ToolsCallParams = parse_params(params)?;
        let args = if params.arguments.is_null() {
            json!({})
        } else {
            params.arguments
        };

        if let Some(result) = control::dispatch(self, &params.name, &args).await {
            // Control tools return bare JSON; wrap it as MCP content.
            return result.map(|value| {
                json!({
                    "content": [Content::text(value.to_string())],
                    "isError": false,
                })
            });
        }

        if let Some((class, op_name)) = self.find_operation(&params.name) {
            return self.run_operation(&class, &op_name, &args).await;
        }

        // Upstream responses stream back verbatim.
        self.aggregator.dispatch(&params.name, args).await
    }

    fn find_operation(&self, tool_name: &str) -> Option<(Arc<ServiceClassDef>, String)> {
        for summary in self.classes.list() {
            let prefix = format!("{}_", summary.name);
            if let Some(op_name) = tool_name.strip_prefix(&prefix) {
                let class = self.classes.get(&summary.name)?;
                if class.operations.contains_key(op_name) {
                    return Some((class, op_name.to_string()));
                }
            }
        }
        None
    }

    async fn run_operation(
        &self,
        class: &ServiceClassDef,
        op_name: &str,
        args: &Value,
    ) -> Result<Value> {
        let op = class
            .operations
            .get(op_name)
            .ok_or_else(|| Error::NotFound(format!("operation {op_name}")))?;
        let label = args
            .get("label")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation("label", "operation requires a target label"))?;

        let record = self.orchestrator.status(label)?;
        if record.class_ref.as_deref() != Some(class.name.as_str()) {
            return Err(Error::validation(
                "label",
                format!("service '{label}' is not an instance of '{}'", class.name),
            ));
        }

        let ctx = TemplateContext::new(
            &record.label,
            &record.creation_parameters,
            &record.data.as_json(),
        )
        .with_service_id(record.service_id.as_deref());
        let mut rendered = match &op.call.arguments {
            Value::Null => json!({}),
            other => template::render(other, &ctx)?,
        };
        // Caller-supplied arguments (minus the routing label) win over the
        // template.
        if let (Value::Object(out), Value::Object(given)) = (&mut rendered, args) {
            for (key, value) in given {
                if key != "label" {
                    out.insert(key.clone(), value.clone());
                }
            }
        }

        self.aggregator.dispatch(&op.call.tool, rendered).await
    }

    async fn resources_read(&self, params: Option<Value>) -> Result<Value> {
        let params: ResourcesReadParams = parse_params(params)?;
        self.aggregator.read_resource(&params.uri).await
    }

    async fn prompts_get(&self, params: Option<Value>) -> Result<Value> {
        let params: PromptsGetParams = parse_params(params)?;
        let args = params
            .arguments
            .map(|map| serde_json::to_value(map))
            .transpose()?;
        self.aggregator.get_prompt(&params.name, args).await
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.unwrap_or(Value::Null);
    serde_json::from_value(params)
        .map_err(|e| Error::json_rpc(rpc_codes::INVALID_PARAMS, format!("Invalid params: {e}")))
}
