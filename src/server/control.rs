//! Control-plane tools
//!
//! The orchestrator's public surface exported as MCP tools on the
//! aggregated endpoint: service lifecycle, MCP server introspection,
//! ServiceClass queries, and configuration access. Every tool returns
//! JSON; failures become JSON-RPC error objects upstream.

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::protocol::Tool;
use crate::server::handler::McpHandler;
use crate::service::ServiceKind;
use crate::{Error, Result};

fn schema(properties: &[(&str, &str, &str)], required: &[&str]) -> Value {
    let props: serde_json::Map<String, Value> = properties
        .iter()
        .map(|(name, ty, description)| {
            (
                (*name).to_string(),
                json!({"type": ty, "description": description}),
            )
        })
        .collect();
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

fn tool(name: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
        blocked: false,
    }
}

/// Definitions of every control-plane tool
#[must_use]
pub fn definitions() -> Vec<Tool> {
    let label = [("label", "string", "Service label")];
    vec![
        tool(
            "service_list",
            "List all services with state and health",
            schema(&[], &[]),
        ),
        tool(
            "service_start",
            "Start a service and its dependencies",
            schema(&label, &["label"]),
        ),
        tool(
            "service_stop",
            "Stop a service and its dependents",
            schema(&label, &["label"]),
        ),
        tool(
            "service_restart",
            "Restart a service",
            schema(&label, &["label"]),
        ),
        tool(
            "service_status",
            "Status of one service",
            schema(&label, &["label"]),
        ),
        tool(
            "mcp_server_list",
            "List managed MCP servers and their aggregation state",
            schema(&[], &[]),
        ),
        tool(
            "mcp_server_info",
            "Details of one managed MCP server",
            schema(&label, &["label"]),
        ),
        tool(
            "mcp_server_tools",
            "Tools a connected MCP server contributes to the catalog",
            schema(
                &[("server_name", "string", "MCP server service label")],
                &["server_name"],
            ),
        ),
        tool(
            "serviceclass_list",
            "List ServiceClasses with availability",
            schema(&[], &[]),
        ),
        tool(
            "serviceclass_get",
            "Full definition of one ServiceClass",
            schema(&[("name", "string", "ServiceClass name")], &["name"]),
        ),
        tool(
            "serviceclass_available",
            "Availability of one ServiceClass",
            schema(&[("name", "string", "ServiceClass name")], &["name"]),
        ),
        tool("config_get", "Current configuration", schema(&[], &[])),
        tool(
            "config_save",
            "Write the current configuration to its YAML file",
            schema(&[], &[]),
        ),
        tool(
            "config_reload",
            "Re-read the configuration from disk",
            schema(&[], &[]),
        ),
    ]
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::validation(key, "required string argument missing"))
}

/// Execute a control tool; `None` when the name is not a control tool
pub async fn dispatch(handler: &McpHandler, name: &str, args: &Value) -> Option<Result<Value>> {
    let result = match name {
        "service_list" => service_list(handler),
        "service_start" => lifecycle_op(handler, args, LifecycleOp::Start).await,
        "service_stop" => lifecycle_op(handler, args, LifecycleOp::Stop).await,
        "service_restart" => lifecycle_op(handler, args, LifecycleOp::Restart).await,
        "service_status" => service_status(handler, args),
        "mcp_server_list" => mcp_server_list(handler),
        "mcp_server_info" => mcp_server_info(handler, args),
        "mcp_server_tools" => mcp_server_tools(handler, args),
        "serviceclass_list" => Ok(json!({"classes": handler.classes.list()})),
        "serviceclass_get" => serviceclass_get(handler, args),
        "serviceclass_available" => serviceclass_available(handler, args),
        "config_get" => Ok(handler.config.as_json()),
        "config_save" => handler
            .config
            .save()
            .map(|path| json!({"saved": true, "path": path})),
        "config_reload" => handler
            .config
            .reload()
            .and_then(|c| serde_json::to_value(c).map_err(Error::from))
            .map(|config| json!({"reloaded": true, "config": config})),
        _ => return None,
    };
    Some(result)
}

enum LifecycleOp {
    Start,
    Stop,
    Restart,
}

async fn lifecycle_op(handler: &McpHandler, args: &Value, op: LifecycleOp) -> Result<Value> {
    let label = required_str(args, "label")?;
    let cancel = CancellationToken::new();
    match op {
        LifecycleOp::Start => handler.orchestrator.start_service(label, &cancel).await?,
        LifecycleOp::Stop => handler.orchestrator.stop_service(label, &cancel).await?,
        LifecycleOp::Restart => handler.orchestrator.restart_service(label, &cancel).await?,
    }
    let record = handler.orchestrator.status(label)?;
    Ok(record.status_json())
}

fn service_list(handler: &McpHandler) -> Result<Value> {
    let services: Vec<Value> = handler
        .orchestrator
        .list()
        .iter()
        .map(crate::service::ServiceRecord::status_json)
        .collect();
    Ok(json!({"services": services}))
}

fn service_status(handler: &McpHandler, args: &Value) -> Result<Value> {
    let label = required_str(args, "label")?;
    Ok(handler.orchestrator.status(label)?.status_json())
}

fn mcp_server_list(handler: &McpHandler) -> Result<Value> {
    let connected = handler.aggregator.upstreams();
    let servers: Vec<Value> = handler
        .orchestrator
        .registry()
        .by_kind(&ServiceKind::McpServer)
        .iter()
        .map(|record| {
            let is_connected = connected
                .iter()
                .any(|(label, up)| *up && label == &record.label);
            let mut status = record.status_json();
            status["aggregated"] = json!(is_connected);
            status
        })
        .collect();
    Ok(json!({"servers": servers}))
}

fn mcp_server_info(handler: &McpHandler, args: &Value) -> Result<Value> {
    let label = required_str(args, "label")?;
    let record = handler.orchestrator.status(label)?;
    if record.kind != ServiceKind::McpServer {
        return Err(Error::validation("label", "service is not an MCP server"));
    }
    let connected = handler
        .aggregator
        .upstreams()
        .iter()
        .any(|(l, up)| *up && l == label);
    let tools = handler.aggregator.catalog().tools_of(label);
    let mut info = record.status_json();
    info["aggregated"] = json!(connected);
    info["toolCount"] = json!(tools.len());
    Ok(info)
}

fn mcp_server_tools(handler: &McpHandler, args: &Value) -> Result<Value> {
    let server = required_str(args, "server_name")?;
    handler.orchestrator.status(server)?;
    let tools = handler.aggregator.catalog().tools_of(server);
    Ok(json!({"server": server, "tools": tools}))
}

fn serviceclass_get(handler: &McpHandler, args: &Value) -> Result<Value> {
    let name = required_str(args, "name")?;
    let def = handler
        .classes
        .get(name)
        .ok_or_else(|| Error::NotFound(format!("service class '{name}'")))?;
    serde_json::to_value(def.as_ref()).map_err(Error::from)
}

fn serviceclass_available(handler: &McpHandler, args: &Value) -> Result<Value> {
    let name = required_str(args, "name")?;
    handler
        .classes
        .get(name)
        .ok_or_else(|| Error::NotFound(format!("service class '{name}'")))?;
    Ok(json!({
        "name": name,
        "available": handler.classes.is_available(name),
        "missingTools": handler.classes.missing_tools(name),
    }))
}
