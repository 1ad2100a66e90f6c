//! Demo tool server speaking the protocol over stdin/stdout.
//!
//! Calculator and utility tools, two readable resources and two prompt
//! templates. Used as the process-pipe fixture in integration tests.

use chrono::Local;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use mcp_client::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND, PROTOCOL_VERSION};

const SERVER_NAME: &str = "Simple Example Server";
const INVALID_PARAMS: i64 = -32602;
const RESOURCE_NOT_FOUND: i64 = -32002;

/// Tools per `tools/list` page, small enough that clients must paginate
const PAGE_SIZE: usize = 4;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    // non-protocol chatter on stdout, which clients must tolerate
    stdout.write_all(format!("Starting {}...\n", SERVER_NAME).as_bytes()).await?;
    stdout.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request = match JsonRpcMessage::parse(line) {
            Ok(JsonRpcMessage::Request(request)) => request,
            Ok(_) => continue,
            Err(e) => {
                eprintln!("ignoring malformed input: {}", e);
                continue;
            }
        };

        if request.method == "tools/call" && tool_name(&request) == Some("terminate") {
            eprintln!("terminate requested, exiting without a reply");
            std::process::exit(3);
        }

        let mut reply = serde_json::to_string(&handle(request))?;
        reply.push('\n');
        stdout.write_all(reply.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn handle(request: JsonRpcRequest) -> JsonRpcResponse {
    let params = request.params.clone().unwrap_or_else(|| json!({}));
    let outcome = match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {"listChanged": false},
                "resources": {"subscribe": false, "listChanged": false},
                "prompts": {"listChanged": false}
            },
            "serverInfo": {"name": SERVER_NAME, "version": "1.0.0"},
            "instructions": "Calculator, clock and echo tools."
        })),
        "ping" => Ok(json!({})),
        "tools/list" => list_tools(&params),
        "tools/call" => Ok(call_tool(&params)),
        "resources/list" => Ok(json!({"resources": [
            {"uri": "config://server", "name": "get_server_config", "description": "Get the server configuration.", "mimeType": "application/json"},
            {"uri": "status://health", "name": "get_server_status", "description": "Get the server health status.", "mimeType": "application/json"}
        ]})),
        "resources/read" => read_resource(&params),
        "prompts/list" => Ok(json!({"prompts": [
            prompt_entry("code_review", "Generate a code review prompt."),
            prompt_entry("explain_code", "Generate a code explanation prompt.")
        ]})),
        "prompts/get" => get_prompt(&params),
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {}", other))),
    };

    match outcome {
        Ok(result) => JsonRpcResponse::success(request.id, result),
        Err((code, message)) => JsonRpcResponse::failure(request.id, code, message),
    }
}

fn tool_name(request: &JsonRpcRequest) -> Option<&str> {
    request.params.as_ref()?.get("name")?.as_str()
}

fn tool_catalogue() -> Vec<Value> {
    let pair = |a: &str, b: &str| {
        json!({
            "type": "object",
            "properties": {a: {"type": "number"}, b: {"type": "number"}},
            "required": [a, b]
        })
    };
    vec![
        json!({"name": "add", "description": "Add two numbers together.", "inputSchema": pair("a", "b")}),
        json!({"name": "multiply", "description": "Multiply two numbers together.", "inputSchema": pair("a", "b")}),
        json!({"name": "divide", "description": "Divide two numbers (a / b).", "inputSchema": pair("a", "b")}),
        json!({"name": "power", "description": "Raise base to the power of exponent.", "inputSchema": pair("base", "exponent")}),
        json!({"name": "get_current_time", "description": "Get the current date and time.", "inputSchema": {"type": "object", "properties": {}}}),
        json!({"name": "echo", "description": "Echo back the provided message.", "inputSchema": {
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"]
        }}),
        json!({"name": "terminate", "description": "Stop the server immediately.", "inputSchema": {"type": "object", "properties": {}}}),
    ]
}

fn list_tools(params: &Value) -> Result<Value, (i64, String)> {
    let start = match params.get("cursor").and_then(Value::as_str) {
        Some(cursor) => cursor
            .parse::<usize>()
            .map_err(|_| (INVALID_PARAMS, format!("invalid cursor '{}'", cursor)))?,
        None => 0,
    };
    let tools = tool_catalogue();
    let end = (start + PAGE_SIZE).min(tools.len());
    let page: Vec<Value> = tools.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();

    let mut result = json!({"tools": page});
    if end < tools.len() {
        result["nextCursor"] = json!(end.to_string());
    }
    Ok(result)
}

fn call_tool(params: &Value) -> Value {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let empty = Map::new();
    let args = params.get("arguments").and_then(Value::as_object).unwrap_or(&empty);

    let outcome = match name {
        "add" => binary(args, "a", "b", |a, b| Ok(a + b)),
        "multiply" => binary(args, "a", "b", |a, b| Ok(a * b)),
        "divide" => binary(args, "a", "b", |a, b| {
            if b == 0.0 {
                Err("Cannot divide by zero".to_string())
            } else {
                Ok(a / b)
            }
        }),
        "power" => binary(args, "base", "exponent", |a, b| Ok(a.powf(b))),
        "get_current_time" => Ok(Local::now().to_rfc3339()),
        "echo" => args
            .get("message")
            .and_then(Value::as_str)
            .map(|m| format!("Echo: {}", m))
            .ok_or_else(|| "missing argument 'message'".to_string()),
        other => Err(format!("Unknown tool: {}", other)),
    };

    match outcome {
        Ok(text) => json!({"content": [{"type": "text", "text": text}], "isError": false}),
        Err(message) => json!({"content": [{"type": "text", "text": format!("Error executing tool {}: {}", name, message)}], "isError": true}),
    }
}

fn binary(
    args: &Map<String, Value>,
    left: &str,
    right: &str,
    op: impl Fn(f64, f64) -> Result<f64, String>,
) -> Result<String, String> {
    let number = |key: &str| {
        args.get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| format!("missing numeric argument '{}'", key))
    };
    op(number(left)?, number(right)?).map(format_number)
}

/// Whole numbers print without a fractional part
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn read_resource(params: &Value) -> Result<Value, (i64, String)> {
    let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
    let body = match uri {
        "config://server" => json!({
            "server_name": SERVER_NAME,
            "version": "1.0.0",
            "features": ["calculator", "time", "echo"]
        }),
        "status://health" => json!({
            "status": "healthy",
            "timestamp": Local::now().to_rfc3339(),
            "tools_available": tool_catalogue().len()
        }),
        other => return Err((RESOURCE_NOT_FOUND, format!("Resource not found: {}", other))),
    };
    Ok(json!({"contents": [{
        "uri": uri,
        "mimeType": "application/json",
        "text": serde_json::to_string_pretty(&body).unwrap_or_default()
    }]}))
}

fn prompt_entry(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "arguments": [
            {"name": "code", "required": true},
            {"name": "language", "required": false}
        ]
    })
}

fn get_prompt(params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments");
    let code = args
        .and_then(|a| a.get("code"))
        .and_then(Value::as_str)
        .ok_or_else(|| (INVALID_PARAMS, "missing argument 'code'".to_string()))?;
    let language = args
        .and_then(|a| a.get("language"))
        .and_then(Value::as_str)
        .unwrap_or("python");

    let text = match name {
        "code_review" => format!(
            "Please review the following {language} code:\n\n```{language}\n{code}\n```\n\n\
             Please provide feedback on code quality, potential bugs, performance and security."
        ),
        "explain_code" => format!(
            "Please explain the following {language} code in detail:\n\n```{language}\n{code}\n```\n\n\
             Explain what it does and how it works step by step."
        ),
        other => return Err((INVALID_PARAMS, format!("Unknown prompt: {}", other))),
    };

    Ok(json!({
        "description": format!("{} prompt", name),
        "messages": [{"role": "user", "content": {"type": "text", "text": text}}]
    }))
}
