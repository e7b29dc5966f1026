//! In-process tool host.
//!
//! Serves the tool protocol directly from a [`ToolHandler`] object instead of
//! a subprocess. A handler declares its operations through [`ToolHandler::describe`];
//! at registration each declaration is turned into a tool with a JSON input
//! schema, and at call time arguments are validated and coerced against that
//! schema before the operation is invoked.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use super::docstring::parse_doc;
use super::errors::ProxyError;
use super::panic_message;
use super::types::{error_codes, methods, Request, Response, PROTOCOL_VERSION};

// ─── Handler Interface ───────────────────────────────────────────────────────

/// An object whose operations are exposed as tools.
pub trait ToolHandler: Send + Sync {
    /// Backend name; also the name of the endpoint.
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Declared operations. Names starting with `_` and lifecycle
    /// declarations are never exposed.
    fn describe(&self) -> Vec<OperationDecl>;

    /// Run one operation with validated, coerced arguments.
    fn invoke(&self, operation: &str, args: ToolArgs) -> anyhow::Result<Value>;
}

/// Declaration of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub doc: Option<String>,
    /// Construction/teardown hooks of the handler itself.
    pub lifecycle: bool,
}

impl OperationDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            doc: None,
            lifecycle: false,
        }
    }

    pub fn lifecycle(name: &str) -> Self {
        Self {
            lifecycle: true,
            ..Self::new(name)
        }
    }

    /// Required parameter. `type_name` is the declared type, e.g. `i64`,
    /// `str`, `Vec<String>` or `Option<f64>` (which makes it optional).
    pub fn param(mut self, name: &str, type_name: &str) -> Self {
        self.params.push(ParamDecl {
            name: name.to_string(),
            type_name: type_name.to_string(),
            required: true,
            default: None,
        });
        self
    }

    /// Optional parameter filled with `default` when absent.
    pub fn param_with_default(mut self, name: &str, type_name: &str, default: Value) -> Self {
        self.params.push(ParamDecl {
            name: name.to_string(),
            type_name: type_name.to_string(),
            required: false,
            default: Some(default),
        });
        self
    }

    pub fn doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub name: String,
    pub type_name: String,
    pub required: bool,
    pub default: Option<Value>,
}

// ─── Schema ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Integer,
    Number,
    String,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn json_name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Map a declared type to its schema type. The flag is true when the
    /// declaration itself is optional (`Option<T>`, `Optional[T]`).
    pub fn from_declared(type_name: &str) -> Option<(Self, bool)> {
        let t = type_name.trim();
        for (open, close) in [("Option<", ">"), ("Optional[", "]")] {
            if let Some(inner) = t.strip_prefix(open).and_then(|s| s.strip_suffix(close)) {
                return Self::from_declared(inner).map(|(ty, _)| (ty, true));
            }
        }

        let base = t
            .split(['<', '['])
            .next()
            .unwrap_or(t)
            .trim()
            .trim_start_matches('&');
        let ty = match base {
            "int" | "integer" | "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32"
            | "u64" | "usize" => Self::Integer,
            "float" | "number" | "f32" | "f64" => Self::Number,
            "str" | "string" | "String" => Self::String,
            "bool" | "boolean" => Self::Boolean,
            "list" | "List" | "array" | "Vec" | "tuple" => Self::Array,
            "dict" | "Dict" | "object" | "HashMap" | "BTreeMap" | "Map" | "Value" => Self::Object,
            _ => return None,
        };
        Some((ty, false))
    }

    /// Accept `value` for this type, converting losslessly where possible.
    fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    Some(value.clone())
                } else {
                    n.as_f64().and_then(integral_f64).map(Value::from)
                }
            }
            (Self::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Self::Number, Value::Number(_)) => Some(value.clone()),
            (Self::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            (Self::Boolean, Value::Bool(_)) => Some(value.clone()),
            (Self::Boolean, Value::String(s)) => match s.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::String, Value::String(_))
            | (Self::Array, Value::Array(_))
            | (Self::Object, Value::Object(_)) => Some(value.clone()),
            _ => None,
        }
    }
}

fn integral_f64(f: f64) -> Option<i64> {
    let in_range = f >= i64::MIN as f64 && f <= i64::MAX as f64;
    (f.is_finite() && f.fract() == 0.0 && in_range).then_some(f as i64)
}

fn json_type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSchema {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
    pub description: Option<String>,
    pub default: Option<Value>,
}

/// A tool derived from an operation declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSchema>,
}

impl ToolDescriptor {
    fn from_decl(backend: &str, decl: &OperationDecl) -> Result<Self, ProxyError> {
        let doc = decl.doc.as_deref().map(parse_doc).unwrap_or_default();
        let mut seen = HashSet::new();
        let mut params = Vec::with_capacity(decl.params.len());

        for param in &decl.params {
            let schema_error = |reason: String| ProxyError::SchemaError {
                backend: backend.to_string(),
                operation: decl.name.clone(),
                reason,
            };
            if !seen.insert(param.name.as_str()) {
                return Err(schema_error(format!("duplicate parameter '{}'", param.name)));
            }
            let (ty, optional) = ParamType::from_declared(&param.type_name).ok_or_else(|| {
                schema_error(format!(
                    "parameter '{}' has unsupported type '{}'",
                    param.name, param.type_name
                ))
            })?;
            params.push(ParamSchema {
                name: param.name.clone(),
                ty,
                required: param.required && !optional && param.default.is_none(),
                description: doc.params.get(&param.name).cloned(),
                default: param.default.clone(),
            });
        }

        Ok(Self {
            name: decl.name.clone(),
            description: doc.description.unwrap_or_default(),
            params,
        })
    }

    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let mut prop = Map::new();
            prop.insert("type".into(), json!(param.ty.json_name()));
            if let Some(description) = &param.description {
                prop.insert("description".into(), json!(description));
            }
            if let Some(default) = &param.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(json!(param.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Entry in a `tools/list` result.
    pub fn to_tool_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema(),
        })
    }

    /// Validate `arguments` against the schema. Unknown keys are dropped,
    /// defaults applied, and `null` for an optional parameter counts as absent.
    fn bind(&self, arguments: Option<&Value>) -> Result<ToolArgs, String> {
        let empty = Map::new();
        let provided = match arguments {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(format!("arguments must be an object, got {}", json_type_of(other)))
            }
        };

        let mut values = Map::new();
        for param in &self.params {
            match provided.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(format!("missing required parameter '{}'", param.name));
                }
                None | Some(Value::Null) => {
                    if let Some(default) = &param.default {
                        values.insert(param.name.clone(), default.clone());
                    }
                }
                Some(value) => {
                    let coerced = param.ty.coerce(value).ok_or_else(|| {
                        format!(
                            "parameter '{}' expects {}, got {}",
                            param.name,
                            param.ty.json_name(),
                            json_type_of(value)
                        )
                    })?;
                    values.insert(param.name.clone(), coerced);
                }
            }
        }
        Ok(ToolArgs { values })
    }
}

// ─── Arguments ───────────────────────────────────────────────────────────────

/// Validated arguments handed to [`ToolHandler::invoke`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    values: Map<String, Value>,
}

impl ToolArgs {
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Deserialize a required argument.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("missing argument '{name}'"))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("argument '{name}' has the wrong shape: {e}"))
    }

    /// Deserialize an optional argument.
    pub fn get_opt<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(name).map(Some),
        }
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

// ─── ToolHost ────────────────────────────────────────────────────────────────

/// An operation left out of the tool list, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOperation {
    pub operation: String,
    pub reason: String,
}

pub struct ToolHost {
    handler: Arc<dyn ToolHandler>,
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
    rejected: Vec<RejectedOperation>,
}

impl ToolHost {
    /// Derive the tool list from the handler's declarations.
    ///
    /// An operation whose signature cannot be expressed is logged and left
    /// out; empty or duplicate operation names fail the whole registration.
    pub fn register(handler: Arc<dyn ToolHandler>) -> Result<Self, ProxyError> {
        let backend = handler.name().to_string();
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        let mut rejected = Vec::new();

        for decl in handler.describe() {
            if decl.name.trim().is_empty() || !seen.insert(decl.name.clone()) {
                return Err(ProxyError::SchemaError {
                    backend,
                    operation: decl.name,
                    reason: "operation names must be unique and non-empty".into(),
                });
            }
            if decl.lifecycle || decl.name.starts_with('_') {
                tracing::debug!(backend = %backend, operation = %decl.name, "operation not exposed");
                continue;
            }
            match ToolDescriptor::from_decl(&backend, &decl) {
                Ok(tool) => tools.push(tool),
                Err(e) => {
                    tracing::warn!(backend = %backend, error = %e, "skipping operation");
                    rejected.push(RejectedOperation {
                        operation: decl.name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let index = tools
            .iter()
            .enumerate()
            .map(|(i, tool)| (tool.name.clone(), i))
            .collect();
        tracing::info!(
            backend = %backend,
            tools = tools.len(),
            rejected = rejected.len(),
            "in-process tool host ready"
        );

        Ok(Self {
            handler,
            tools,
            index,
            rejected,
        })
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn rejected(&self) -> &[RejectedOperation] {
        &self.rejected
    }

    /// Answer one protocol request. Never panics; failures become error responses.
    pub fn handle(&self, request: &Request) -> Response {
        let id = request.id.clone();
        match request.method.as_str() {
            methods::INITIALIZE => Response::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": self.handler.name(),
                        "version": self.handler.version(),
                    },
                }),
            ),
            methods::PING => Response::success(id, json!({})),
            methods::TOOLS_LIST => {
                let tools: Vec<Value> = self.tools.iter().map(ToolDescriptor::to_tool_json).collect();
                Response::success(id, json!({ "tools": tools }))
            }
            methods::TOOLS_CALL => {
                let Some(tool) = request.tool_name() else {
                    return Response::error(
                        id,
                        error_codes::INVALID_PARAMS,
                        "tools/call requires params.name",
                    );
                };
                match self.call_tool(tool, request.tool_arguments()) {
                    Ok(result) => Response::success(id, text_content(&result)),
                    Err(e) => Response::error(id, e.error_code(), e.to_string()),
                }
            }
            other => Response::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
        }
    }

    /// Validate arguments and invoke the operation.
    pub fn call_tool(&self, tool: &str, arguments: Option<&Value>) -> Result<Value, ProxyError> {
        let descriptor = self.tool(tool).ok_or_else(|| ProxyError::InvalidParams {
            tool: tool.to_string(),
            reason: "unknown tool".into(),
        })?;
        let args = descriptor
            .bind(arguments)
            .map_err(|reason| ProxyError::InvalidParams {
                tool: tool.to_string(),
                reason,
            })?;

        let start = std::time::Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.invoke(tool, args)));
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                tracing::debug!(backend = %self.name(), tool, elapsed_ms, "tool call succeeded");
                Ok(value)
            }
            Ok(Err(e)) => {
                tracing::warn!(backend = %self.name(), tool, elapsed_ms, error = %e, "tool call failed");
                Err(ProxyError::ToolExecutionError {
                    tool: tool.to_string(),
                    reason: format!("{e:#}"),
                })
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(backend = %self.name(), tool, panic = %reason, "tool panicked");
                Err(ProxyError::ToolExecutionError {
                    tool: tool.to_string(),
                    reason,
                })
            }
        }
    }
}

/// Wrap an operation's return value as protocol text content.
fn text_content(result: &Value) -> Value {
    let text = match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({ "content": [{ "type": "text", "text": text }] })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
