use crate::diff;
use crate::fs;
use crate::protocol::{Request, Response};
use crate::sandbox;
use anyhow::{anyhow, Result};
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info_span, Instrument, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

#[derive(Clone, Debug)]
pub struct Config {
	pub root: PathBuf,
	pub root_canon: PathBuf,
	pub find_limit: Option<usize>,
	pub read_max_bytes: Option<usize>,
	pub read_max_line_bytes: Option<usize>,
	pub search_max_results: Option<usize>,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

pub fn load_config() -> Result<Config> {
	let mut root: Option<String> = None;
	let mut find_limit: Option<usize> = Some(200);
	let mut read_max_bytes: Option<usize> = Some(50 * 1024);
	let mut read_max_line_bytes: Option<usize> = Some(25 * 1024);
	let mut search_max_results: Option<usize> = Some(500);
	let mut otel_enabled = false;
	let mut otel_endpoint = String::from("http://127.0.0.1:4317");
	let mut otel_service_name = String::from("fsops-mcp");
	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--root" => {
				let value = args.next().ok_or_else(|| anyhow!("--root requires a value"))?;
				root = Some(value);
			}
			"--find-limit" => {
				let value = args.next().ok_or_else(|| anyhow!("--find-limit requires a value"))?;
				find_limit = parse_optional_limit(&value, "--find-limit")?;
			}
			"--read-max-bytes" => {
				let value = args.next().ok_or_else(|| anyhow!("--read-max-bytes requires a value"))?;
				read_max_bytes = parse_optional_limit(&value, "--read-max-bytes")?;
			}
			"--read-max-line-bytes" => {
				let value = args.next().ok_or_else(|| anyhow!("--read-max-line-bytes requires a value"))?;
				read_max_line_bytes = parse_optional_limit(&value, "--read-max-line-bytes")?;
			}
			"--search-max-results" => {
				let value = args.next().ok_or_else(|| anyhow!("--search-max-results requires a value"))?;
				search_max_results = parse_optional_limit(&value, "--search-max-results")?;
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				otel_enabled = parse_bool(&value, "--otel-enabled")?;
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				otel_endpoint = value;
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				otel_service_name = value;
			}
			_ => return Err(anyhow!("unknown argument: {}", arg)),
		}
	}
	if root.is_none() {
		if let Ok(env_root) = std::env::var("FSOPS_ROOT") {
			if !env_root.trim().is_empty() {
				root = Some(env_root);
			}
		}
	}
	if let Ok(env_limit) = std::env::var("FSOPS_FIND_LIMIT") {
		if !env_limit.trim().is_empty() {
			find_limit = parse_optional_limit(&env_limit, "FSOPS_FIND_LIMIT")?;
		}
	}
	if let Ok(env_limit) = std::env::var("FSOPS_READ_MAX_BYTES") {
		if !env_limit.trim().is_empty() {
			read_max_bytes = parse_optional_limit(&env_limit, "FSOPS_READ_MAX_BYTES")?;
		}
	}
	if let Ok(env_limit) = std::env::var("FSOPS_READ_MAX_LINE_BYTES") {
		if !env_limit.trim().is_empty() {
			read_max_line_bytes = parse_optional_limit(&env_limit, "FSOPS_READ_MAX_LINE_BYTES")?;
		}
	}
	if let Ok(env_limit) = std::env::var("FSOPS_SEARCH_MAX_RESULTS") {
		if !env_limit.trim().is_empty() {
			search_max_results = parse_optional_limit(&env_limit, "FSOPS_SEARCH_MAX_RESULTS")?;
		}
	}
	if let Ok(env_enabled) = std::env::var("FSOPS_OTEL_ENABLED") {
		if !env_enabled.trim().is_empty() {
			otel_enabled = parse_bool(&env_enabled, "FSOPS_OTEL_ENABLED")?;
		}
	}
	if let Ok(env_endpoint) = std::env::var("FSOPS_OTEL_ENDPOINT") {
		if !env_endpoint.trim().is_empty() {
			otel_endpoint = env_endpoint;
		}
	}
	if let Ok(env_service) = std::env::var("FSOPS_OTEL_SERVICE_NAME") {
		if !env_service.trim().is_empty() {
			otel_service_name = env_service;
		}
	}
	let cwd = std::env::current_dir()?;
	let mut root = PathBuf::from(root.unwrap_or_else(|| cwd.to_string_lossy().to_string()));
	if !root.is_absolute() {
		root = cwd.join(root);
	}
	let root = sandbox::normalize_path(&root);
	let root_canon = if root.exists() {
		root.canonicalize().unwrap_or(root.clone())
	}
	else {
		root.clone()
	};
	Ok(Config {
		root,
		root_canon,
		find_limit,
		read_max_bytes,
		read_max_line_bytes,
		search_max_results,
		otel_enabled,
		otel_endpoint,
		otel_service_name,
		session_id: uuid::Uuid::new_v4().to_string(),
	})
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		opentelemetry::KeyValue::new("mcp.root", config.root.display().to_string()),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok()
			.map(OpenTelemetryLayer::new)
	}
	else {
		None
	};
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, -32700, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		let resp = handle_request(&config, req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

async fn handle_request(config: &Config, req: Request) -> Response {
	let method = req.method.clone();
	let tool_name = extract_tool_name(&method, &req.params);
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %config.session_id,
		"mcp.method" = %method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"mcp.root" = %config.root.display(),
		"mcp.is_error" = tracing::field::Empty,
		"mcp.error_code" = tracing::field::Empty,
		"mcp.count" = tracing::field::Empty,
		"mcp.response_bytes" = tracing::field::Empty,
	);
	match route(config, &req).instrument(span.clone()).await {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(req.id, value)
		}
		Err(err) => {
			if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
				Response::err(req.id, protocol.code, protocol.message.clone())
			}
			else {
				Response::err(req.id, -32000, err.to_string())
			}
		}
	}
}

async fn route(config: &Config, req: &Request) -> Result<Value> {
	match req.method.as_str() {
		"initialize" => Ok(
			json!({
				"serverInfo": {
					"name": "fsops-mcp",
					"version": env!("CARGO_PKG_VERSION")
				},
				"capabilities": {
					"tools": {
						"list": true,
						"call": true
					}
				}
			})
		),
		"tools/list" => Ok(json!({
			"tools": tool_definitions(),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(-32602, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			execute_tool(config, name, &arguments).await
		}
		_ => Err(ProtocolError::new(-32601, "method not found").into()),
	}
}

async fn run_tool<F, Fut>(name: &str, handler: F) -> Value
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Result<Value>>, {
	match handler().await {
		Ok(structured) => tool_success(name, structured),
		Err(err) => tool_error(&err),
	}
}

fn tool_success(name: &str, structured: Value) -> Value {
	let message = tool_message(name, &structured);
	json!({
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

fn tool_error(err: &anyhow::Error) -> Value {
	let message = err.to_string();
	let code = error_code(&message);
	json!({
		"isError": true,
		"structuredContent": {
			"code": code
		},
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

async fn execute_tool(config: &Config, name: &str, arguments: &Value) -> Result<Value> {
	let params = arguments.as_object().ok_or_else(|| ProtocolError::new(-32602, "arguments must be an object"))?;
	let args = Value::Object(params.clone());
	let result = match name {
		"list_files" => run_tool("list_files", || async {
			list_files_tool(config, &args).await
		}).await,
		"stat_items" => run_tool("stat_items", || async {
			stat_items_tool(config, &args).await
		}).await,
		"read_content" => run_tool("read_content", || async {
			read_content_tool(config, &args).await
		}).await,
		"write_content" => run_tool("write_content", || async {
			write_content_tool(config, &args).await
		}).await,
		"move_items" => run_tool("move_items", || async {
			transfer_items_tool(config, &args, Transfer::Move).await
		}).await,
		"copy_items" => run_tool("copy_items", || async {
			transfer_items_tool(config, &args, Transfer::Copy).await
		}).await,
		"delete_items" => run_tool("delete_items", || async {
			delete_items_tool(config, &args).await
		}).await,
		"chmod_items" => run_tool("chmod_items", || async {
			chmod_items_tool(config, &args).await
		}).await,
		"chown_items" => run_tool("chown_items", || async {
			chown_items_tool(config, &args).await
		}).await,
		"search_files" => run_tool("search_files", || async {
			search_files_tool(config, &args).await
		}).await,
		"replace_content" => run_tool("replace_content", || async {
			replace_content_tool(config, &args).await
		}).await,
		"apply_diff" => {
			// Request-shape problems (including duplicate paths) fail the
			// whole call before any file is touched.
			let changes = parse_apply_diff_args(&args)?;
			run_tool("apply_diff", || async {
				apply_diff_tool(config, changes).await
			}).await
		}
		_ => return Err(ProtocolError::new(-32601, "unknown tool").into()),
	};
	Ok(result)
}

fn resolve(config: &Config, user_path: &str) -> Result<PathBuf> {
	sandbox::resolve_path(&config.root, &config.root_canon, user_path).map_err(|err| anyhow!("{}", err))
}

fn item_failure(key: &str, label: &str, error: String) -> Value {
	let code = error_code(&error);
	let mut entry = serde_json::Map::new();
	entry.insert(key.to_string(), Value::String(label.to_string()));
	entry.insert("success".to_string(), Value::Bool(false));
	entry.insert("code".to_string(), Value::String(code.to_string()));
	entry.insert("error".to_string(), Value::String(error));
	Value::Object(entry)
}

fn describe_io_error(action: &str, path: &str, err: &std::io::Error) -> String {
	let reason = match err.kind() {
		std::io::ErrorKind::NotFound => "not found".to_string(),
		std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
		std::io::ErrorKind::InvalidInput => "invalid input".to_string(),
		_ => err.to_string(),
	};
	format!("{} {}: {}", action, path, reason)
}

fn map_anyhow_io(action: &str, path: &str, err: anyhow::Error) -> String {
	if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
		return describe_io_error(action, path, io_err);
	}
	format!("{} {}: {}", action, path, err)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
	value.and_then(Value::as_array)
		.map(
			|items| {
				items.iter()
					.filter_map(|item| item.as_str().map(str::to_string))
					.collect()
			})
		.unwrap_or_default()
}

fn required_paths(args: &Value) -> Result<Vec<String>> {
	let paths = args.get("paths").ok_or_else(|| anyhow!("paths is required"))?.as_array()
		.ok_or_else(|| anyhow!("paths must be an array"))?;
	if paths.is_empty() {
		return Err(anyhow!("paths is empty"));
	}
	Ok(paths.iter()
		.filter_map(|item| item.as_str().map(str::to_string))
		.collect())
}

async fn list_files_tool(config: &Config, args: &Value) -> Result<Value> {
	let pattern = args.get("pattern")
		.and_then(Value::as_str)
		.unwrap_or("");
	let root_param = args.get("root")
		.and_then(Value::as_str)
		.unwrap_or(".");
	let root_path = resolve(config, root_param)?;
	if !root_path.exists() {
		return Err(anyhow!("root not found: {}", root_param));
	}
	let options = fs::ListOptions {
		file_type: args.get("type")
			.and_then(Value::as_str)
			.map(str::to_string),
		max_depth: args.get("max_depth")
			.and_then(Value::as_u64)
			.map(|value| value as usize),
		glob: args.get("glob")
			.and_then(Value::as_bool)
			.unwrap_or(false),
		exclude: string_list(args.get("exclude")),
		limit: parse_limit(args.get("limit"))?.or(config.find_limit),
		offset: args.get("offset")
			.and_then(Value::as_u64)
			.unwrap_or(0) as usize,
	};
	fs::list_dir(
		&root_path,
		&sandbox_label(root_param),
		pattern,
		options
	).await
}

async fn stat_items_tool(config: &Config, args: &Value) -> Result<Value> {
	let paths = required_paths(args)?;
	let mut items = Vec::new();
	let mut all_ok = true;
	for path in &paths {
		let resolved = match resolve(config, path) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, err.to_string()));
				continue;
			}
		};
		match fs::stat_path(&resolved).await {
			Ok(stat) => {
				let mut entry = stat.as_object().cloned().unwrap_or_default();
				entry.insert("path".to_string(), Value::String(path.clone()));
				entry.insert("success".to_string(), Value::Bool(true));
				items.push(Value::Object(entry));
			}
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, map_anyhow_io("stat", path, err)));
			}
		}
	}
	Ok(json!({
		"success": all_ok,
		"results": items
	}))
}

async fn read_content_tool(config: &Config, args: &Value) -> Result<Value> {
	let paths = required_paths(args)?;
	let start_line = args.get("start_line")
		.and_then(Value::as_u64)
		.unwrap_or(1) as usize;
	let limit = parse_limit(args.get("limit"))?.unwrap_or(200);
	let max_total = config.read_max_bytes.unwrap_or(usize::MAX);
	let max_line = config.read_max_line_bytes.unwrap_or(usize::MAX);
	let per_file = if max_total == usize::MAX {
		usize::MAX
	}
	else {
		max_total / paths.len().max(1)
	};
	let mut items = Vec::new();
	let mut all_ok = true;
	for path in &paths {
		let resolved = match resolve(config, path) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, err.to_string()));
				continue;
			}
		};
		match fs::read_slice(
			&resolved,
			start_line,
			limit,
			per_file,
			max_line
		).await {
			Ok(slice) => items.push(json!({
				"path": path,
				"success": true,
				"content": slice.content,
				"count": slice.count,
				"total": slice.total,
				"start_line": start_line,
				"truncated": slice.truncated
			})),
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, map_anyhow_io("read", path, err)));
			}
		}
	}
	Ok(json!({
		"success": all_ok,
		"results": items
	}))
}

async fn write_content_tool(config: &Config, args: &Value) -> Result<Value> {
	let entries = args.get("items").ok_or_else(|| anyhow!("items is required"))?.as_array()
		.ok_or_else(|| anyhow!("items must be an array"))?;
	if entries.is_empty() {
		return Err(anyhow!("items is empty"));
	}
	let mut items = Vec::new();
	let mut all_ok = true;
	for entry in entries {
		let Some(path) = entry.get("path").and_then(Value::as_str) else {
			all_ok = false;
			items.push(item_failure("path", "", "path is required".to_string()));
			continue;
		};
		let Some(content) = entry.get("content").and_then(Value::as_str) else {
			all_ok = false;
			items.push(item_failure("path", path, "content is required".to_string()));
			continue;
		};
		let mode = entry.get("mode")
			.and_then(Value::as_str)
			.unwrap_or("overwrite");
		let resolved = match resolve(config, path) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, err.to_string()));
				continue;
			}
		};
		match fs::write_file(&resolved, content, mode).await {
			Ok(data) => items.push(json!({
				"path": path,
				"success": true,
				"bytes_written": data.get("bytes_written").cloned().unwrap_or(Value::Null),
				"diff": data.get("diff").cloned().unwrap_or(Value::Null)
			})),
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, map_anyhow_io("write", path, err)));
			}
		}
	}
	Ok(json!({
		"success": all_ok,
		"results": items
	}))
}

#[derive(Clone, Copy)]
enum Transfer {
	Move,
	Copy,
}

async fn transfer_items_tool(config: &Config, args: &Value, kind: Transfer) -> Result<Value> {
	let entries = args.get("items").ok_or_else(|| anyhow!("items is required"))?.as_array()
		.ok_or_else(|| anyhow!("items must be an array"))?;
	if entries.is_empty() {
		return Err(anyhow!("items is empty"));
	}
	let action = match kind {
		Transfer::Move => "move",
		Transfer::Copy => "copy",
	};
	let mut items = Vec::new();
	let mut all_ok = true;
	for entry in entries {
		let Some(from) = entry.get("from").and_then(Value::as_str) else {
			all_ok = false;
			items.push(item_failure("from", "", "from is required".to_string()));
			continue;
		};
		let Some(to) = entry.get("to").and_then(Value::as_str) else {
			all_ok = false;
			items.push(item_failure("from", from, "to is required".to_string()));
			continue;
		};
		let resolved_from = match resolve(config, from) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("from", from, err.to_string()));
				continue;
			}
		};
		let resolved_to = match resolve(config, to) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("from", from, err.to_string()));
				continue;
			}
		};
		if matches!(kind, Transfer::Move) && resolved_from == config.root_canon {
			all_ok = false;
			items.push(item_failure("from", from, "cannot move root".to_string()));
			continue;
		}
		let outcome = match kind {
			Transfer::Move => fs::move_path(&resolved_from, &resolved_to).await,
			Transfer::Copy => fs::copy_path(&resolved_from, &resolved_to).await,
		};
		match outcome {
			Ok(()) => items.push(json!({
				"from": from,
				"to": to,
				"success": true
			})),
			Err(err) => {
				all_ok = false;
				items.push(item_failure("from", from, map_anyhow_io(action, from, err)));
			}
		}
	}
	Ok(json!({
		"success": all_ok,
		"results": items
	}))
}

async fn delete_items_tool(config: &Config, args: &Value) -> Result<Value> {
	let paths = required_paths(args)?;
	let mut items = Vec::new();
	let mut all_ok = true;
	for path in &paths {
		let resolved = match resolve(config, path) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, err.to_string()));
				continue;
			}
		};
		if resolved == config.root_canon {
			all_ok = false;
			items.push(item_failure("path", path, "cannot delete root".to_string()));
			continue;
		}
		match fs::delete_path(&resolved).await {
			Ok(()) => items.push(json!({
				"path": path,
				"success": true
			})),
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, map_anyhow_io("delete", path, err)));
			}
		}
	}
	Ok(json!({
		"success": all_ok,
		"results": items
	}))
}

async fn chmod_items_tool(config: &Config, args: &Value) -> Result<Value> {
	let paths = required_paths(args)?;
	let mode = args.get("mode")
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("mode is required"))?;
	let mut items = Vec::new();
	let mut all_ok = true;
	for path in &paths {
		let resolved = match resolve(config, path) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, err.to_string()));
				continue;
			}
		};
		match fs::chmod_path(&resolved, mode).await {
			Ok(()) => items.push(json!({
				"path": path,
				"success": true,
				"mode": mode
			})),
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, map_anyhow_io("chmod", path, err)));
			}
		}
	}
	Ok(json!({
		"success": all_ok,
		"results": items
	}))
}

async fn chown_items_tool(config: &Config, args: &Value) -> Result<Value> {
	let paths = required_paths(args)?;
	let uid = args.get("uid")
		.and_then(Value::as_u64)
		.ok_or_else(|| anyhow!("uid is required"))? as u32;
	let gid = args.get("gid")
		.and_then(Value::as_u64)
		.ok_or_else(|| anyhow!("gid is required"))? as u32;
	let mut items = Vec::new();
	let mut all_ok = true;
	for path in &paths {
		let resolved = match resolve(config, path) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, err.to_string()));
				continue;
			}
		};
		match fs::chown_path(&resolved, uid, gid).await {
			Ok(()) => items.push(json!({
				"path": path,
				"success": true
			})),
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, map_anyhow_io("chown", path, err)));
			}
		}
	}
	Ok(json!({
		"success": all_ok,
		"results": items
	}))
}

async fn search_files_tool(config: &Config, args: &Value) -> Result<Value> {
	let pattern = args.get("pattern")
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("pattern is required"))?;
	let root_param = args.get("root")
		.and_then(Value::as_str)
		.unwrap_or(".");
	let root_path = resolve(config, root_param)?;
	if !root_path.exists() {
		return Err(anyhow!("root not found: {}", root_param));
	}
	let options = fs::SearchOptions {
		glob: string_list(args.get("glob")),
		context: args.get("context")
			.and_then(Value::as_u64)
			.unwrap_or(0) as usize,
		max_results: config.search_max_results,
	};
	fs::search_files(
		&root_path,
		&sandbox_label(root_param),
		pattern,
		options
	).await
}

async fn replace_content_tool(config: &Config, args: &Value) -> Result<Value> {
	let paths = required_paths(args)?;
	let operations = args.get("operations").ok_or_else(|| anyhow!("operations is required"))?.as_array()
		.ok_or_else(|| anyhow!("operations must be an array"))?;
	if operations.is_empty() {
		return Err(anyhow!("operations is empty"));
	}
	let ops = operations.iter()
		.map(
			|op| {
				let search = op.get("search")
					.and_then(Value::as_str)
					.ok_or_else(|| anyhow!("search is required"))?;
				let replace = op.get("replace")
					.and_then(Value::as_str)
					.ok_or_else(|| anyhow!("replace is required"))?;
				let use_regex = op.get("use_regex")
					.and_then(Value::as_bool)
					.unwrap_or(false);
				Ok((search.to_string(), replace.to_string(), use_regex))
			})
		.collect::<Result<Vec<_>>>()?;
	let mut items = Vec::new();
	let mut all_ok = true;
	for path in &paths {
		let resolved = match resolve(config, path) {
			Ok(resolved) => resolved,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, err.to_string()));
				continue;
			}
		};
		let existing = match tokio::fs::read_to_string(&resolved).await {
			Ok(text) => text,
			Err(err) => {
				all_ok = false;
				items.push(item_failure("path", path, describe_io_error("read", path, &err)));
				continue;
			}
		};
		let mut updated = existing.clone();
		let mut replacements = 0usize;
		let mut failed = false;
		for (search, replace, use_regex) in &ops {
			match fs::replace_in_content(&updated, search, replace, *use_regex) {
				Ok((next, count)) => {
					updated = next;
					replacements += count;
				}
				Err(err) => {
					all_ok = false;
					failed = true;
					items.push(item_failure("path", path, err.to_string()));
					break;
				}
			}
		}
		if failed {
			continue;
		}
		if updated != existing {
			if let Err(err) = tokio::fs::write(&resolved, &updated).await {
				all_ok = false;
				items.push(item_failure("path", path, describe_io_error("write", path, &err)));
				continue;
			}
		}
		items.push(json!({
			"path": path,
			"success": true,
			"replacements": replacements,
			"diff": fs::make_diff(&existing, &updated, std::path::Path::new(path))
		}));
	}
	Ok(json!({
		"success": all_ok,
		"results": items
	}))
}

fn parse_apply_diff_args(args: &Value) -> Result<Vec<(String, Value)>> {
	let changes = args.get("changes")
		.ok_or_else(|| ProtocolError::new(-32602, "changes is required"))?;
	let changes = changes.as_array()
		.ok_or_else(|| ProtocolError::new(-32602, "changes must be an array"))?;
	if changes.is_empty() {
		return Err(ProtocolError::new(-32602, "changes is empty").into());
	}
	let mut seen = BTreeSet::new();
	let mut parsed = Vec::new();
	for change in changes {
		let obj = change.as_object()
			.ok_or_else(|| ProtocolError::new(-32602, "each change must be an object"))?;
		let path = obj.get("path")
			.and_then(Value::as_str)
			.ok_or_else(|| ProtocolError::new(-32602, "change.path is required"))?;
		let diffs = obj.get("diffs")
			.cloned()
			.ok_or_else(|| ProtocolError::new(-32602, "change.diffs is required"))?;
		if !seen.insert(path.to_string()) {
			return Err(ProtocolError::new(-32602, format!("duplicate path in changes: {}", path)).into());
		}
		parsed.push((path.to_string(), diffs));
	}
	Ok(parsed)
}

/// Applies each file's diff batch as an independent task. Results come back
/// in request order regardless of completion order, and a panicked task turns
/// into that file's failure entry instead of taking the request down.
async fn apply_diff_tool(config: &Config, changes: Vec<(String, Value)>) -> Result<Value> {
	let mut handles = Vec::new();
	for (path, diffs) in &changes {
		let root = config.root.clone();
		let root_canon = config.root_canon.clone();
		let path = path.clone();
		let diffs = diffs.clone();
		handles.push(tokio::spawn(
			async move {
				apply_file_diff(
					&root,
					&root_canon,
					&path,
					&diffs
				).await
			}
		));
	}
	let mut results = Vec::new();
	let mut all_ok = true;
	for (handle, (path, _)) in handles.into_iter().zip(changes.iter()) {
		let entry = match handle.await {
			Ok(entry) => entry,
			Err(err) => item_failure("path", path, format!("task failed: {}", err)),
		};
		if entry.get("success").and_then(Value::as_bool) != Some(true) {
			all_ok = false;
		}
		results.push(entry);
	}
	Ok(json!({
		"success": all_ok,
		"results": results
	}))
}

async fn apply_file_diff(root: &PathBuf, root_canon: &PathBuf, path: &str, diffs: &Value) -> Value {
	let resolved = match sandbox::resolve_path(root, root_canon, path) {
		Ok(resolved) => resolved,
		Err(err) => return item_failure("path", path, err.to_string()),
	};
	let existing = match tokio::fs::read_to_string(&resolved).await {
		Ok(text) => text,
		Err(err) => return item_failure("path", path, describe_io_error("read", path, &err)),
	};
	let outcome = diff::apply_diffs(&existing, diffs);
	let diff_results = serde_json::to_value(&outcome.diff_results).unwrap_or(Value::Null);
	if !outcome.success {
		let mut entry = serde_json::Map::new();
		entry.insert("path".to_string(), Value::String(path.to_string()));
		entry.insert("success".to_string(), Value::Bool(false));
		if let Some(error) = outcome.error {
			entry.insert("code".to_string(), Value::String(error_code(&error).to_string()));
			entry.insert("error".to_string(), Value::String(error));
		}
		if let Some(context) = outcome.context {
			entry.insert("context".to_string(), Value::String(context));
		}
		entry.insert("diff_results".to_string(), diff_results);
		return Value::Object(entry);
	}
	let Some(new_content) = outcome.new_content else {
		return item_failure("path", path, "diff succeeded without content".to_string());
	};
	if let Err(err) = tokio::fs::write(&resolved, &new_content).await {
		return item_failure("path", path, describe_io_error("write", path, &err));
	}
	json!({
		"path": path,
		"success": true,
		"diff_results": diff_results
	})
}

fn sandbox_label(root_param: &str) -> String {
	if root_param.trim().is_empty() {
		return ".".to_string();
	}
	sandbox::normalize_path(std::path::Path::new(root_param))
		.to_string_lossy()
		.to_string()
}

fn tool_message(name: &str, structured: &Value) -> String {
	match name {
		"list_files" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			let truncated = structured.get("truncated")
				.and_then(Value::as_bool)
				.unwrap_or(false);
			if truncated {
				format!("Found {} file(s). Results truncated.", count)
			}
			else {
				format!("Found {} file(s).", count)
			}
		}
		"search_files" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			let total = get_u64(structured, "total_matches").unwrap_or(0);
			format!("Found {} match(es) across {} file(s).", total, count)
		}
		"stat_items" => batch_message("Described", structured),
		"read_content" => batch_message("Read", structured),
		"write_content" => batch_message("Wrote", structured),
		"move_items" => batch_message("Moved", structured),
		"copy_items" => batch_message("Copied", structured),
		"delete_items" => batch_message("Deleted", structured),
		"chmod_items" => batch_message("Changed mode on", structured),
		"chown_items" => batch_message("Changed owner on", structured),
		"replace_content" => batch_message("Replaced in", structured),
		"apply_diff" => batch_message("Applied diffs to", structured),
		_ => "Completed tool call.".to_string(),
	}
}

fn batch_message(verb: &str, structured: &Value) -> String {
	let results = structured.get("results")
		.and_then(Value::as_array)
		.cloned()
		.unwrap_or_default();
	let total = results.len();
	let ok = results.iter()
		.filter(|entry| entry.get("success").and_then(Value::as_bool) == Some(true))
		.count();
	if ok == total {
		format!("{} {} item(s).", verb, total)
	}
	else {
		format!("{} {} of {} item(s).", verb, ok, total)
	}
}

fn get_u64(value: &Value, key: &str) -> Option<u64> {
	value.get(key).and_then(Value::as_u64)
}

fn error_code(message: &str) -> &'static str {
	let lower = message.to_lowercase();
	if lower.contains("path is required") {
		"MISSING_PATH"
	}
	else if lower.contains("path is empty") {
		"MISSING_PATH"
	}
	else if lower.contains("paths is required") || lower.contains("paths must be an array") || lower.contains("paths is empty") {
		"INVALID_PATHS"
	}
	else if lower.contains("pattern is required") {
		"MISSING_PATTERN"
	}
	else if lower.contains("content is required") {
		"MISSING_CONTENT"
	}
	else if lower.contains("mode is required") || lower.contains("invalid mode") || lower.contains("mode must be") {
		"INVALID_MODE"
	}
	else if lower.contains("uid is required") || lower.contains("gid is required") {
		"MISSING_OWNER"
	}
	else if lower.contains("search is required") || lower.contains("search text is empty") {
		"MISSING_SEARCH"
	}
	else if lower.contains("replace is required") {
		"MISSING_REPLACE"
	}
	else if lower.contains("operations is required") || lower.contains("operations must be an array") || lower.contains("operations is empty") {
		"INVALID_OPERATIONS"
	}
	else if lower.contains("from is required") {
		"MISSING_FROM"
	}
	else if lower.contains("to is required") {
		"MISSING_TO"
	}
	else if lower.contains("items is required") || lower.contains("items must be an array") || lower.contains("items is empty") {
		"INVALID_ITEMS"
	}
	else if lower.contains("target exists") {
		"TARGET_EXISTS"
	}
	else if lower.contains("cannot delete root") {
		"DELETE_ROOT_DENIED"
	}
	else if lower.contains("cannot move root") {
		"MOVE_ROOT_DENIED"
	}
	else if lower.contains("absolute paths not allowed") {
		"ABSOLUTE_PATH_NOT_ALLOWED"
	}
	else if lower.contains("path outside root") {
		"PATH_OUTSIDE_ROOT"
	}
	else if lower.contains("invalid glob") {
		"INVALID_GLOB"
	}
	else if lower.contains("invalid pattern") {
		"INVALID_PATTERN"
	}
	else if lower.contains("some diffs failed") || lower.contains("diffs must be an array") {
		"DIFF_FAILED"
	}
	else if lower.contains("not found") || lower.contains("no such file") {
		"FILE_NOT_FOUND"
	}
	else if lower.contains("permission denied") {
		"PERMISSION_DENIED"
	}
	else {
		"EXECUTION_ERROR"
	}
}

fn tool_definitions() -> Vec<Value> {
	vec![
	json!({
		"name": "list_files",
		"description": "list files and directories under the sandbox root",
		"inputSchema": {
			"type": "object",
			"properties": {
				"root": { "type": "string", "description": "Directory to list, relative to the sandbox root. Default: '.'" },
				"pattern": { "type": "string", "description": "Name pattern. Regex by default; glob when glob=true. Default: match all." },
				"glob": { "type": "boolean", "description": "Interpret pattern as a glob instead of a regex." },
				"type": { "type": "string", "enum": ["file", "dir", "symlink"], "description": "Filter by entry type." },
				"max_depth": { "type": "integer", "minimum": 0, "description": "Maximum directory depth to traverse." },
				"exclude": { "type": "array", "items": { "type": "string" }, "description": "Glob patterns to exclude from results." },
				"limit": { "type": "integer", "minimum": 1, "description": "Maximum number of results." },
				"offset": { "type": "integer", "minimum": 0, "description": "Results to skip before returning." }
			}
		}
	}),
	json!({
		"name": "stat_items",
		"description": "stat one or more paths (size, kind, mode, owner, timestamps)",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": { "type": "array", "items": { "type": "string" }, "description": "Paths relative to the sandbox root." }
			},
			"required": ["paths"]
		}
	}),
	json!({
		"name": "read_content",
		"description": "read one or more text files with line numbers",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": { "type": "array", "items": { "type": "string" }, "description": "Paths relative to the sandbox root." },
				"start_line": { "type": "integer", "minimum": 1, "description": "1-based first line to return. Default: 1." },
				"limit": { "type": "integer", "minimum": 1, "description": "Maximum number of lines per file. Default: 200." }
			},
			"required": ["paths"]
		}
	}),
	json!({
		"name": "write_content",
		"description": "write, append, or prepend content to one or more files",
		"inputSchema": {
			"type": "object",
			"properties": {
				"items": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"path": { "type": "string" },
							"content": { "type": "string" },
							"mode": { "type": "string", "enum": ["overwrite", "append", "prepend"], "description": "Default: overwrite." }
						},
						"required": ["path", "content"]
					}
				}
			},
			"required": ["items"]
		}
	}),
	json!({
		"name": "move_items",
		"description": "move/rename files or directories (fails if destination exists)",
		"inputSchema": {
			"type": "object",
			"properties": {
				"items": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"from": { "type": "string" },
							"to": { "type": "string" }
						},
						"required": ["from", "to"]
					}
				}
			},
			"required": ["items"]
		}
	}),
	json!({
		"name": "copy_items",
		"description": "copy files or directories, preserving permissions and timestamps",
		"inputSchema": {
			"type": "object",
			"properties": {
				"items": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"from": { "type": "string" },
							"to": { "type": "string" }
						},
						"required": ["from", "to"]
					}
				}
			},
			"required": ["items"]
		}
	}),
	json!({
		"name": "delete_items",
		"description": "delete files or directories recursively",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": { "type": "array", "items": { "type": "string" }, "description": "Paths relative to the sandbox root." }
			},
			"required": ["paths"]
		}
	}),
	json!({
		"name": "chmod_items",
		"description": "change permissions on one or more paths",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": { "type": "array", "items": { "type": "string" } },
				"mode": { "type": "string", "description": "Octal mode string, e.g. '644' or '0755'." }
			},
			"required": ["paths", "mode"]
		}
	}),
	json!({
		"name": "chown_items",
		"description": "change owner and group on one or more paths",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": { "type": "array", "items": { "type": "string" } },
				"uid": { "type": "integer", "minimum": 0 },
				"gid": { "type": "integer", "minimum": 0 }
			},
			"required": ["paths", "uid", "gid"]
		}
	}),
	json!({
		"name": "search_files",
		"description": "search file contents with a regex",
		"inputSchema": {
			"type": "object",
			"properties": {
				"pattern": { "type": "string", "description": "Regex pattern. Smart-case: lowercase patterns match case-insensitively." },
				"root": { "type": "string", "description": "Directory to search, relative to the sandbox root. Default: '.'" },
				"glob": { "type": "array", "items": { "type": "string" }, "description": "File globs to include." },
				"context": { "type": "integer", "minimum": 0, "description": "Lines of context around each match." }
			},
			"required": ["pattern"]
		}
	}),
	json!({
		"name": "replace_content",
		"description": "search and replace text across one or more files",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": { "type": "array", "items": { "type": "string" } },
				"operations": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"search": { "type": "string" },
							"replace": { "type": "string" },
							"use_regex": { "type": "boolean", "description": "Interpret search as a regex. Default: false." }
						},
						"required": ["search", "replace"]
					}
				}
			},
			"required": ["paths", "operations"]
		}
	}),
	json!({
		"name": "apply_diff",
		"description": "apply line-range search/replace diff blocks to one or more files atomically per file",
		"inputSchema": {
			"type": "object",
			"properties": {
				"changes": {
					"type": "array",
					"description": "One entry per file; paths must be unique within a request.",
					"items": {
						"type": "object",
						"properties": {
							"path": { "type": "string", "description": "Path relative to the sandbox root." },
							"diffs": {
								"type": "array",
								"items": {
									"type": "object",
									"properties": {
										"search": { "type": "string", "description": "Expected current text of the line range. Must be empty for inserts." },
										"replace": { "type": "string", "description": "Replacement text. Empty deletes the range." },
										"start_line": { "type": "integer", "minimum": 1, "description": "1-based first line of the range." },
										"end_line": { "type": "integer", "description": "1-based last line, inclusive; start_line - 1 inserts before start_line." },
										"operation": { "type": "string", "description": "Optional label reported back in diff results." }
									},
									"required": ["search", "replace", "start_line", "end_line"]
								}
							}
						},
						"required": ["path", "diffs"]
					}
				}
			},
			"required": ["changes"]
		}
	})
	]
}

fn parse_limit(value: Option<&Value>) -> Result<Option<usize>> {
	let Some(value) = value else {
		return Ok(None);
	};
	let limit = value.as_u64().ok_or_else(|| anyhow!("limit must be a positive integer"))?;
	if limit == 0 {
		return Ok(Some(usize::MAX));
	}
	Ok(Some(limit as usize))
}

fn parse_usize(value: &str, label: &str) -> Result<usize> {
	value.trim().parse::<usize>().map_err(|_| anyhow!("{} must be a non-negative integer", label))
}

fn parse_optional_limit(value: &str, label: &str) -> Result<Option<usize>> {
	let parsed = parse_usize(value, label)?;
	if parsed == 0 {
		return Ok(None);
	}
	Ok(Some(parsed))
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
	if let Some(count) = result.get("structuredContent")
		.and_then(|value| value.get("count"))
		.and_then(Value::as_u64) {
		span.record("mcp.count", count);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
