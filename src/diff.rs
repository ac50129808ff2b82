use serde::Serialize;
use serde_json::Value;

/// One validated line-range edit. `end_line == start_line - 1` encodes an
/// insertion before `start_line` that consumes no existing line.
#[derive(Debug, Clone)]
pub struct DiffBlock {
	pub search: String,
	pub replace: String,
	pub start_line: usize,
	pub end_line: usize,
	pub operation: String,
}

impl DiffBlock {
	pub fn is_insert(&self) -> bool {
		self.end_line + 1 == self.start_line
	}
}

/// Outcome of parsing one raw block. Downstream code only ever sees the
/// `Valid` variant; shape is never re-checked past this boundary.
#[derive(Debug)]
pub enum BlockParse {
	Valid(DiffBlock),
	Invalid { reason: String },
}

#[derive(Debug, Serialize)]
pub struct DiffResult {
	pub operation: String,
	pub start_line: usize,
	pub end_line: usize,
	pub success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub context: Option<String>,
}

/// Per-file outcome. `new_content` is present iff `success` is true; callers
/// must never persist anything when `success` is false.
#[derive(Debug)]
pub struct ApplyDiffResult {
	pub success: bool,
	pub new_content: Option<String>,
	pub error: Option<String>,
	pub context: Option<String>,
	pub diff_results: Vec<DiffResult>,
}

pub fn parse_block(value: &Value) -> BlockParse {
	let Some(obj) = value.as_object() else {
		return BlockParse::Invalid {
			reason: "diff block must be an object".to_string()
		};
	};
	let Some(search) = obj.get("search").and_then(Value::as_str) else {
		return BlockParse::Invalid {
			reason: "search must be a string".to_string()
		};
	};
	let Some(replace) = obj.get("replace").and_then(Value::as_str) else {
		return BlockParse::Invalid {
			reason: "replace must be a string".to_string()
		};
	};
	let Some(start_line) = obj.get("start_line").and_then(Value::as_i64) else {
		return BlockParse::Invalid {
			reason: "start_line must be an integer".to_string()
		};
	};
	let Some(end_line) = obj.get("end_line").and_then(Value::as_i64) else {
		return BlockParse::Invalid {
			reason: "end_line must be an integer".to_string()
		};
	};
	if start_line < 1 {
		return BlockParse::Invalid {
			reason: format!("start_line must be >= 1, got {}", start_line)
		};
	}
	if end_line < start_line {
		if end_line != start_line - 1 {
			return BlockParse::Invalid {
				reason: format!("end_line {} is before start_line {}", end_line, start_line)
			};
		}
		if !search.is_empty() {
			return BlockParse::Invalid {
				reason: "insert blocks must have an empty search".to_string()
			};
		}
	}
	let operation = obj.get("operation")
		.and_then(Value::as_str)
		.unwrap_or("replace")
		.to_string();
	BlockParse::Valid(DiffBlock {
		search: search.to_string(),
		replace: replace.to_string(),
		start_line: start_line as usize,
		end_line: end_line as usize,
		operation,
	})
}

/// Renders a window of lines around `line_number` for diagnostics. The focus
/// line is marked with `>`; truncated regions are marked with `...`. Never
/// panics: bad line numbers produce an error string instead.
pub fn context_around_line(lines: &[String], line_number: i64, context_size: usize) -> String {
	if line_number < 1 || line_number as usize > lines.len() {
		return format!(
			"Error: Invalid line number {}. File has {} lines.",
			line_number, lines.len()
		);
	}
	let focus = line_number as usize;
	let start = focus.saturating_sub(context_size).max(1);
	let end = (focus + context_size).min(lines.len());
	let mut out = String::new();
	if start > 1 {
		out.push_str("  ...\n");
	}
	for number in start..=end {
		let marker = if number == focus {
			'>'
		}
		else {
			' '
		};
		out.push_str(&format!("{} {} | {}\n", marker, number, lines[number - 1]));
	}
	if end < lines.len() {
		out.push_str("  ...\n");
	}
	out.trim_end().to_string()
}

#[derive(Debug)]
pub enum RangeCheck {
	Ok,
	Invalid { error: String, context: String },
}

/// Confirms the block's line range fits the current buffer. Insert blocks may
/// target `lines.len() + 1` (append); everything else must end inside the
/// buffer.
pub fn validate_range(block: &DiffBlock, lines: &[String]) -> RangeCheck {
	let in_bounds = if block.is_insert() {
		block.start_line <= lines.len() + 1
	}
	else {
		block.end_line <= lines.len()
	};
	if in_bounds {
		return RangeCheck::Ok;
	}
	let clamped = block.start_line.min(lines.len()) as i64;
	let context = format!(
		"{}\nFile has {} lines",
		context_around_line(lines, clamped, 3),
		lines.len()
	);
	RangeCheck::Invalid {
		error: format!("Invalid line numbers [{}-{}]", block.start_line, block.end_line),
		context,
	}
}

#[derive(Debug)]
pub enum ContentCheck {
	Match,
	Mismatch { error: String, context: String },
}

fn normalize_endings(text: &str) -> String {
	text.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

/// Compares the block's `search` text against the live lines in its range.
/// Line endings are normalized on both sides so a CRLF search matches LF
/// content and vice versa. Insert blocks always match.
pub fn verify_content(block: &DiffBlock, lines: &[String]) -> ContentCheck {
	if block.is_insert() {
		return ContentCheck::Match;
	}
	let actual = lines[block.start_line - 1..block.end_line].join("\n");
	let expected = normalize_endings(&block.search);
	let actual = normalize_endings(&actual);
	if expected == actual {
		return ContentCheck::Match;
	}
	let context = format!(
		"EXPECTED ({} chars):\n{}\n\nACTUAL ({} chars):\n{}",
		expected.chars().count(),
		expected,
		actual.chars().count(),
		actual
	);
	ContentCheck::Mismatch {
		error: format!(
			"Content mismatch at lines {}-{}. Expected content does not match actual content.",
			block.start_line, block.end_line
		),
		context,
	}
}

fn replacement_lines(replace: &str) -> Vec<String> {
	if replace.is_empty() {
		return Vec::new();
	}
	normalize_endings_keep_edges(replace).split('\n').map(str::to_string).collect()
}

fn normalize_endings_keep_edges(text: &str) -> String {
	text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Splices the block's replacement into the buffer. Bounds are re-checked so
/// a stale range surfaces as an error instead of a panic; the orchestrator
/// records that as a failed block.
pub fn apply_block(lines: &mut Vec<String>, block: &DiffBlock) -> Result<(), String> {
	let replace_lines = replacement_lines(&block.replace);
	let start_idx = block.start_line - 1;
	if start_idx > lines.len() {
		return Err(format!(
			"splice position {} is beyond end of file ({} lines)",
			block.start_line, lines.len()
		));
	}
	if block.is_insert() {
		lines.splice(start_idx..start_idx, replace_lines);
		return Ok(());
	}
	let end_idx = block.end_line.min(lines.len());
	lines.splice(start_idx..end_idx, replace_lines);
	Ok(())
}

/// Applies a batch of diff blocks to one file's content. Structurally invalid
/// blocks are filtered out up front; the remaining blocks are applied from the
/// bottom of the file upward (descending `end_line`) so earlier splices never
/// shift the line numbers of blocks still waiting to be applied. Every block
/// is attempted even after a failure so the caller sees all problems in one
/// pass, but any failure makes the whole file fail with no content returned.
pub fn apply_diffs(original: &str, diffs: &Value) -> ApplyDiffResult {
	let Some(items) = diffs.as_array() else {
		return ApplyDiffResult {
			success: false,
			new_content: None,
			error: Some("diffs must be an array".to_string()),
			context: None,
			diff_results: Vec::new(),
		};
	};
	let mut blocks: Vec<DiffBlock> = items.iter()
		.filter_map(
			|item| match parse_block(item) {
				BlockParse::Valid(block) => Some(block),
				BlockParse::Invalid { .. } => None,
			})
		.collect();
	if blocks.is_empty() {
		return ApplyDiffResult {
			success: true,
			new_content: Some(original.to_string()),
			error: None,
			context: None,
			diff_results: Vec::new(),
		};
	}
	let mut lines: Vec<String> = original.split('\n').map(str::to_string).collect();
	blocks.sort_by(|a, b| b.end_line.cmp(&a.end_line).then(b.start_line.cmp(&a.start_line)));
	let mut results: Vec<DiffResult> = Vec::new();
	for block in &blocks {
		if let RangeCheck::Invalid { error, context } = validate_range(block, &lines) {
			results.push(failed_result(block, error, context));
			continue;
		}
		if let ContentCheck::Mismatch { error, context } = verify_content(block, &lines) {
			results.push(failed_result(block, error, context));
			continue;
		}
		match apply_block(&mut lines, block) {
			Ok(()) => results.push(DiffResult {
				operation: block.operation.clone(),
				start_line: block.start_line,
				end_line: block.end_line,
				success: true,
				error: None,
				context: None,
			}),
			Err(error) => results.push(failed_result(block, error, String::new())),
		}
	}
	let failures: Vec<&DiffResult> = results.iter().filter(|result| !result.success).collect();
	if failures.is_empty() {
		return ApplyDiffResult {
			success: true,
			new_content: Some(lines.join("\n")),
			error: None,
			context: None,
			diff_results: results,
		};
	}
	let messages = failures.iter()
		.filter_map(|result| result.error.as_deref())
		.collect::<Vec<_>>()
		.join("; ");
	let succeeded = results.len() - failures.len();
	let total = results.len();
	ApplyDiffResult {
		success: false,
		new_content: None,
		error: Some(format!("Some diffs failed: {}", messages)),
		context: Some(format!("{} of {} diffs succeeded", succeeded, total)),
		diff_results: results,
	}
}

fn failed_result(block: &DiffBlock, error: String, context: String) -> DiffResult {
	DiffResult {
		operation: block.operation.clone(),
		start_line: block.start_line,
		end_line: block.end_line,
		success: false,
		error: Some(error),
		context: if context.is_empty() {
			None
		}
		else {
			Some(context)
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn lines(content: &str) -> Vec<String> {
		content.split('\n').map(str::to_string).collect()
	}

	#[test]
	fn empty_diff_list_is_a_noop() {
		let content = "Line 1\nLine 2\nLine 3";
		let result = apply_diffs(content, &json!([]));
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some(content));
	}

	#[test]
	fn simple_replace() {
		let content = "Line 1\nLine 2\nLine 3";
		let diffs = json!([
			{ "search": "Line 1", "replace": "Line One", "start_line": 1, "end_line": 1 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some("Line One\nLine 2\nLine 3"));
	}

	#[test]
	fn content_mismatch_reports_expected_and_actual() {
		let content = "Actual Line 1\nActual Line 2";
		let diffs = json!([
			{ "search": "Expected Line 1", "replace": "New Line 1", "start_line": 1, "end_line": 1 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(!result.success);
		assert!(result.new_content.is_none());
		let error = result.error.unwrap();
		assert!(error.contains("Content mismatch at lines 1-1"));
		let block = &result.diff_results[0];
		let context = block.context.as_deref().unwrap();
		assert!(context.contains("Expected Line 1"));
		assert!(context.contains("Actual Line 1"));
	}

	#[test]
	fn out_of_bounds_range_fails() {
		let content = "only line";
		let diffs = json!([
			{ "search": "only line\nmissing", "replace": "x", "start_line": 1, "end_line": 2 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(!result.success);
		assert!(result.error.unwrap().contains("Invalid line numbers [1-2]"));
	}

	#[test]
	fn one_failing_block_fails_the_whole_file() {
		let content = "Line 1\nLine 2\nLine 3";
		let diffs = json!([
			{ "search": "Line 1", "replace": "Line One", "start_line": 1, "end_line": 1 },
			{ "search": "Wrong Line 2", "replace": "Line Two", "start_line": 2, "end_line": 2 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(!result.success);
		assert!(result.new_content.is_none());
		assert!(result.error.unwrap().contains("lines 2-2"));
		assert_eq!(result.context.as_deref(), Some("1 of 2 diffs succeeded"));
		assert_eq!(result.diff_results.len(), 2);
	}

	#[test]
	fn bottom_up_order_keeps_line_numbers_stable() {
		let content = "a\nb\nc";
		let diffs = json!([
			{ "search": "a", "replace": "a1\na2", "start_line": 1, "end_line": 1 },
			{ "search": "c", "replace": "c1", "start_line": 3, "end_line": 3 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some("a1\na2\nb\nc1"));
	}

	#[test]
	fn crlf_search_matches_lf_content() {
		let content = "first\nsecond\nthird";
		let diffs = json!([
			{ "search": "first\r\nsecond", "replace": "merged", "start_line": 1, "end_line": 2 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some("merged\nthird"));
	}

	#[test]
	fn insert_prepends_at_line_one() {
		let content = "b\nc";
		let diffs = json!([
			{ "search": "", "replace": "a", "start_line": 1, "end_line": 0, "operation": "insert" }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some("a\nb\nc"));
	}

	#[test]
	fn insert_appends_past_last_line() {
		let content = "a\nb";
		let diffs = json!([
			{ "search": "", "replace": "c\nd", "start_line": 3, "end_line": 2 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some("a\nb\nc\nd"));
	}

	#[test]
	fn insert_beyond_append_position_fails() {
		let content = "a\nb";
		let diffs = json!([
			{ "search": "", "replace": "x", "start_line": 5, "end_line": 4 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(!result.success);
		assert!(result.error.unwrap().contains("Invalid line numbers [5-4]"));
	}

	#[test]
	fn empty_replace_deletes_the_range() {
		let content = "keep\ndrop 1\ndrop 2\nkeep too";
		let diffs = json!([
			{ "search": "drop 1\ndrop 2", "replace": "", "start_line": 2, "end_line": 3 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some("keep\nkeep too"));
	}

	#[test]
	fn malformed_blocks_are_filtered_before_validation() {
		let content = "Line 1\nLine 2";
		let diffs = json!([
			"not an object",
			{ "search": "x", "replace": "y" },
			{ "search": "not empty", "replace": "y", "start_line": 2, "end_line": 1 },
			{ "search": "Line 2", "replace": "Line Two", "start_line": 2, "end_line": 2 }
		]);
		let result = apply_diffs(content, &diffs);
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some("Line 1\nLine Two"));
		assert_eq!(result.diff_results.len(), 1);
	}

	#[test]
	fn only_malformed_blocks_is_a_noop() {
		let content = "unchanged";
		let diffs = json!([{ "search": 5, "replace": "y", "start_line": 1, "end_line": 1 }]);
		let result = apply_diffs(content, &diffs);
		assert!(result.success);
		assert_eq!(result.new_content.as_deref(), Some(content));
	}

	#[test]
	fn non_array_diffs_is_an_error() {
		let result = apply_diffs("content", &json!({ "search": "x" }));
		assert!(!result.success);
		assert!(result.error.unwrap().contains("must be an array"));
	}

	#[test]
	fn parse_rejects_non_integer_line_numbers() {
		let block = json!({ "search": "a", "replace": "b", "start_line": 1.5, "end_line": 2 });
		assert!(matches!(parse_block(&block), BlockParse::Invalid { .. }));
	}

	#[test]
	fn parse_accepts_insert_sentinel() {
		let block = json!({ "search": "", "replace": "b", "start_line": 1, "end_line": 0 });
		assert!(matches!(parse_block(&block), BlockParse::Valid(_)));
	}

	#[test]
	fn context_marks_the_focus_line() {
		let buffer = lines("one\ntwo\nthree\nfour\nfive\nsix\nseven\neight");
		let rendered = context_around_line(&buffer, 5, 2);
		assert!(rendered.contains("> 5 | five"));
		assert!(rendered.contains("  4 | four"));
		assert!(rendered.starts_with("  ...\n"));
		assert!(rendered.ends_with("  ..."));
	}

	#[test]
	fn context_never_panics_on_bad_line_number() {
		let buffer = lines("one");
		assert!(context_around_line(&buffer, 0, 3).starts_with("Error: Invalid line number"));
		assert!(context_around_line(&buffer, -4, 3).starts_with("Error: Invalid line number"));
		assert!(context_around_line(&[], 1, 3).starts_with("Error: Invalid line number"));
	}

	#[test]
	fn original_string_is_never_mutated() {
		let content = String::from("Line 1\nLine 2");
		let diffs = json!([
			{ "search": "nope", "replace": "x", "start_line": 1, "end_line": 1 },
			{ "search": "Line 2", "replace": "Line Two", "start_line": 2, "end_line": 2 }
		]);
		let result = apply_diffs(&content, &diffs);
		assert!(!result.success);
		assert_eq!(content, "Line 1\nLine 2");
	}
}
