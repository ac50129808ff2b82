use anyhow::{anyhow, Result};
use filetime::{set_file_times, FileTime};
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use similar::TextDiff;
use std::future::Future;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;

pub struct ReadSlice {
	pub content: String,
	pub count: usize,
	pub total: usize,
	pub truncated: bool,
}

/// Reads a 1-based line window from a text file, numbering each line
/// `N: text`. Output is capped both in total bytes and per line; overlong
/// lines are cut with a marker instead of being dropped.
pub async fn read_slice(
	path: &Path,
	start_line: usize,
	limit: usize,
	max_total_bytes: usize,
	max_line_bytes: usize) -> Result<ReadSlice> {
	let raw = fs::read_to_string(path).await?;
	let total = raw.lines().count();
	let start_index = start_line.saturating_sub(1);
	let mut out = String::new();
	let mut taken = 0usize;
	let mut total_bytes = 0usize;
	let mut truncated = false;
	for (index, line) in raw.lines().enumerate() {
		if index < start_index {
			continue;
		}
		if taken >= limit {
			truncated = true;
			break;
		}
		let mut line_text = line.to_string();
		if line.len() > max_line_bytes {
			let (kept, kept_bytes) = truncate_to_bytes(line, max_line_bytes);
			line_text = format!("{} [TRUNCATED: {} bytes hidden]", kept, line.len() - kept_bytes);
			truncated = true;
		}
		let formatted = format!("{}: {}", index + 1, line_text);
		let separator = usize::from(!out.is_empty());
		if total_bytes + separator + formatted.len() > max_total_bytes {
			truncated = true;
			break;
		}
		if !out.is_empty() {
			out.push('\n');
		}
		total_bytes += separator + formatted.len();
		out.push_str(&formatted);
		taken += 1;
	}
	let truncated = truncated || start_index + taken < total;
	Ok(ReadSlice {
		content: out,
		count: taken,
		total,
		truncated,
	})
}

fn truncate_to_bytes(input: &str, max_bytes: usize) -> (String, usize) {
	if input.len() <= max_bytes {
		return (input.to_string(), input.len());
	}
	let mut end = 0usize;
	for (idx, ch) in input.char_indices() {
		let next = idx + ch.len_utf8();
		if next > max_bytes {
			break;
		}
		end = next;
	}
	(input[..end].to_string(), end)
}

/// Writes file content in one of three modes and reports a unified diff of
/// the change. Parent directories are created as needed.
pub async fn write_file(path: &Path, content: &str, mode: &str) -> Result<Value> {
	let existing = fs::read_to_string(path).await.unwrap_or_default();
	let next = match mode {
		"overwrite" => content.to_string(),
		"append" => {
			if existing.is_empty() || content.is_empty() || existing.ends_with('\n') {
				format!("{}{}", existing, content)
			}
			else {
				format!("{}\n{}", existing, content)
			}
		}
		"prepend" => {
			if existing.is_empty() || content.is_empty() || content.ends_with('\n') {
				format!("{}{}", content, existing)
			}
			else {
				format!("{}\n{}", content, existing)
			}
		}
		_ => return Err(anyhow!("mode must be overwrite, append, or prepend")),
	};
	let diff = make_diff(&existing, &next, path);
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}
	fs::write(path, &next).await?;
	Ok(json!({
		"bytes_written": next.len(),
		"diff": diff,
	}))
}

pub fn make_diff(existing: &str, updated: &str, path: &Path) -> String {
	let diff = TextDiff::from_lines(existing, updated);
	diff.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", path.display()), &format!("b/{}", path.display()))
		.to_string()
}

pub async fn move_path(from: &Path, to: &Path) -> Result<()> {
	if fs::metadata(to).await.is_ok() {
		return Err(anyhow!("target exists"));
	}
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(err.into());
			}
		}
	}
	let meta = fs::metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
		fs::remove_file(from).await?;
	}
	Ok(())
}

pub async fn copy_path(from: &Path, to: &Path) -> Result<()> {
	if fs::metadata(to).await.is_ok() {
		return Err(anyhow!("target exists"));
	}
	let meta = fs::metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
	}
	Ok(())
}

pub async fn delete_path(path: &Path) -> Result<()> {
	let meta = fs::metadata(path).await?;
	if meta.is_dir() {
		fs::remove_dir_all(path).await?;
	}
	else {
		fs::remove_file(path).await?;
	}
	Ok(())
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> Result<()> {
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent).await?;
	}
	fs::copy(from, to).await?;
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)?;
	Ok(())
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let meta = fs::metadata(&src).await?;
				if meta.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			let atime = FileTime::from_last_access_time(&meta);
			let mtime = FileTime::from_last_modification_time(&meta);
			set_file_times(&to, atime, mtime)?;
			Ok(())
		}
	)
}

fn is_cross_device(err: &std::io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

pub async fn stat_path(path: &Path) -> Result<Value> {
	let meta = fs::symlink_metadata(path).await?;
	let kind = if meta.is_dir() {
		"dir"
	}
	else if meta.file_type().is_symlink() {
		"symlink"
	}
	else {
		"file"
	};
	Ok(json!({
		"kind": kind,
		"size": meta.len(),
		"mode": format!("{:o}", meta.mode() & 0o7777),
		"uid": meta.uid(),
		"gid": meta.gid(),
		"modified": meta.mtime(),
		"accessed": meta.atime(),
	}))
}

/// Applies an octal mode string like "644" or "0755".
pub async fn chmod_path(path: &Path, mode: &str) -> Result<()> {
	let trimmed = mode.trim().trim_start_matches("0o");
	let bits = u32::from_str_radix(trimmed, 8).map_err(|_| anyhow!("invalid mode: {}", mode))?;
	if bits > 0o7777 {
		return Err(anyhow!("invalid mode: {}", mode));
	}
	fs::metadata(path).await?;
	fs::set_permissions(path, std::fs::Permissions::from_mode(bits)).await?;
	Ok(())
}

pub async fn chown_path(path: &Path, uid: u32, gid: u32) -> Result<()> {
	fs::metadata(path).await?;
	let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
		.map_err(|_| anyhow!("invalid path bytes"))?;
	let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
	if rc != 0 {
		return Err(std::io::Error::last_os_error().into());
	}
	Ok(())
}

pub struct ListOptions {
	pub file_type: Option<String>,
	pub max_depth: Option<usize>,
	pub glob: bool,
	pub exclude: Vec<String>,
	pub limit: Option<usize>,
	pub offset: usize,
}

pub async fn list_dir(
	root: &Path,
	root_label: &str,
	pattern: &str,
	options: ListOptions) -> Result<Value> {
	let matcher = build_matcher(pattern, options.glob)?;
	let exclude_set = build_glob_set(&options.exclude)?;
	let mut remaining = options.limit;
	let mut truncated = false;
	let mut skipped = 0usize;
	let mut builder = WalkBuilder::new(root);
	builder.hidden(true);
	if let Some(depth) = options.max_depth {
		builder.max_depth(Some(depth));
	}
	let mut matches = Vec::new();
	for entry in builder.build() {
		let entry = entry?;
		let path = entry.path();
		if path == root {
			continue;
		}
		if !matches_type(&entry, options.file_type.as_deref())? {
			continue;
		}
		let file_name = match path.file_name().and_then(|name| name.to_str()) {
			Some(name) => name,
			None => continue,
		};
		if let Some(excludes) = &exclude_set {
			if excludes.is_match(relative_display(root, path)) {
				continue;
			}
		}
		if let Some(matcher) = &matcher {
			if !matcher.is_match(file_name) {
				continue;
			}
		}
		if skipped < options.offset {
			skipped += 1;
			continue;
		}
		if let Some(remaining_count) = remaining {
			if remaining_count == 0 {
				truncated = true;
				break;
			}
		}
		let mut rel = relative_display(root, path);
		if is_dir_entry(&entry) && !rel.ends_with('/') {
			rel.push('/');
		}
		matches.push(rel);
		if let Some(remaining_count) = remaining.as_mut() {
			*remaining_count = remaining_count.saturating_sub(1);
		}
	}
	let count = matches.len();
	Ok(
		json!({
			"matches": matches,
			"pattern": pattern,
			"root": root_label,
			"count": count,
			"offset": options.offset,
			"limit": options.limit,
			"truncated": truncated
		})
	)
}

pub struct SearchOptions {
	pub glob: Vec<String>,
	pub context: usize,
	pub max_results: Option<usize>,
}

/// Searches file contents under `root` with a regex, reporting match chunks
/// in `N: text` / `N- context` form with contiguous windows merged.
pub async fn search_files(
	root: &Path,
	root_label: &str,
	pattern: &str,
	options: SearchOptions) -> Result<Value> {
	let re = RegexBuilder::new(pattern)
		.case_insensitive(!pattern.chars().any(|ch| ch.is_uppercase()))
		.build()
		.map_err(|err| anyhow!("invalid pattern: {}", err))?;
	let include_set = build_glob_set(&options.glob)?;
	let mut files: Vec<Value> = Vec::new();
	let mut total_matches = 0usize;
	let mut truncated = false;
	let mut builder = WalkBuilder::new(root);
	builder.hidden(true);
	'walk: for entry in builder.build() {
		let entry = entry?;
		if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
			continue;
		}
		let rel = relative_display(root, entry.path());
		if let Some(includes) = &include_set {
			if !includes.is_match(&rel) {
				continue;
			}
		}
		let Some(content) = read_text_lossy(entry.path()) else {
			continue;
		};
		let lines: Vec<&str> = content.lines().collect();
		let mut match_lines: Vec<usize> = Vec::new();
		for (index, line) in lines.iter().enumerate() {
			if re.is_match(line) {
				match_lines.push(index);
			}
		}
		if match_lines.is_empty() {
			continue;
		}
		let chunks = build_chunks(&lines, &match_lines, options.context);
		files.push(json!({
			"path": rel,
			"matches": chunks,
		}));
		total_matches += match_lines.len();
		if let Some(max) = options.max_results {
			if total_matches >= max {
				truncated = true;
				break 'walk;
			}
		}
	}
	let count = files.len();
	Ok(
		json!({
			"files": files,
			"pattern": pattern,
			"root": root_label,
			"count": count,
			"total_matches": total_matches,
			"truncated": truncated
		})
	)
}

fn read_text_lossy(path: &Path) -> Option<String> {
	let bytes = std::fs::read(path).ok()?;
	if bytes.contains(&0) {
		return None;
	}
	String::from_utf8(bytes).ok()
}

fn build_chunks(lines: &[&str], match_lines: &[usize], context: usize) -> Vec<String> {
	let mut windows: Vec<(usize, usize)> = Vec::new();
	for &index in match_lines {
		let start = index.saturating_sub(context);
		let end = (index + context).min(lines.len().saturating_sub(1));
		match windows.last_mut() {
			Some((_, last_end)) if start <= *last_end + 1 => {
				*last_end = (*last_end).max(end);
			}
			_ => windows.push((start, end)),
		}
	}
	windows.into_iter()
		.map(
			|(start, end)| {
				let mut chunk = String::new();
				for index in start..=end {
					let marker = if match_lines.contains(&index) {
						':'
					}
					else {
						'-'
					};
					chunk.push_str(&format!("{}{} {}\n", index + 1, marker, lines[index]));
				}
				chunk.trim_end().to_string()
			})
		.collect()
}

/// Literal or regex search/replace over one file's content. Returns the new
/// content and how many occurrences were replaced.
pub fn replace_in_content(
	content: &str,
	search: &str,
	replace: &str,
	use_regex: bool) -> Result<(String, usize)> {
	if search.is_empty() {
		return Err(anyhow!("search text is empty"));
	}
	if use_regex {
		let re = Regex::new(search).map_err(|err| anyhow!("invalid pattern: {}", err))?;
		let count = re.find_iter(content).count();
		let next = re.replace_all(content, replace).to_string();
		return Ok((next, count));
	}
	let count = content.match_indices(search).count();
	Ok((content.replace(search, replace), count))
}

fn matches_type(entry: &ignore::DirEntry, file_type: Option<&str>) -> Result<bool> {
	let Some(kind) = file_type else {
		return Ok(true);
	};
	let ftype = entry.file_type();
	match kind {
		"file" => Ok(ftype.map(|t| t.is_file()).unwrap_or(false)),
		"dir" | "directory" => Ok(is_dir_entry(entry)),
		"symlink" => Ok(ftype.map(|t| t.is_symlink()).unwrap_or(false)),
		_ => Err(anyhow!("unsupported type: {}", kind)),
	}
}

fn is_dir_entry(entry: &ignore::DirEntry) -> bool {
	let ftype = entry.file_type();
	if ftype.map(|t| t.is_dir()).unwrap_or(false) {
		return true;
	}
	if ftype.map(|t| t.is_symlink()).unwrap_or(false) {
		if let Ok(meta) = std::fs::metadata(entry.path()) {
			return meta.is_dir();
		}
	}
	false
}

fn relative_display(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		return rel.to_string_lossy().to_string();
	}
	path.to_string_lossy().to_string()
}

enum Matcher {
	Regex(Regex),
	Glob(GlobMatcher),
}

impl Matcher {
	fn is_match(&self, text: &str) -> bool {
		match self {
			Matcher::Regex(re) => re.is_match(text),
			Matcher::Glob(glob) => glob.is_match(text),
		}
	}
}

fn build_matcher(pattern: &str, glob: bool) -> Result<Option<Matcher>> {
	if pattern.is_empty() {
		return Ok(None);
	}
	let case_sensitive = pattern.chars().any(|ch| ch.is_uppercase());
	if glob {
		let mut builder = GlobBuilder::new(pattern);
		builder.case_insensitive(!case_sensitive);
		let glob = builder.build().map_err(|err| anyhow!("invalid glob: {}", err))?;
		Ok(Some(Matcher::Glob(glob.compile_matcher())))
	}
	else {
		let mut builder = RegexBuilder::new(pattern);
		builder.case_insensitive(!case_sensitive);
		let re = builder.build().map_err(|err| anyhow!("invalid pattern: {}", err))?;
		Ok(Some(Matcher::Regex(re)))
	}
}

fn build_glob_set(patterns: &[String]) -> Result<Option<GlobSet>> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = GlobBuilder::new(pattern)
			.literal_separator(true)
			.build()
			.map_err(|err| anyhow!("invalid glob {}: {}", pattern, err))?;
		builder.add(glob);
	}
	Ok(Some(builder.build().map_err(|err| anyhow!("invalid glob set: {}", err))?))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn replace_literal_counts_occurrences() {
		let (next, count) = replace_in_content("foo bar foo", "foo", "baz", false).expect("replace");
		assert_eq!(next, "baz bar baz");
		assert_eq!(count, 2);
	}

	#[test]
	fn replace_regex_uses_pattern() {
		let (next, count) = replace_in_content("a1 b2 c3", r"[a-z]\d", "x", true).expect("replace");
		assert_eq!(next, "x x x");
		assert_eq!(count, 3);
	}

	#[test]
	fn replace_rejects_empty_search() {
		assert!(replace_in_content("text", "", "x", false).is_err());
	}

	#[test]
	fn chunks_merge_adjacent_windows() {
		let lines = vec!["a", "hit", "b", "hit", "c"];
		let chunks = build_chunks(&lines, &[1, 3], 1);
		assert_eq!(chunks.len(), 1);
		assert!(chunks[0].contains("2: hit"));
		assert!(chunks[0].contains("4: hit"));
		assert!(chunks[0].contains("3- b"));
	}
}
