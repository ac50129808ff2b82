use std::path::{Component, Path, PathBuf};

/// Sandbox violations are typed so callers can tell bad arguments apart from
/// traversal attempts without matching on message text.
#[derive(Debug)]
pub enum PathError {
	BadParams(String),
	OutsideRoot(String),
}

impl PathError {
	pub fn code(&self) -> &'static str {
		match self {
			PathError::BadParams(_) => "BAD_PARAMS",
			PathError::OutsideRoot(_) => "PATH_OUTSIDE_ROOT",
		}
	}
}

impl std::fmt::Display for PathError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			PathError::BadParams(message) => write!(f, "{}", message),
			PathError::OutsideRoot(message) => write!(f, "{}", message),
		}
	}
}

impl std::error::Error for PathError {}

/// Resolves a user-supplied relative path against the sandbox root. Absolute
/// paths are rejected outright; `..` traversal is normalized away and any
/// resolution that still escapes the root is refused. Existing targets are
/// canonicalized so symlinks cannot smuggle a path outside the root.
pub fn resolve_path(root: &Path, root_canon: &Path, user_path: &str) -> Result<PathBuf, PathError> {
	if user_path.trim().is_empty() {
		return Err(PathError::BadParams("path is empty".to_string()));
	}
	let rel = Path::new(user_path);
	if rel.is_absolute() {
		return Err(PathError::BadParams(format!(
			"absolute paths not allowed: {}", user_path
		)));
	}
	let normalized = normalize_path(&root.join(rel));
	let checked = if normalized.exists() {
		normalized.canonicalize().unwrap_or(normalized)
	}
	else {
		normalized
	};
	if checked.starts_with(root_canon) || checked.starts_with(root) {
		return Ok(checked);
	}
	Err(PathError::OutsideRoot(format!("path outside root: {}", user_path)))
}

/// Lexically removes `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<std::ffi::OsString> = Vec::new();
	let mut prefix: Option<std::ffi::OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if !stack.is_empty() {
					stack.pop();
				}
				else if !absolute {
					stack.push(std::ffi::OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn root() -> (tempfile::TempDir, PathBuf) {
		let dir = tempfile::tempdir().expect("tempdir");
		let canon = dir.path().canonicalize().expect("canonicalize");
		(dir, canon)
	}

	#[test]
	fn resolves_plain_relative_path() {
		let (dir, canon) = root();
		let resolved = resolve_path(dir.path(), &canon, "sub/file.txt").expect("resolve");
		assert!(resolved.ends_with("sub/file.txt"));
		assert!(resolved.starts_with(&canon) || resolved.starts_with(dir.path()));
	}

	#[test]
	fn rejects_absolute_path() {
		let (dir, canon) = root();
		let err = resolve_path(dir.path(), &canon, "/etc/passwd").unwrap_err();
		assert_eq!(err.code(), "BAD_PARAMS");
		assert!(err.to_string().contains("absolute paths not allowed"));
	}

	#[test]
	fn rejects_empty_path() {
		let (dir, canon) = root();
		let err = resolve_path(dir.path(), &canon, "  ").unwrap_err();
		assert_eq!(err.code(), "BAD_PARAMS");
	}

	#[test]
	fn rejects_parent_traversal() {
		let (dir, canon) = root();
		let err = resolve_path(dir.path(), &canon, "../outside.txt").unwrap_err();
		assert_eq!(err.code(), "PATH_OUTSIDE_ROOT");
	}

	#[test]
	fn traversal_back_into_root_is_allowed() {
		let (dir, canon) = root();
		let resolved = resolve_path(dir.path(), &canon, "sub/../file.txt").expect("resolve");
		assert!(resolved.ends_with("file.txt"));
	}

	#[test]
	fn normalize_collapses_dot_components() {
		let normalized = normalize_path(Path::new("a/./b/../c"));
		assert_eq!(normalized, PathBuf::from("a/c"));
	}
}
