/// Joins `child` under `parent` with `.` as separator.
///
/// A child that is already qualified with `parent` is returned as is, so
/// joining is idempotent: `join("root.sg1", "root.sg1.d1")` and
/// `join("root.sg1", "d1")` both yield `root.sg1.d1`.
#[must_use]
pub fn join(parent: &str, child: &str) -> String {
    let parent = parent.trim().trim_end_matches('.');
    let child = child.trim().trim_start_matches('.');

    if parent.is_empty() {
        return child.to_string();
    }
    if child.is_empty() || child == parent {
        return parent.to_string();
    }
    if child
        .strip_prefix(parent)
        .is_some_and(|rest| rest.starts_with('.'))
    {
        return child.to_string();
    }
    format!("{parent}.{child}")
}

/// Last segment of a dotted path.
#[must_use]
pub fn leaf_name(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}
