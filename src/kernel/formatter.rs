//! Type-directed rendering of structured step outputs into readable text.
//!
//! The finalizer hands the terminal step's `details` value here when it is
//! an array. Recognized shapes get a dedicated rendering; everything else
//! falls back to one line per record or one bullet per scalar.

/// Maximum characters per rendered record line.
const RECORD_LINE_MAX_CHARS: usize = 120;

/// Render a details value into display text.
///
/// Strings pass through; arrays are dispatched by shape; any other value
/// is rendered as compact JSON.
pub fn format_details(details: &serde_json::Value) -> String {
    match details {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => format_array(items),
        other => compact_json(other),
    }
}

/// Render an array of records or scalars.
///
/// Shape dispatch, in order:
/// 1. every element is a duplicate-file group (`files[]`, `size`, `count`)
/// 2. every element is an object
/// 3. anything else: one bullet per element
pub fn format_array(items: &[serde_json::Value]) -> String {
    if items.is_empty() {
        return String::new();
    }

    if items.iter().all(is_duplicate_group) {
        return format_duplicate_groups(items);
    }

    if items.iter().all(serde_json::Value::is_object) {
        return items
            .iter()
            .filter_map(serde_json::Value::as_object)
            .map(format_record_line)
            .collect::<Vec<_>>()
            .join("\n");
    }

    items
        .iter()
        .map(|item| format!("- {}", render_scalar(item)))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Duplicate-file groups ───────────────────────────────────────

/// Records with `files[]`, `size`, and `count` fields.
fn is_duplicate_group(value: &serde_json::Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("files").is_some_and(serde_json::Value::is_array)
        && obj.get("size").is_some_and(serde_json::Value::is_number)
        && obj.get("count").is_some_and(serde_json::Value::is_number)
}

/// `Group N (count copies, ~size each):` followed by one line per file name.
fn format_duplicate_groups(items: &[serde_json::Value]) -> String {
    let mut lines = Vec::new();

    for (i, group) in items.iter().enumerate() {
        let count = group.get("count").and_then(serde_json::Value::as_u64).unwrap_or(0);
        let size = group.get("size").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
        let ordinal = i.saturating_add(1);

        lines.push(format!(
            "Group {ordinal} ({count} copies, ~{} each):",
            human_size(size)
        ));

        if let Some(files) = group.get("files").and_then(serde_json::Value::as_array) {
            for file in files {
                let name = file
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("(unnamed)");
                lines.push(format!("- {name}"));
            }
        }
    }

    lines.join("\n")
}

// ── Generic records ─────────────────────────────────────────────

/// One line per record: keys sorted lexicographically, `k: v` pairs
/// comma-separated, truncated at 120 characters.
fn format_record_line(record: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut keys: Vec<&String> = record.keys().collect();
    keys.sort();

    let line = keys
        .iter()
        .map(|k| format!("{k}: {}", render_scalar(record.get(*k).unwrap_or(&serde_json::Value::Null))))
        .collect::<Vec<_>>()
        .join(", ");

    truncate_chars(&line, RECORD_LINE_MAX_CHARS)
}

/// Render a value for inclusion in a line: strings unquoted, containers
/// as compact JSON.
fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => compact_json(value),
        other => other.to_string(),
    }
}

fn compact_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_owned()
    } else {
        s.chars().take(max_chars).collect()
    }
}

// ── Sizes ───────────────────────────────────────────────────────

/// Human-readable size with binary prefixes.
///
/// `< 1024` renders as bytes, `< 1024²` as `KB` with two decimals,
/// everything else as `MB` with two decimals.
pub fn human_size(bytes: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;

    if bytes < KIB {
        format!("{bytes:.0} bytes")
    } else if bytes < MIB {
        format!("{:.2} KB", bytes / KIB)
    } else {
        format!("{:.2} MB", bytes / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_human_size_bytes() {
        assert_eq!(human_size(0.0), "0 bytes");
        assert_eq!(human_size(512.0), "512 bytes");
        assert_eq!(human_size(1023.0), "1023 bytes");
    }

    #[test]
    fn test_human_size_kb() {
        assert_eq!(human_size(1024.0), "1.00 KB");
        assert_eq!(human_size(202_600.0), "197.85 KB");
    }

    #[test]
    fn test_human_size_mb() {
        assert_eq!(human_size(1024.0 * 1024.0), "1.00 MB");
        assert_eq!(human_size(5.5 * 1024.0 * 1024.0), "5.50 MB");
    }

    #[test]
    fn test_duplicate_groups_rendering() {
        let details = json!([
            {"files": [{"name": "a.pdf"}, {"name": "b.pdf"}], "size": 202600, "count": 2},
            {"files": [{"name": "c.pdf"}, {"name": "d.pdf"}], "size": 199200, "count": 2}
        ]);
        let rendered = format_details(&details);

        assert!(rendered.contains("Group 1 (2 copies, ~197.85 KB each):"));
        assert!(rendered.contains("Group 2 (2 copies, ~194.53 KB each):"));
        assert!(rendered.contains("- a.pdf"));
        assert!(rendered.contains("- d.pdf"));

        // Group 1 header precedes its file names.
        let g1 = rendered.find("Group 1").expect("group 1");
        let a = rendered.find("- a.pdf").expect("a.pdf");
        let g2 = rendered.find("Group 2").expect("group 2");
        assert!(g1 < a && a < g2);
    }

    #[test]
    fn test_generic_records_sorted_keys() {
        let details = json!([
            {"zeta": 1, "alpha": "x"},
            {"beta": true}
        ]);
        let rendered = format_details(&details);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "alpha: x, zeta: 1");
        assert_eq!(lines[1], "beta: true");
    }

    #[test]
    fn test_record_line_truncated() {
        let long = "v".repeat(300);
        let details = json!([{"key": long}]);
        let rendered = format_details(&details);
        assert_eq!(rendered.chars().count(), 120);
    }

    #[test]
    fn test_scalar_list_bullets() {
        let details = json!(["one", "two", 3]);
        let rendered = format_details(&details);
        assert_eq!(rendered, "- one\n- two\n- 3");
    }

    #[test]
    fn test_string_passes_through() {
        let details = json!("already readable");
        assert_eq!(format_details(&details), "already readable");
    }

    #[test]
    fn test_empty_array() {
        assert_eq!(format_details(&json!([])), "");
    }

    #[test]
    fn test_mixed_array_falls_back_to_bullets() {
        let details = json!([{"a": 1}, "plain"]);
        let rendered = format_details(&details);
        assert!(rendered.starts_with("- "));
    }
}
