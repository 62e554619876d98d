/**
 * Canonical Serialization and Content Hashing
 *
 * DESIGN DECISION: SHA-256 over an explicit stable stringification, not over serde output
 * WHY: Two logically equal values must hash identically regardless of which
 *      code path built them; serde map ordering is a feature-flag accident
 *
 * REASONING CHAIN:
 * 1. Context packs, lock files, and evidence anchors are content-addressed
 * 2. Stable form: object keys lexicographic, array order preserved, standard
 *    JSON escaping, no extraneous whitespace
 * 3. Hashes render as lowercase hex (cryptographic-grade, cheap to compare)
 * 4. Path normalization happens here too: every storage boundary sees
 *    forward-slash, workspace-relative form
 */

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Serialize a JSON value into its canonical string form.
///
/// Objects emit keys in lexicographic order; arrays keep insertion order;
/// strings use standard JSON escaping; no whitespace between tokens.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json handles escaping; a bare string cannot fail to serialize
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

/// SHA-256 of a string, rendered as lowercase hex.
pub fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)
}

/// SHA-256 of the canonical form of a JSON value.
pub fn hash_canonical(value: &Value) -> String {
    sha256_hex(&stable_stringify(value))
}

/// Convert a path to forward-slash form.
pub fn to_forward_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Normalize a path for storage: forward slashes, workspace-relative when the
/// path falls inside the workspace root, stripped of any leading `./`.
pub fn normalize_path(workspace_root: &Path, path: &str) -> String {
    let forward = to_forward_slashes(path);
    let root = to_forward_slashes(&workspace_root.to_string_lossy());
    let root = root.trim_end_matches('/');

    let relative = if !root.is_empty() && forward.starts_with(root) {
        let rest = &forward[root.len()..];
        rest.trim_start_matches('/').to_string()
    } else {
        forward
    };

    relative.trim_start_matches("./").to_string()
}

/// True when `path` (absolute or relative, either slash style) falls under
/// `prefix` after normalization.
pub fn path_has_prefix(workspace_root: &Path, path: &str, prefix: &str) -> bool {
    let path = normalize_path(workspace_root, path);
    let prefix = normalize_path(workspace_root, prefix);
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
}

/// Glob-style path matching supporting `*` (within a segment), `**` (any
/// number of segments), and literal segments. Used by change-event filters.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pat, &segs)
}

fn match_segments(pat: &[&str], segs: &[&str]) -> bool {
    match (pat.first(), segs.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(&"**"), _) => {
            // `**` absorbs zero or more segments
            if match_segments(&pat[1..], segs) {
                return true;
            }
            !segs.is_empty() && match_segments(pat, &segs[1..])
        }
        (Some(_), None) => false,
        (Some(p), Some(s)) => match_segment(p, s) && match_segments(&pat[1..], &segs[1..]),
    }
}

/// Match one segment with `*` wildcards (never crossing a `/`).
fn match_segment(pattern: &str, segment: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = segment.chars().collect();
    match_chars(&p, &s)
}

fn match_chars(p: &[char], s: &[char]) -> bool {
    match (p.first(), s.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some('*'), _) => match_chars(&p[1..], s) || (!s.is_empty() && match_chars(p, &s[1..])),
        (Some(_), None) => false,
        (Some(a), Some(b)) => a == b && match_chars(&p[1..], &s[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_stable_stringify_orders_keys() {
        let a = json!({"zeta": 1, "alpha": [3, 2, 1], "mid": {"b": true, "a": null}});
        assert_eq!(
            stable_stringify(&a),
            r#"{"alpha":[3,2,1],"mid":{"a":null,"b":true},"zeta":1}"#
        );
    }

    #[test]
    fn test_equal_projections_hash_identically() {
        let a = json!({"x": 1, "y": "two"});
        let b = json!({"y": "two", "x": 1});
        assert_eq!(hash_canonical(&a), hash_canonical(&b));
    }

    #[test]
    fn test_normalize_path_strips_workspace_root() {
        let root = PathBuf::from("/work/repo");
        assert_eq!(normalize_path(&root, "/work/repo/src/a.ts"), "src/a.ts");
        assert_eq!(normalize_path(&root, "src\\a.ts"), "src/a.ts");
        assert_eq!(normalize_path(&root, "./src/a.ts"), "src/a.ts");
        assert_eq!(normalize_path(&root, "/elsewhere/b.ts"), "/elsewhere/b.ts");
    }

    #[test]
    fn test_path_prefix_accepts_absolute_and_relative() {
        let root = PathBuf::from("/work/repo");
        assert!(path_has_prefix(&root, "src/a.ts", "src"));
        assert!(path_has_prefix(&root, "/work/repo/src/a.ts", "src"));
        assert!(!path_has_prefix(&root, "lib/a.ts", "src"));
        assert!(!path_has_prefix(&root, "srcx/a.ts", "src"));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("src/**", "src/deep/nested/file.rs"));
        assert!(glob_match("src/*.rs", "src/main.rs"));
        assert!(!glob_match("src/*.rs", "src/deep/main.rs"));
        assert!(glob_match("**/*.ts", "a/b/c.ts"));
        assert!(glob_match("src/a.ts", "src/a.ts"));
        assert!(!glob_match("src/a.ts", "src/b.ts"));
        assert!(glob_match("**", "anything/at/all"));
    }
}
