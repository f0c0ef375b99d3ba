//! Parse `.env` into a key-value map (no overwrite of existing env here;
//! precedence is applied in lib).

use std::collections::HashMap;
use std::path::Path;

/// Path of `.env`: `override_dir` if given, else the current directory.
fn dotenv_path(override_dir: Option<&Path>) -> Option<std::path::PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    (path.exists() && path.is_file()).then_some(path)
}

/// Minimal .env parser: `KEY=VALUE` lines, skip empty lines and `#` comments,
/// trim key and value. Double-quoted values support `\"` and `\\` escapes;
/// single-quoted values are stripped without escapes. No multiline values.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1]
                .replace("\\\"", "\"")
                .replace("\\\\", "\\")
        } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value[1..value.len() - 1].to_string()
        } else {
            value.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Returns key-value pairs from `.env`. Missing file returns an empty map.
pub fn load_env_map(override_dir: Option<&Path>) -> Result<HashMap<String, String>, std::io::Error> {
    let Some(path) = dotenv_path(override_dir) else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(path)?;
    Ok(parse_dotenv(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: comments, blanks and malformed lines are skipped.
    #[test]
    fn parse_skips_noise() {
        let map = parse_dotenv("# comment\n\nFOO=bar\nnot a pair\nBAZ = qux \n");
        assert_eq!(map.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(map.get("BAZ").map(String::as_str), Some("qux"));
        assert_eq!(map.len(), 2);
    }

    /// **Scenario**: quoting rules: double quotes unescape, single quotes do not.
    #[test]
    fn parse_quoting() {
        let map = parse_dotenv("A=\"x \\\"y\\\"\"\nB='lit\\eral'\nC=\n");
        assert_eq!(map.get("A").map(String::as_str), Some("x \"y\""));
        assert_eq!(map.get("B").map(String::as_str), Some("lit\\eral"));
        assert_eq!(map.get("C").map(String::as_str), Some(""));
    }

    /// **Scenario**: missing .env yields an empty map, not an error.
    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = load_env_map(Some(dir.path())).unwrap();
        assert!(map.is_empty());
    }
}
