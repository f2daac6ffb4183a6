//! Prompt template loading and interpolation.
//!
//! Templates use `{{placeholder}}` substitutions. Loaded templates are
//! cached process-wide by absolute path, populated once on first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use lazy_static::lazy_static;

lazy_static! {
    static ref TEMPLATE_CACHE: RwLock<HashMap<PathBuf, String>> = RwLock::new(HashMap::new());
}

/// Load a template, reading the file only the first time a path is seen.
pub fn load_template(path: &Path) -> Result<String> {
    let key = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    if let Some(cached) = TEMPLATE_CACHE
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&key)
    {
        return Ok(cached.clone());
    }

    let template = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read prompt template {}", path.display()))?;

    TEMPLATE_CACHE
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key, template.clone());

    Ok(template)
}

/// Replace every `{{name}}` with its value; unknown placeholders become
/// empty strings.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder, keep the tail verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_are_substituted() {
        assert_eq!(render("{{name}}", &vars(&[("name", "X")])), "X");
        assert_eq!(
            render("repo {{name}} on {{branch}}", &vars(&[("name", "X"), ("branch", "main")])),
            "repo X on main"
        );
    }

    #[test]
    fn missing_placeholders_become_empty() {
        assert_eq!(render("a{{missing}}b", &vars(&[])), "ab");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        assert_eq!(render("{{ name }}", &vars(&[("name", "X")])), "X");
    }

    #[test]
    fn unterminated_placeholder_is_left_alone() {
        assert_eq!(render("a{{name", &vars(&[("name", "X")])), "a{{name");
    }

    #[test]
    fn template_cache_survives_file_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.txt");
        std::fs::write(&path, "hello {{name}}").unwrap();

        let first = load_template(&path).unwrap();
        assert_eq!(first, "hello {{name}}");

        // Cached by absolute path: further loads do not touch the file.
        std::fs::remove_file(&path).unwrap();
        let second = load_template(&path).unwrap();
        assert_eq!(second, first);
    }
}
