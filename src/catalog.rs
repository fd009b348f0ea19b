use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{info, warn};

/// A tool as described by the external catalog. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    InvalidJson(String),
    NotAnArray,
    EntryNotObject { index: usize },
    MissingFunctionName { index: usize },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(err) => write!(f, "catalog is not valid JSON: {err}"),
            Self::NotAnArray => write!(f, "catalog root must be an array"),
            Self::EntryNotObject { index } => write!(f, "catalog entry {index} is not an object"),
            Self::MissingFunctionName { index } => {
                write!(f, "catalog entry {index} has no string `function.name`")
            }
        }
    }
}

impl std::error::Error for CatalogError {}

/// Validates a catalog document of the form
/// `[{"function": {"name": ..., "description": ..., "parameters": {...}}}]`.
pub fn parse_tool_definitions(text: &str) -> Result<Vec<ToolDefinition>, CatalogError> {
    let root: Value =
        serde_json::from_str(text).map_err(|err| CatalogError::InvalidJson(err.to_string()))?;
    let entries = root.as_array().ok_or(CatalogError::NotAnArray)?;

    let mut seen = BTreeSet::new();
    let mut tools = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        if !entry.is_object() {
            return Err(CatalogError::EntryNotObject { index });
        }
        let function = entry.get("function").filter(|value| value.is_object());
        let name = function
            .and_then(|value| value.get("name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(CatalogError::MissingFunctionName { index })?;
        if !seen.insert(name.to_owned()) {
            warn!("catalog entry {index} duplicates tool `{name}`, keeping the first");
            continue;
        }
        let description = function
            .and_then(|value| value.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let parameters = function
            .and_then(|value| value.get("parameters"))
            .filter(|value| value.is_object())
            .cloned()
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
        tools.push(ToolDefinition {
            name: name.to_owned(),
            description,
            parameters,
        });
    }
    Ok(tools)
}

#[derive(Debug)]
struct CachedCatalog {
    path: PathBuf,
    tools: Arc<Vec<ToolDefinition>>,
}

/// Cache of loaded tool definitions keyed by source path.
///
/// Loading a different path replaces the cached entry; failed loads are not
/// cached so a fixed file is picked up on the next call.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    cached: Mutex<Option<CachedCatalog>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_tools(&self, path: &Path) -> Option<Arc<Vec<ToolDefinition>>> {
        let mut guard = self.cached.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(cached) = guard.as_ref() {
            if cached.path == path {
                return Some(cached.tools.clone());
            }
        }
        *guard = None;

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!("tool catalog {} unreadable: {err}", path.display());
                return None;
            }
        };
        let tools = match parse_tool_definitions(&text) {
            Ok(tools) => Arc::new(tools),
            Err(err) => {
                warn!("tool catalog {} rejected: {err}", path.display());
                return None;
            }
        };
        info!("loaded {} tools from {}", tools.len(), path.display());
        *guard = Some(CachedCatalog {
            path: path.to_path_buf(),
            tools: tools.clone(),
        });
        Some(tools)
    }

    #[allow(dead_code)]
    pub fn reload(&self, path: &Path) -> Option<Arc<Vec<ToolDefinition>>> {
        self.clear();
        self.load_tools(path)
    }

    #[allow(dead_code)]
    pub fn clear(&self) {
        let mut guard = self.cached.lock().unwrap_or_else(|err| err.into_inner());
        if guard.take().is_some() {
            info!("tool catalog cache cleared");
        }
    }

    #[allow(dead_code)]
    pub fn cached_path(&self) -> Option<PathBuf> {
        self.cached
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .as_ref()
            .map(|cached| cached.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde_json::json;

    use super::{parse_tool_definitions, CatalogError, ToolCatalog};

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let mut root = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        root.push(format!("openclaw-bridge-catalog-{tag}-{stamp}.json"));
        root
    }

    const SAMPLE: &str = r#"[
        {"type": "function", "function": {"name": "read_thread", "description": "Read a thread", "parameters": {"type": "object", "properties": {"id": {"type": "string"}}}}},
        {"type": "function", "function": {"name": "list_issues"}}
    ]"#;

    #[test]
    fn parses_function_entries_with_defaults() {
        let tools = parse_tool_definitions(SAMPLE).expect("valid catalog");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "read_thread");
        assert_eq!(tools[0].description, "Read a thread");
        assert_eq!(
            tools[0].parameters.pointer("/properties/id/type"),
            Some(&json!("string"))
        );
        assert_eq!(tools[1].description, "");
        assert_eq!(
            tools[1].parameters,
            json!({ "type": "object", "properties": {} })
        );
    }

    #[test]
    fn rejects_structurally_invalid_catalogs() {
        assert!(matches!(
            parse_tool_definitions("{not json"),
            Err(CatalogError::InvalidJson(_))
        ));
        assert_eq!(
            parse_tool_definitions(r#"{"function": {"name": "x"}}"#),
            Err(CatalogError::NotAnArray)
        );
        assert_eq!(
            parse_tool_definitions(r#"[{"function": {"name": "x"}}, "y"]"#),
            Err(CatalogError::EntryNotObject { index: 1 })
        );
        assert_eq!(
            parse_tool_definitions(r#"[{"function": {"description": "no name"}}]"#),
            Err(CatalogError::MissingFunctionName { index: 0 })
        );
        assert_eq!(
            parse_tool_definitions(r#"[{"function": {"name": 12}}]"#),
            Err(CatalogError::MissingFunctionName { index: 0 })
        );
    }

    #[test]
    fn duplicate_names_keep_first_definition() {
        let tools = parse_tool_definitions(
            r#"[{"function": {"name": "a", "description": "first"}}, {"function": {"name": "a", "description": "second"}}]"#,
        )
        .expect("valid catalog");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].description, "first");
    }

    #[test]
    fn missing_or_invalid_file_returns_none() {
        let catalog = ToolCatalog::new();
        let missing = temp_path("missing");
        assert!(catalog.load_tools(&missing).is_none());

        let invalid = temp_path("invalid");
        std::fs::write(&invalid, "[1, 2]").expect("write catalog");
        assert!(catalog.load_tools(&invalid).is_none());
        assert!(catalog.cached_path().is_none());
        let _ = std::fs::remove_file(invalid);
    }

    #[test]
    fn caches_by_path_until_cleared() {
        let catalog = ToolCatalog::new();
        let path = temp_path("cache");
        std::fs::write(&path, SAMPLE).expect("write catalog");

        let first = catalog.load_tools(&path).expect("catalog");
        std::fs::write(&path, r#"[{"function": {"name": "changed"}}]"#).expect("rewrite");
        let second = catalog.load_tools(&path).expect("cached catalog");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 2);

        let reloaded = catalog.reload(&path).expect("reloaded catalog");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].name, "changed");

        catalog.clear();
        assert!(catalog.cached_path().is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn switching_path_replaces_cache() {
        let catalog = ToolCatalog::new();
        let first_path = temp_path("first");
        let second_path = temp_path("second");
        std::fs::write(&first_path, SAMPLE).expect("write first");
        std::fs::write(&second_path, r#"[{"function": {"name": "other"}}]"#)
            .expect("write second");

        assert_eq!(catalog.load_tools(&first_path).expect("first").len(), 2);
        let second = catalog.load_tools(&second_path).expect("second");
        assert_eq!(second[0].name, "other");
        assert_eq!(catalog.cached_path().as_deref(), Some(second_path.as_path()));

        let _ = std::fs::remove_file(first_path);
        let _ = std::fs::remove_file(second_path);
    }
}
