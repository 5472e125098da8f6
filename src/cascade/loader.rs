//! Cascade file loading (JSON or YAML, chosen by extension).

use std::path::Path;

use super::CascadeDef;
use crate::errors::CascadeError;

/// Load a cascade definition from a file.
///
/// `.yaml`/`.yml` files are parsed as YAML, everything else as JSON. The
/// result is not yet validated; see [`super::RoutingGraph::build`].
pub fn load_cascade(path: &Path) -> Result<CascadeDef, CascadeError> {
    let content = std::fs::read_to_string(path).map_err(|source| CascadeError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    if is_yaml {
        serde_yaml::from_str(&content)
            .map_err(|e| CascadeError::Parse(format!("{}: {}", path.display(), e)))
    } else {
        parse_cascade(&content)
            .map_err(|e| CascadeError::Parse(format!("{}: {}", path.display(), e)))
    }
}

/// Parse a JSON cascade definition from a string.
pub fn parse_cascade(content: &str) -> Result<CascadeDef, CascadeError> {
    serde_json::from_str(content).map_err(|e| CascadeError::Parse(e.to_string()))
}
