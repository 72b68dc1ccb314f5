//! Route paths, names and the per-route proxy fragment
//!
//! Each route is realized as one fragment file named `<port>-<name>.conf`
//! in the routes directory. The main configuration includes
//! `<port>-*.conf` inside the server block for that port, so fragments are
//! scoped to their port by filename alone.

use crate::error::{Result, RouterError};
use std::path::{Path, PathBuf};

/// Characters that would break out of a `location` line or a state-file key
const FORBIDDEN_PATH_CHARS: &[char] = &['{', '}', ';', '"', '\'', '$', '\\', '#', '`'];

const FRAGMENT_MARKER: &str = "# n8s route ";

/// Normalize a URL path prefix so it starts and ends with `/`.
///
/// `/api`, `/api/` and `api/` all become `/api/`; an empty or all-slash
/// input becomes `/`. Normalizing twice is a no-op.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Reject paths that are empty or could inject into the generated config
pub fn check_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(RouterError::validation("route path must not be empty"));
    }

    if let Some(c) = path
        .trim()
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || FORBIDDEN_PATH_CHARS.contains(c))
    {
        return Err(RouterError::validation(format!(
            "route path '{}' contains disallowed character {:?}",
            path, c
        )));
    }

    Ok(())
}

/// Strip every character outside `[A-Za-z0-9_-]`.
///
/// Stripping is lenient: `my api!` becomes `myapi`. Two different inputs can
/// therefore collide, which is caught by the name uniqueness check in the
/// store.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Deterministic fragment filename for a route
pub fn fragment_file_name(port: u16, name: &str) -> String {
    format!("{}-{}.conf", port, name)
}

pub fn fragment_path(routes_dir: &Path, port: u16, name: &str) -> PathBuf {
    routes_dir.join(fragment_file_name(port, name))
}

/// Include glob selecting every fragment of one port
pub fn fragment_glob(routes_dir: &Path, port: u16) -> PathBuf {
    routes_dir.join(format!("{}-*.conf", port))
}

/// Split `<port>-<name>.conf` back into its parts
pub fn parse_fragment_file_name(file_name: &str) -> Option<(u16, String)> {
    let stem = file_name.strip_suffix(".conf")?;
    let (port, name) = stem.split_once('-')?;
    let port: u16 = port.parse().ok()?;
    if name.is_empty() || sanitize_name(name) != name {
        return None;
    }
    Some((port, name.to_string()))
}

/// Render the `location` block for a route
pub fn render_fragment(name: &str, path: &str, backend_port: u16) -> String {
    format!(
        r#"{marker}{name}
location {path} {{
    proxy_pass http://127.0.0.1:{backend_port}/;
    proxy_http_version 1.1;
    proxy_set_header Upgrade $http_upgrade;
    proxy_set_header Connection "upgrade";
    proxy_set_header Host $host;
    proxy_set_header X-Real-IP $remote_addr;
    proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
    proxy_set_header X-Forwarded-Proto $scheme;
}}
"#,
        marker = FRAGMENT_MARKER,
        name = name,
        path = path,
        backend_port = backend_port,
    )
}

/// Route details recovered from fragment text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFragment {
    pub name: Option<String>,
    pub path: String,
    pub backend_port: u16,
}

/// Parse a fragment written by [`render_fragment`] (or by the older
/// generators, which lacked the marker comment).
pub fn parse_fragment(text: &str) -> Option<ParsedFragment> {
    let mut name = None;
    let mut path = None;
    let mut backend_port = None;

    for line in text.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(FRAGMENT_MARKER) {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("location ") {
            path = rest.strip_suffix('{').map(|p| p.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("proxy_pass ") {
            backend_port = rest
                .trim_end_matches(';')
                .trim_end_matches('/')
                .rsplit(':')
                .next()
                .and_then(|p| p.parse::<u16>().ok());
        }
    }

    Some(ParsedFragment {
        name,
        path: path?,
        backend_port: backend_port?,
    })
}
