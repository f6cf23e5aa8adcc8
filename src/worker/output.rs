//! Local layout of tool output files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::orchestrator::ToolRecord;

/// Placeholder the orchestrator leaves in command lines for the output path.
pub const OUTPUT_PLACEHOLDER: &str = "|outputDir|";

/// Make a value safe to use as one path segment: `/`, space and `:` become `_`.
pub fn sanitize_segment(value: &str) -> String {
    value.replace(['/', ' ', ':'], "_")
}

/// Directory for a tool's results:
/// `<root>/<pentest>/<tool>/<wave>/<scope>/<ip>/<port>/`, empty parts skipped.
/// Non-tcp ports live under `<proto>_<port>`.
pub fn output_dir(root: &Path, pentest: &str, tool: &ToolRecord) -> PathBuf {
    let mut dir = root.join(sanitize_segment(pentest));
    dir.push(sanitize_segment(&tool.name));
    for part in [&tool.wave, &tool.scope, &tool.ip] {
        if !part.is_empty() {
            dir.push(sanitize_segment(part));
        }
    }
    if !tool.port.is_empty() {
        let port_dir = if tool.proto == "tcp" || tool.proto.is_empty() {
            tool.port.clone()
        } else {
            format!("{}/{}", tool.proto, tool.port)
        };
        dir.push(sanitize_segment(&port_dir));
    }
    dir
}

/// Output path (without extension) of one run of `tool_name`.
pub fn output_stem(dir: &Path, tool_name: &str, now: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "{}_{}",
        sanitize_segment(tool_name),
        now.timestamp_millis()
    ))
}

/// Create `dir` and its parents. An existing directory is fine.
pub async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Substitute the output placeholder in a crafted command line.
pub fn substitute_output(command: &str, stem: &Path) -> String {
    command.replace(OUTPUT_PLACEHOLDER, &stem.to_string_lossy())
}
