//! `--file` attachments folded into the task text

use shellcraft_core::{convert_windows_paths, Error, Result};
use std::path::{Path, PathBuf};

/// Task sent to the model. Without files the request goes out as typed;
/// otherwise each file becomes a `<FILE>` block of numbered lines followed
/// by the request inside `<USERASK>`.
pub fn compose_task(files: &[PathBuf], ask: &str) -> Result<String> {
    if files.is_empty() {
        return Ok(ask.to_string());
    }

    let mut parts = Vec::with_capacity(files.len() + 1);
    for path in files {
        parts.push(file_block(path)?);
    }
    parts.push(format!("<USERASK>{}</USERASK>", ask));
    Ok(parts.join("\n"))
}

fn file_block(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| {
        Error::from(e)
            .with_operation("cli::attach_file")
            .with_context("path", path.display().to_string())
    })?;
    let text = String::from_utf8_lossy(&bytes);

    let shown = path.display().to_string();
    let numbered: Vec<String> = text
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{}: {}", i + 1, line))
        .collect();

    Ok(format!(
        "<FILE PATH=\"{}\">\n{}\n</FILE>",
        convert_windows_paths(&shown),
        numbered.join("\n")
    ))
}
