//! Windows path rewriting for Git Bash
//!
//! Models often emit `C:\Users\me\file.txt` even when told they are in a
//! POSIX shell. Git Bash wants `/c/Users/me/file.txt`.

use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::OnceLock;

fn drive_path() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `\b` keeps URL schemes such as `https://` out of the match.
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z]):[\\/](\S*)").expect("valid regex"))
}

/// Rewrite drive-letter paths into Git Bash form. Borrows when nothing changes.
pub fn convert_windows_paths(command: &str) -> Cow<'_, str> {
    drive_path().replace_all(command, |caps: &Captures<'_>| {
        let drive = caps[1].to_ascii_lowercase();
        let rest = caps[2].replace('\\', "/");
        format!("/{}/{}", drive, rest)
    })
}
