//! Shell-like command specs (`limactl shell crucible-worker -- microvmctl`).
//!
//! Tokenizing follows POSIX-shell quoting closely enough for command specs:
//! single quotes are literal, double quotes group, a backslash escapes the
//! next character outside single quotes. No expansion besides a leading `~`.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A parsed command: binary, leading arguments and the original string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub display: String,
}

impl CommandSpec {
    /// Resolve a spec from a configured value, falling back to `fallback`.
    ///
    /// `name` identifies the setting in error messages.
    pub fn resolve(name: &str, configured: Option<&str>, fallback: &str) -> Result<Self> {
        let raw = configured
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
            .trim();
        let mut tokens = split_command_spec(raw)?.into_iter();
        let binary = tokens.next().ok_or_else(|| Error::EmptyCommandSpec {
            name: name.to_string(),
        })?;
        Ok(Self {
            binary: expand_home(&binary),
            args: tokens.collect(),
            display: raw.to_string(),
        })
    }

    /// Build a spec from an already tokenized program and arguments.
    #[must_use]
    pub fn from_parts(binary: impl Into<String>, args: Vec<String>) -> Self {
        let binary = binary.into();
        let display = std::iter::once(binary.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            binary,
            args,
            display,
        }
    }

    /// Final path component of the binary (`/opt/bin/limactl` -> `limactl`).
    #[must_use]
    pub fn binary_name(&self) -> &str {
        Path::new(&self.binary)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.binary)
    }
}

/// Split a command spec into tokens.
pub fn split_command_spec(spec: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in spec.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        if ch == '\\' && quote != Some('\'') {
            escaped = true;
            continue;
        }

        if let Some(q) = quote {
            if ch == q {
                quote = None;
            } else {
                current.push(ch);
            }
            continue;
        }

        if ch == '"' || ch == '\'' {
            quote = Some(ch);
            continue;
        }

        if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            continue;
        }

        current.push(ch);
    }

    if escaped {
        current.push('\\');
    }
    if let Some(quote) = quote {
        return Err(Error::UnmatchedQuote { quote });
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Expand a leading `~` against `HOME` (or `USERPROFILE`).
#[must_use]
pub fn expand_home(path: &str) -> String {
    let home = std::env::var("HOME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("USERPROFILE").ok().filter(|h| !h.is_empty()));
    expand_home_with(path, home.as_deref())
}

/// Expand a leading `~` against the given home directory.
#[must_use]
pub fn expand_home_with(path: &str, home: Option<&str>) -> String {
    if !path.starts_with('~') {
        return path.to_string();
    }
    let Some(home) = home else {
        return path.to_string();
    };
    if path == "~" {
        return home.to_string();
    }
    match path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        Some(rest) => PathBuf::from(home).join(rest).to_string_lossy().into_owned(),
        None => path.to_string(),
    }
}

/// Whether `command` resolves to an existing file.
///
/// Commands containing a path separator are checked literally; bare names are
/// searched on `PATH` (honoring `PATHEXT` on Windows).
#[must_use]
pub fn command_exists(command: &str) -> bool {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    command_exists_in(command, &path_var)
}

/// Like [`command_exists`], searching the given `PATH` value instead of the
/// process environment.
#[must_use]
pub fn command_exists_in(command: &str, path_var: &std::ffi::OsStr) -> bool {
    if command.is_empty() {
        return false;
    }
    if command.contains('/') || command.contains('\\') {
        return Path::new(&expand_home(command)).exists();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(command, Some(path_var), cwd).is_ok()
}
