//! Shell utility functions
//!
//! Commands are always executed as argument vectors; these helpers only turn
//! them into readable strings for logs and split configured command lines.

use std::env;

/// Escape a string for use in a shell command
///
/// Quotes only when necessary, using single quotes.
///
/// ```
/// use snapresize::common::shell::shell_quote;
///
/// assert_eq!(shell_quote("simple"), "simple");
/// assert_eq!(shell_quote("has spaces"), "'has spaces'");
/// assert_eq!(shell_quote("has'quote"), "'has'\\''quote'");
/// ```
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '=' | '/' | '.' | ':' | ','))
    {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Render a program and its arguments as one copy-pasteable line
pub fn render_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    std::iter::once(shell_quote(program))
        .chain(args.iter().map(|a| shell_quote(a.as_ref())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a configured command line (e.g. `sudo /usr/bin/snapresize`) into
/// program and leading arguments.
pub fn split_command(line: &str) -> anyhow::Result<(String, Vec<String>)> {
    let mut words = shell_words::split(line)?;
    if words.is_empty() {
        anyhow::bail!("empty command line");
    }
    let program = words.remove(0);
    Ok((program, words))
}

/// Get the current executable path as a shell-quoted command string.
/// Falls back to "snapresize" if the path cannot be determined.
pub fn current_exe_command() -> String {
    let exe = env::current_exe()
        .ok()
        .and_then(|path| path.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "snapresize".to_string());
    shell_quote(&exe)
}
