//! `${NAME}` placeholder expansion.
//!
//! Applied as a textual pass before JSON or YAML parsing. A placeholder is
//! replaced only when the variable is set and non-empty; otherwise the literal
//! `${NAME}` stays in place so a misconfiguration is visible downstream.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static ENV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env placeholder pattern"));

/// Replace `${NAME}` placeholders with environment values.
pub fn expand_env_vars(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

/// Expansion with an explicit lookup, so tests don't touch the process env.
pub fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_RE
        .replace_all(input, |caps: &Captures| {
            lookup(&caps[1])
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}
