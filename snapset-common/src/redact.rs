//! Masking of credentials in command lines before they are logged.

use once_cell::sync::Lazy;
use regex::Regex;

/// Replacement text for masked values.
pub const MASK: &str = "********";

static PASSWORD_FLAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(--?(?:(?i:password|passwd)|pw|p)[= ])("[^"]*"|'[^']*'|\S+)"#)
        .expect("static regex")
});

/// Mask the value of every `--password=`, `-password`, `-p` style argument.
pub fn mask_secrets(line: &str) -> String {
    PASSWORD_FLAG
        .replace_all(line, |caps: &regex::Captures<'_>| format!("{}{}", &caps[1], MASK))
        .into_owned()
}
