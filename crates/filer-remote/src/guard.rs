//! Shell injection guard for commands sent over a remote session
//!
//! Commands handed to an SSH session end up being interpreted by a remote
//! shell, so every argument is checked before dispatch. The rules are
//! conservative and do not attempt to parse shell grammar:
//!
//! - A quoted argument (`'...'` or `"..."`) may contain spaces, but any quote
//!   inside it must be escaped with a backslash.
//! - An unquoted argument must be a single word.
//! - Shell metacharacters (`` ` ``, `$`, `|`, `;`, `&`, `>`, `<` and their
//!   doubled forms) must be escaped with a backslash wherever they appear.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

const SSH_INJECTION_PATTERN: [&str; 10] = ["`", "$", "|", "||", ";", "&", "&&", ">", ">>", "<"];

// A quote preceded by anything other than a backslash
static UNESCAPED_QUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[^\\]['"]"#).unwrap());

/// Validate every argument of `command`, returning
/// [`Error::InjectionThreat`] naming the whole command on the first failure.
pub fn check_ssh_injection(command: &[impl AsRef<str>]) -> Result<()> {
    for arg in command {
        if !is_safe_argument(arg.as_ref()) {
            tracing::warn!("Rejected remote command argument {:?}", arg.as_ref());
            return Err(Error::injection(command));
        }
    }

    Ok(())
}

fn is_safe_argument(arg: &str) -> bool {
    let arg = arg.trim();

    match quoted_inner(arg) {
        Some(inner) => {
            if !inner.is_empty()
                && (inner.starts_with(['\'', '"']) || UNESCAPED_QUOTE.is_match(inner))
            {
                return false;
            }
        }
        None => {
            // Spaces are only allowed inside quotes
            if arg.split_whitespace().nth(1).is_some() {
                return false;
            }
        }
    }

    SSH_INJECTION_PATTERN
        .iter()
        .all(|pattern| !has_unescaped(arg, pattern))
}

/// The content between matching outer quotes, if `arg` is wrapped in them
fn quoted_inner(arg: &str) -> Option<&str> {
    let quote = arg.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    if arg.len() < 2 || !arg.ends_with(quote) {
        return None;
    }
    // Quoting never spans lines
    let inner = &arg[1..arg.len() - 1];
    (!inner.contains(['\n', '\r'])).then_some(inner)
}

fn has_unescaped(arg: &str, pattern: &str) -> bool {
    arg.match_indices(pattern)
        .any(|(pos, _)| pos == 0 || !arg[..pos].ends_with('\\'))
}
