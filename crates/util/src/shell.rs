//! POSIX shell quoting for command lines handed to remote shells.
//!
//! Every command gauntlet runs on a guest goes through one more shell than
//! the caller wrote it for (the login shell spawned by sshd, or `sh -c` on
//! the local transport), so arguments must be quoted exactly once here.

/// Quote one word for a POSIX shell.
///
/// Plain words pass through untouched; everything else is wrapped in single
/// quotes with embedded single quotes escaped via the `'\''` idiom.
///
/// # Example
/// ```rust
/// use gauntlet_util::shell::quote;
///
/// assert_eq!(quote("simple-word"), "simple-word");
/// assert_eq!(quote("two words"), "'two words'");
/// assert_eq!(quote("it's"), "'it'\\''s'");
/// ```
pub fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_safe_char) {
        return word.to_string();
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('\'');
    for ch in word.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Join words into one command line, quoting each as needed.
pub fn join_command<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|word| quote(word.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_safe_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-' | '_')
}
