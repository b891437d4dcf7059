//! Glob matching for host exclusion lists
//!
//! `*` matches any run of characters (including none), `?` matches exactly
//! one character, everything else matches itself. Matching always covers the
//! whole text.
//!
//! The matcher simulates the pattern as a non-deterministic automaton: one
//! state per pattern position, advanced one character at a time. A terminator
//! symbol is fed after the last character so that trailing `*` positions are
//! resolved the same way as inner ones.

use std::iter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Star,
    AnyOne,
    Literal(char),
    End,
}

impl From<char> for Token {
    fn from(c: char) -> Self {
        match c {
            '*' => Self::Star,
            '?' => Self::AnyOne,
            other => Self::Literal(other),
        }
    }
}

/// Returns `true` when `text` matches the glob `pattern`.
///
/// ```
/// use httpaccess::pattern::matches;
///
/// assert!(matches("*.paris.mdp", "api.paris.mdp"));
/// assert!(!matches("*.paris.mdp", "paris.mdp"));
/// assert!(matches("a?c", "abc"));
/// ```
#[must_use]
pub fn matches(pattern: &str, text: &str) -> bool {
    let tokens: Vec<Token> = pattern
        .chars()
        .map(Token::from)
        .chain(iter::once(Token::End))
        .collect();
    let accept = tokens.len();

    let mut current = vec![false; accept + 1];
    let mut next = vec![false; accept + 1];
    current[0] = true;

    // `None` is the terminator
    for input in text.chars().map(Some).chain(iter::once(None)) {
        next.fill(false);

        for position in 0..accept {
            if !current[position] {
                continue;
            }
            match tokens[position] {
                Token::Star => {
                    // epsilon move, visited later in this same pass
                    current[position + 1] = true;
                    next[position] = true;
                    next[position + 1] = true;
                }
                Token::AnyOne => {
                    if input.is_some() {
                        next[position + 1] = true;
                    }
                }
                Token::Literal(expected) => {
                    if input == Some(expected) {
                        next[position + 1] = true;
                    }
                }
                Token::End => {
                    if input.is_none() {
                        next[position + 1] = true;
                    }
                }
            }
        }

        std::mem::swap(&mut current, &mut next);
    }

    current[accept]
}

/// Returns `true` when `text` matches at least one of `patterns`.
#[must_use]
pub fn matches_any<I, S>(patterns: I, text: &str) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .any(|pattern| matches(pattern.as_ref(), text))
}
