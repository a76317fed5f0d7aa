//! Shell-style wildcards in scp source paths.
//!
//! `*` matches any run of characters, `?` any single character and
//! `[...]` a character class (`[^...]` negated, `a-z` ranges). A backslash
//! makes the next character literal.

use std::iter::Peekable;
use std::str::Chars;

use glob::{MatchOptions, Pattern, PatternError};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn is_wildcard_char(c: char) -> bool {
    matches!(c, '*' | '?' | '[' | ']')
}

/// Strips escapes from `wildcard`. Returns `None` if it contains any
/// unescaped wildcard character, i.e. it is a pattern rather than a
/// literal path.
pub fn unescape(wildcard: &str) -> Option<String> {
    let mut output = String::with_capacity(wildcard.len());
    let mut chars = wildcard.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            // a lone trailing backslash is dropped
            if let Some(escaped) = chars.next() {
                output.push(escaped);
            }
        } else if is_wildcard_char(c) {
            return None;
        } else {
            output.push(c);
        }
    }
    Some(output)
}

/// A compiled wildcard matched against single path components.
#[derive(Debug, Clone)]
pub struct Wildcard {
    source: String,
    pattern: Pattern,
}

impl Wildcard {
    pub fn new(wildcard: &str) -> Result<Self, PatternError> {
        Ok(Self {
            source: wildcard.to_string(),
            pattern: Pattern::new(&translate(wildcard))?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.matches_with(name, MATCH_OPTIONS)
    }
}

/// Rewrites a wildcard into `glob` syntax. Escaped characters become
/// literals, runs of `*` collapse to one (`glob` reserves `**`) and classes
/// go through [`translate_class`].
fn translate(wildcard: &str) -> String {
    let mut out = String::with_capacity(wildcard.len() + 8);
    let mut chars = wildcard.chars().peekable();
    let mut after_star = false;

    while let Some(c) = chars.next() {
        match c {
            '*' if after_star => continue,
            '*' => out.push('*'),
            '\\' => {
                let Some(escaped) = chars.next() else {
                    break;
                };
                out.push_str(&Pattern::escape(&escaped.to_string()));
            }
            '[' => translate_class(&mut chars, &mut out),
            _ => out.push(c),
        }
        after_star = c == '*';
    }
    out
}

/// Copies one character class, the opening `[` already consumed.
///
/// `glob` has no escapes inside a class, so escaped `]`, `-` and `!` are
/// moved to the positions where it reads them literally: `]` first, `-`
/// last and `!` anywhere but first.
fn translate_class(chars: &mut Peekable<Chars<'_>>, out: &mut String) {
    let negated = chars.next_if_eq(&'^').is_some();
    let mut body = String::new();
    let mut bracket = false;
    let mut dash = false;
    let mut closed = false;

    while let Some(c) = chars.next() {
        match c {
            ']' => {
                closed = true;
                break;
            }
            '\\' => match chars.next() {
                Some(']') => bracket = true,
                Some('-') => dash = true,
                Some(escaped) => body.push(escaped),
                None => break,
            },
            _ => body.push(c),
        }
    }

    out.push('[');
    if negated {
        out.push('!');
    }
    if bracket {
        out.push(']');
    } else if let Some(rest) = body.strip_prefix('!') {
        body = format!("{rest}!");
    }
    out.push_str(&body);
    if dash {
        out.push('-');
    }
    if closed {
        out.push(']');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("plain/path.txt").as_deref(), Some("plain/path.txt"));
        assert_eq!(unescape(r"odd\*name").as_deref(), Some("odd*name"));
        assert_eq!(unescape(r"back\\slash").as_deref(), Some(r"back\slash"));
        assert_eq!(unescape("dir/*.txt"), None);
        assert_eq!(unescape("file?"), None);
        assert_eq!(unescape("[ab]"), None);
    }

    #[test]
    fn test_star_and_question() {
        let w = Wildcard::new("foo*.txt").unwrap();
        assert!(w.matches("foo1.txt"));
        assert!(w.matches("foo.txt"));
        assert!(!w.matches("bar.txt"));
        assert!(!w.matches("foo1.txt.bak"));

        let w = Wildcard::new("a?c").unwrap();
        assert!(w.matches("abc"));
        assert!(!w.matches("ac"));
    }

    #[test]
    fn test_classes() {
        let w = Wildcard::new("[a-c]x").unwrap();
        assert!(w.matches("bx"));
        assert!(!w.matches("dx"));

        let w = Wildcard::new("[^a-c]x").unwrap();
        assert!(!w.matches("bx"));
        assert!(w.matches("dx"));
    }

    #[test]
    fn test_escapes() {
        let w = Wildcard::new(r"lit\*eral*").unwrap();
        assert!(w.matches("lit*eral"));
        assert!(w.matches("lit*eral2"));
        assert!(!w.matches("litXeral"));
        assert_eq!(w.as_str(), r"lit\*eral*");
    }

    #[test]
    fn test_dotfiles_match() {
        let w = Wildcard::new("*").unwrap();
        assert!(w.matches(".hidden"));
    }

    #[test]
    fn test_repeated_stars() {
        let w = Wildcard::new("a**b").unwrap();
        assert!(w.matches("ab"));
        assert!(w.matches("axyzb"));
        assert!(!w.matches("axyzc"));

        let w = Wildcard::new(r"a*\**").unwrap();
        assert!(w.matches("a*"));
        assert!(w.matches("ab*cd"));
        assert!(!w.matches("ab"));
    }

    #[test]
    fn test_escapes_inside_class() {
        let w = Wildcard::new(r"[\]x]").unwrap();
        assert!(w.matches("]"));
        assert!(w.matches("x"));
        assert!(!w.matches("["));

        let w = Wildcard::new(r"[a\-z]").unwrap();
        assert!(w.matches("a"));
        assert!(w.matches("-"));
        assert!(w.matches("z"));
        assert!(!w.matches("m"));

        let w = Wildcard::new(r"[\!a]").unwrap();
        assert!(w.matches("!"));
        assert!(w.matches("a"));
        assert!(!w.matches("b"));

        let w = Wildcard::new(r"[^\]]").unwrap();
        assert!(!w.matches("]"));
        assert!(w.matches("a"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(Wildcard::new("[abc").is_err());
    }
}
