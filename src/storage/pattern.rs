//! Glob patterns for KEYS and SCAN MATCH.
//!
//! Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes, matched
//! against raw key bytes. Patterns are validated once when compiled so a
//! malformed pattern becomes a client error instead of a silent non-match.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("unterminated character class in pattern")]
    UnclosedClass,

    #[error("pattern ends with a dangling escape")]
    DanglingEscape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(u8),
    AnyOne,
    AnyRun,
    Class {
        negated: bool,
        items: Vec<(u8, u8)>,
    },
}

impl Token {
    fn matches_byte(&self, b: u8) -> bool {
        match self {
            Token::Literal(c) => *c == b,
            Token::AnyOne => true,
            Token::AnyRun => true,
            Token::Class { negated, items } => {
                let hit = items.iter().any(|&(lo, hi)| lo <= b && b <= hi);
                hit != *negated
            }
        }
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    tokens: Vec<Token>,
}

impl GlobPattern {
    pub fn compile(pattern: &[u8]) -> Result<Self, PatternError> {
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < pattern.len() {
            match pattern[i] {
                b'*' => {
                    // Consecutive stars behave like one.
                    if tokens.last() != Some(&Token::AnyRun) {
                        tokens.push(Token::AnyRun);
                    }
                }
                b'?' => tokens.push(Token::AnyOne),
                b'\\' => {
                    i += 1;
                    let &c = pattern.get(i).ok_or(PatternError::DanglingEscape)?;
                    tokens.push(Token::Literal(c));
                }
                b'[' => {
                    let (token, next) = compile_class(pattern, i + 1)?;
                    tokens.push(token);
                    i = next;
                }
                c => tokens.push(Token::Literal(c)),
            }
            i += 1;
        }
        Ok(Self { tokens })
    }

    /// True for the pattern `*`, which every key matches.
    pub fn matches_all(&self) -> bool {
        self.tokens == [Token::AnyRun]
    }

    /// Iterative matcher with single-star backtracking.
    pub fn matches(&self, text: &[u8]) -> bool {
        let (mut p, mut t) = (0, 0);
        let mut star: Option<(usize, usize)> = None;

        while t < text.len() {
            match self.tokens.get(p) {
                Some(Token::AnyRun) => {
                    star = Some((p, t));
                    p += 1;
                }
                Some(token) if token.matches_byte(text[t]) => {
                    p += 1;
                    t += 1;
                }
                _ => match star {
                    Some((sp, st)) => {
                        p = sp + 1;
                        t = st + 1;
                        star = Some((sp, st + 1));
                    }
                    None => return false,
                },
            }
        }
        self.tokens[p..].iter().all(|tok| *tok == Token::AnyRun)
    }
}

/// Parses a `[...]` class starting just after the bracket. Returns the token
/// and the index of the closing bracket.
fn compile_class(pattern: &[u8], mut i: usize) -> Result<(Token, usize), PatternError> {
    let negated = pattern.get(i) == Some(&b'^');
    if negated {
        i += 1;
    }
    let mut items = Vec::new();
    loop {
        let &c = pattern.get(i).ok_or(PatternError::UnclosedClass)?;
        match c {
            b']' => return Ok((Token::Class { negated, items }, i)),
            b'\\' => {
                i += 1;
                let &escaped = pattern.get(i).ok_or(PatternError::UnclosedClass)?;
                items.push((escaped, escaped));
            }
            lo if pattern.get(i + 1) == Some(&b'-')
                && pattern.get(i + 2).is_some_and(|&hi| hi != b']') =>
            {
                let hi = pattern[i + 2];
                items.push((lo.min(hi), lo.max(hi)));
                i += 2;
            }
            single => items.push((single, single)),
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> GlobPattern {
        GlobPattern::compile(p.as_bytes()).unwrap()
    }

    #[test]
    fn test_star_and_question() {
        let p = glob("h*llo");
        assert!(p.matches(b"hello"));
        assert!(p.matches(b"hllo"));
        assert!(p.matches(b"heeeello"));
        assert!(!p.matches(b"world"));

        let p = glob("h?llo");
        assert!(p.matches(b"hallo"));
        assert!(!p.matches(b"hllo"));
        assert!(!p.matches(b"heello"));

        assert!(glob("*").matches(b""));
        assert!(glob("*").matches_all());
        assert!(glob("user:*:name").matches(b"user:42:name"));
        assert!(!glob("user:*:name").matches(b"user:42:age"));
    }

    #[test]
    fn test_classes() {
        let p = glob("h[ae]llo");
        assert!(p.matches(b"hello"));
        assert!(!p.matches(b"hillo"));

        let p = glob("h[^e]llo");
        assert!(p.matches(b"hallo"));
        assert!(!p.matches(b"hello"));

        let p = glob("key[0-9]");
        assert!(p.matches(b"key7"));
        assert!(!p.matches(b"keyx"));
    }

    #[test]
    fn test_escape() {
        let p = glob("a\\*b");
        assert!(p.matches(b"a*b"));
        assert!(!p.matches(b"axb"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!(
            GlobPattern::compile(b"abc["),
            Err(PatternError::UnclosedClass)
        );
        assert_eq!(
            GlobPattern::compile(b"abc\\"),
            Err(PatternError::DanglingEscape)
        );
    }
}
