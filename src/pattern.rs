//! Key patterns for invalidation
//!
//! Glob patterns (`*`, `?`, `[...]`) are compiled to anchored regexes for the
//! in-process tiers. The relational tier hands the raw glob to SQLite's `GLOB`
//! operator, which has the same semantics.

use regex::Regex;

/// Compiled glob pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    glob: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile a glob.
    ///
    /// # Errors
    ///
    /// Returns an error if the translated expression is not a valid regex
    /// (e.g. an unterminated character class).
    pub fn new(glob: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&glob_to_regex(glob))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn as_glob(&self) -> &str {
        &self.glob
    }

    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

/// Selector used by tag/pattern invalidation
#[derive(Debug, Clone)]
pub enum KeyFilter {
    /// Keys carrying at least one of the tags
    Tags(Vec<String>),
    /// Keys matching the glob
    Pattern(GlobPattern),
}

impl KeyFilter {
    #[must_use]
    pub fn matches(&self, key: &str, tags: &std::collections::BTreeSet<String>) -> bool {
        match self {
            Self::Tags(wanted) => wanted.iter().any(|t| tags.contains(t)),
            Self::Pattern(pattern) => pattern.matches(key),
        }
    }
}

/// Translate a glob into an anchored regular expression
#[must_use]
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 12);
    // SQLite's `*` and `?` also match newlines
    out.push_str("(?s)^");
    let mut in_class = false;

    for ch in glob.chars() {
        if in_class {
            match ch {
                ']' => {
                    in_class = false;
                    out.push(']');
                }
                '\\' => out.push_str("\\\\"),
                _ => out.push(ch),
            }
            continue;
        }
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                in_class = true;
                out.push('[');
            }
            _ => out.push_str(&regex::escape(&ch.to_string())),
        }
    }

    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> GlobPattern {
        GlobPattern::new(p).unwrap_or_else(|e| panic!("bad glob {p}: {e}"))
    }

    #[test]
    fn test_star_and_question() {
        let p = glob("student_profile:*");
        assert!(p.matches("student_profile:42"));
        assert!(p.matches("student_profile:"));
        assert!(!p.matches("tutor_profile:42"));

        let p = glob("lesson:?");
        assert!(p.matches("lesson:7"));
        assert!(!p.matches("lesson:42"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = glob("a.b+(c)");
        assert!(p.matches("a.b+(c)"));
        assert!(!p.matches("aXb+(c)"));
    }

    #[test]
    fn test_wildcards_span_newlines() {
        assert!(glob("note:*").matches("note:first\nsecond"));
        assert!(glob("a?b").matches("a\nb"));
        assert!(!glob("a?b").matches("a\n\nb"));
    }

    #[test]
    fn test_character_class() {
        let p = glob("class:[ab]*");
        assert!(p.matches("class:a1"));
        assert!(p.matches("class:b"));
        assert!(!p.matches("class:c"));
    }
}
