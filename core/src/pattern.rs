//! Name matching with `*` wildcards, shared by queue filtering and handler lookup.

use regex::Regex;

/// A literal name or a glob where `*` matches any run of characters
#[derive(Debug, Clone)]
pub struct NamePattern {
    raw: String,
    glob: Option<Regex>,
}

impl NamePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let glob = if raw.contains('*') {
            let source = format!("^{}$", regex::escape(&raw).replace(r"\*", ".*"));
            Regex::new(&source).ok()
        } else {
            None
        };

        Self { raw, glob }
    }

    /// Pattern matching only `name` itself, stars included
    pub fn literal(name: impl Into<String>) -> Self {
        Self {
            raw: name.into(),
            glob: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.glob.is_some()
    }

    /// Exact comparison first, then the glob when there is one
    pub fn matches(&self, name: &str) -> bool {
        if self.raw == name {
            return true;
        }

        self.glob
            .as_ref()
            .map(|glob| glob.is_match(name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_glob_matching() {
        assert!(NamePattern::new("emails").matches("emails"));
        assert!(!NamePattern::new("emails").matches("emails-eu"));

        let glob = NamePattern::new("emails*");
        assert!(glob.is_wildcard());
        assert!(glob.matches("emails"));
        assert!(glob.matches("emails-eu"));
        assert!(!glob.matches("reports"));

        assert!(NamePattern::new("*-eu").matches("emails-eu"));
        assert!(NamePattern::new("a.b*").matches("a.bc"));
        assert!(!NamePattern::new("a.b*").matches("axbc"));
    }
}
