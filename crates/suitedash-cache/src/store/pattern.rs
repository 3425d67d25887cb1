//! Glob-style key patterns (`*` and `?`), as understood by `SCAN ... MATCH`.

use regex::Regex;

/// Compiles a glob pattern into an anchored regex for the local backend.
///
/// A backslash makes the following character literal.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut literal = String::new();
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    literal.push(escaped);
                }
            }
            '*' | '?' => {
                re.push_str(&regex::escape(&literal));
                literal.clear();
                re.push_str(if ch == '*' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    re.push_str(&regex::escape(&literal));
    re.push('$');
    Regex::new(&re)
}

/// Escapes glob wildcards inside a literal key fragment.
pub fn escape_glob(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    for ch in fragment.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_star_matches_tail() {
        let re = glob_to_regex("suites:list:*").unwrap();
        assert!(re.is_match("suites:list:skip:0:limit:10"));
        assert!(!re.is_match("suite:42"));
        assert!(!re.is_match("xsuites:list:skip:0"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let re = glob_to_regex("run:?").unwrap();
        assert!(re.is_match("run:7"));
        assert!(!re.is_match("run:17"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let re = glob_to_regex("a.b(c)*").unwrap();
        assert!(re.is_match("a.b(c)tail"));
        assert!(!re.is_match("axb(c)tail"));
    }

    #[test]
    fn escape_glob_protects_wildcards() {
        assert_eq!(escape_glob("ns*"), "ns\\*");
        assert_eq!(escape_glob("plain"), "plain");

        let re = glob_to_regex(&format!("{}:*", escape_glob("ns*"))).unwrap();
        assert!(re.is_match("ns*:key"));
        assert!(!re.is_match("nsx:key"));
    }
}
