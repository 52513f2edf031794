//! Glob/regex rule compilation (section 3 "Compiled regex", section 4.3).
//! Glob semantics: `.` -> literal, `*` -> `.*`, `?` -> `.`, `|` -> alternation,
//! implicit `^...$` anchors. A leading `!` negates the match. A leading `re:`
//! passes the remainder through as a raw regex (still anchored is NOT
//! implied in that case, matching `config.go`'s `regex()`, which only
//! anchors the glob-derived pattern).

use regex::Regex;

#[derive(Debug, Clone)]
pub struct CompiledRegex {
    pub pattern: Regex,
    pub source: String,
    pub negate: bool,
}

impl CompiledRegex {
    pub fn compile(rule: &str) -> anyhow::Result<Self> {
        let (negate, rest) = match rule.strip_prefix('!') {
            Some(r) => (true, r),
            None => (false, rule),
        };

        let source = if let Some(raw) = rest.strip_prefix("re:") {
            raw.to_string()
        } else {
            let escaped = rest.replace('.', "\\.").replace('*', ".*").replace('?', ".");
            let alternated = escaped.replace('|', "$|^");
            format!("^{alternated}$")
        };

        let pattern = Regex::new(&source)?;
        Ok(CompiledRegex { pattern, source, negate })
    }

    /// `matches` is true when the underlying pattern matches XOR `negate`.
    pub fn is_match(&self, candidate: &str) -> bool {
        self.pattern.is_match(candidate) != self.negate
    }

    /// Which of the three candidate strings (url / host:port / host) this
    /// rule is evaluated against is decided by which separator appears in
    /// the *source* pattern, per `config.go`'s `match()`.
    pub fn candidate_kind(&self) -> CandidateKind {
        if self.source.contains('/') {
            CandidateKind::Url
        } else if self.source.contains(':') {
            CandidateKind::HostPort
        } else {
            CandidateKind::Host
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Url,
    HostPort,
    Host,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_any_suffix() {
        let re = CompiledRegex::compile("*.example.com").unwrap();
        assert!(re.is_match("www.example.com"));
        assert!(!re.is_match("example.org"));
    }

    #[test]
    fn negation_flips_result() {
        let re = CompiledRegex::compile("!*.internal").unwrap();
        assert!(re.is_match("public.host"));
        assert!(!re.is_match("svc.internal"));
    }

    #[test]
    fn raw_regex_prefix_is_passed_through_unanchored() {
        let re = CompiledRegex::compile("re:example\\.(com|org)").unwrap();
        assert!(re.is_match("go to example.com now"));
    }

    #[test]
    fn pipe_becomes_alternation_between_anchors() {
        let re = CompiledRegex::compile("foo|bar").unwrap();
        assert!(re.is_match("foo"));
        assert!(re.is_match("bar"));
        assert!(!re.is_match("foobar"));
    }

    #[test]
    fn candidate_kind_follows_pattern_separators() {
        assert_eq!(CompiledRegex::compile("*/path").unwrap().candidate_kind(), CandidateKind::Url);
        assert_eq!(CompiledRegex::compile("host:443").unwrap().candidate_kind(), CandidateKind::HostPort);
        assert_eq!(CompiledRegex::compile("host").unwrap().candidate_kind(), CandidateKind::Host);
    }
}
