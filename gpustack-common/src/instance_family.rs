/// Instance-type family helpers shared by the collector and configuration.
///
/// Patterns are comma-separated, case-insensitive, with `*` matching any
/// substring (including empty). No other glob features are supported.
use crate::Architecture;

// Graviton GPU families (g5g.*) and any other `<family>g.` type run arm64.
pub const DEFAULT_ARM64_PATTERNS: &str = "g5g.*,*g.*,*gd.*,*gn.*";

/// Parse comma-separated patterns, dropping blanks.
/// Empty input yields the default arm64 patterns.
pub fn parse_patterns(raw: Option<&str>) -> Vec<String> {
    let out: Vec<String> = raw
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if out.is_empty() {
        return DEFAULT_ARM64_PATTERNS
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();
    }
    out
}

/// True if `pattern` matches the whole of `candidate`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut segments = pattern.split('*');
    // split always yields at least one element
    let head = segments.next().unwrap_or("");
    if !candidate.starts_with(head) {
        return false;
    }
    let mut rest = &candidate[head.len()..];
    let tail: Vec<&str> = segments.collect();
    let Some((last, middle)) = tail.split_last() else {
        // no '*' at all: exact match
        return rest.is_empty();
    };
    for seg in middle {
        match rest.find(seg) {
            Some(pos) => rest = &rest[pos + seg.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Return true if `instance_type` matches at least one pattern.
pub fn matches_any(instance_type: &str, patterns: &[String]) -> bool {
    let it = instance_type.trim().to_ascii_lowercase();
    if it.is_empty() {
        return false;
    }
    patterns
        .iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .any(|p| glob_match(&p, &it))
}

/// Architecture for a type without an explicit profile entry.
pub fn infer_architecture(instance_type: &str, arm64_patterns: &[String]) -> Architecture {
    if matches_any(instance_type, arm64_patterns) {
        Architecture::Arm64
    } else {
        Architecture::X86_64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pats(raw: &str) -> Vec<String> {
        parse_patterns(Some(raw))
    }

    #[test]
    fn exact_and_wildcards() {
        assert!(matches_any("g4dn.xlarge", &pats("g4dn.xlarge")));
        assert!(matches_any("G4DN.XLARGE", &pats("g4dn.*")));
        assert!(matches_any("g5.2xlarge", &pats("*.2xlarge")));
        assert!(matches_any("g5g.xlarge", &pats("g*g.*")));
        assert!(matches_any("anything", &pats("*")));
        assert!(!matches_any("g4dn.xlarge", &pats("g5.*")));
        assert!(!matches_any("g4dn.xlarge", &pats("g4dn")));
        assert!(!matches_any("", &pats("*")));
    }

    #[test]
    fn defaults_when_blank() {
        assert_eq!(parse_patterns(None).len(), 4);
        assert_eq!(parse_patterns(Some(" , ")).len(), 4);
        assert_eq!(parse_patterns(Some("a, b")), vec!["a", "b"]);
    }

    #[test]
    fn arm64_inference() {
        let defaults = parse_patterns(None);
        assert_eq!(infer_architecture("g5g.xlarge", &defaults), Architecture::Arm64);
        assert_eq!(infer_architecture("c7g.large", &defaults), Architecture::Arm64);
        assert_eq!(infer_architecture("g4dn.xlarge", &defaults), Architecture::X86_64);
        assert_eq!(infer_architecture("g5.xlarge", &defaults), Architecture::X86_64);
        assert_eq!(infer_architecture("p3.2xlarge", &defaults), Architecture::X86_64);
    }
}
