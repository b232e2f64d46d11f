/// Security Scanner - Pre-Admission Source Checks
///
/// Every submission is scanned before it may consume a slot. A rule is a
/// named regular expression; a submission matching any rule is rejected and
/// the rule names are reported as its violations.
///
/// Rules come from `security.deny` in languages.json, or from the built-in
/// set below when a language does not configure its own. Two checks apply
/// regardless of the rule set: the source size limit and NUL bytes.
///
/// Scanning is pure and deterministic. Rules are compiled once at startup;
/// a pattern that does not compile fails startup instead of failing jobs.

use crate::config::{LanguageConfigManager, SecurityRule, DEFAULT_MAX_SOURCE_BYTES};
use anyhow::{Context, Result};
use proctor_common::types::Language;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug)]
struct CompiledRule {
    name: String,
    regex: Regex,
}

#[derive(Debug)]
struct LanguageRules {
    max_source_bytes: usize,
    rules: Vec<CompiledRule>,
}

/// Outcome of scanning one submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub violations: Vec<String>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug)]
pub struct SecurityScanner {
    languages: HashMap<Language, LanguageRules>,
}

impl SecurityScanner {
    /// Compile the rule sets of every configured language
    pub fn new(config: &LanguageConfigManager) -> Result<Self> {
        let mut languages = HashMap::new();

        for lang in config.iter() {
            let (max_source_bytes, rules) = match &lang.security {
                Some(policy) => (policy.max_source_bytes, policy.deny.clone()),
                None => (DEFAULT_MAX_SOURCE_BYTES, default_rules(lang.name)),
            };

            let compiled = rules
                .into_iter()
                .map(|rule| {
                    let regex = Regex::new(&rule.pattern).with_context(|| {
                        format!(
                            "Invalid security rule '{}' for language '{}'",
                            rule.name, lang.name
                        )
                    })?;
                    Ok(CompiledRule {
                        name: rule.name,
                        regex,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            languages.insert(
                lang.name,
                LanguageRules {
                    max_source_bytes,
                    rules: compiled,
                },
            );
        }

        Ok(Self { languages })
    }

    pub fn rule_count(&self, language: Language) -> usize {
        self.languages
            .get(&language)
            .map(|l| l.rules.len())
            .unwrap_or(0)
    }

    /// Scan a submission. Each rule is reported at most once.
    pub fn scan(&self, language: Language, source: &str) -> ScanReport {
        let Some(lang) = self.languages.get(&language) else {
            return ScanReport {
                violations: vec![format!("no security policy for language '{}'", language)],
            };
        };

        let mut violations = Vec::new();

        if source.len() > lang.max_source_bytes {
            violations.push(format!(
                "source exceeds {} bytes",
                lang.max_source_bytes
            ));
            // Don't run regexes over oversized input
            return ScanReport { violations };
        }

        if source.contains('\0') {
            violations.push("NUL byte in source".to_string());
        }

        for rule in &lang.rules {
            if rule.regex.is_match(source) {
                violations.push(rule.name.clone());
            }
        }

        ScanReport { violations }
    }
}

fn rule(name: &str, pattern: &str) -> SecurityRule {
    SecurityRule {
        name: name.to_string(),
        pattern: pattern.to_string(),
    }
}

/// Built-in rule set per language
pub fn default_rules(language: Language) -> Vec<SecurityRule> {
    match language {
        Language::Python => vec![
            rule(
                "os module import",
                r"(?m)(^|;)\s*(import\s+([\w.]+(\s+as\s+\w+)?\s*,\s*)*os\b|from\s+os\b)",
            ),
            rule("process spawning", r"\bsubprocess\b|\bmultiprocessing\b"),
            rule(
                "network access",
                r"(?m)(^|;)\s*(import\s+([\w.]+(\s+as\s+\w+)?\s*,\s*)*|from\s+)(socket|urllib|http|requests)\b",
            ),
            rule("native code loading", r"\bctypes\b"),
            rule("dynamic code execution", r"\b(eval|exec)\s*\(|__import__"),
            rule("busy infinite loop", r"while\s+(True|1)\s*:\s*pass\b"),
        ],
        Language::Java => vec![
            rule("process spawning", r"Runtime\s*\.\s*getRuntime|ProcessBuilder"),
            rule("network access", r"\bjava\.net\.|\bnew\s+Socket\s*\("),
            rule("System.exit call", r"System\s*\.\s*exit\s*\("),
            rule("reflection", r"java\.lang\.reflect"),
            rule("busy infinite loop", r"while\s*\(\s*true\s*\)\s*(;|\{\s*\})"),
        ],
        Language::Cpp => vec![
            rule("shell command", r"\bsystem\s*\(|\bpopen\s*\("),
            rule("process spawning", r"\bfork\s*\(|\bexec(l|lp|le|v|vp|vpe)\s*\("),
            rule(
                "network access",
                r"#\s*include\s*<(sys/socket\.h|netinet/[a-z_]+\.h|arpa/inet\.h|netdb\.h)>",
            ),
            rule("inline assembly", r"\b(asm|__asm__)\b"),
            rule(
                "busy infinite loop",
                r"for\s*\(\s*;\s*;\s*\)\s*(;|\{\s*\})|while\s*\(\s*(true|1)\s*\)\s*(;|\{\s*\})",
            ),
        ],
        Language::Javascript => vec![
            rule("process spawning", r"child_process"),
            rule(
                "network access",
                r#"require\s*\(\s*['"](net|http|https|dgram|tls)['"]\s*\)|\bfetch\s*\("#,
            ),
            rule("process.exit call", r"process\s*\.\s*exit\s*\("),
            rule("dynamic code execution", r"\beval\s*\(|\bnew\s+Function\s*\("),
            rule(
                "busy infinite loop",
                r"while\s*\(\s*(true|1)\s*\)\s*(;|\{\s*\})|for\s*\(\s*;\s*;\s*\)\s*(;|\{\s*\})",
            ),
        ],
        Language::Rust => vec![
            rule(
                "process spawning",
                r"std\s*::\s*process\s*::\s*Command|\bCommand\s*::\s*new",
            ),
            rule("network access", r"std\s*::\s*net\b"),
            rule("unsafe code", r"\bunsafe\b"),
            rule("busy infinite loop", r"\bloop\s*\{\s*\}"),
        ],
    }
}
