//! Two-tier regex classification of shell commands.
//!
//! Tier one (blocked) is loaded from `blocked-patterns.json` so operators
//! can extend it without a rebuild; a compiled built-in set is the
//! fallback. Tier two (dangerous) is built in. Blocked dominates
//! dangerous dominates safe.

use std::path::Path;

use {
    regex::{Regex, RegexSet},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

/// Where the command originated. Group chats have no approval path, so
/// dangerous commands classify as blocked there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatContext {
    #[default]
    Private,
    Group,
}

/// Classification result. Exactly one verdict per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Safe,
    NeedsApproval { reason: String },
    Blocked { reason: String },
}

/// One externally-configured blocked pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedPattern {
    pub id: String,
    pub category: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    pub reason: String,
}

/// On-disk schema of `blocked-patterns.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedPatterns {
    pub description: String,
    pub version: String,
    #[serde(rename = "lastUpdated")]
    pub last_updated: String,
    pub patterns: Vec<BlockedPattern>,
}

impl BlockedPatterns {
    /// Built-in set used when no file is present: environment and secret
    /// exfiltration vectors.
    #[must_use]
    pub fn builtin() -> Self {
        let entry = |id: &str, category: &str, pattern: &str, reason: &str| BlockedPattern {
            id: id.to_string(),
            category: category.to_string(),
            pattern: pattern.to_string(),
            flags: None,
            reason: reason.to_string(),
        };
        Self {
            description: "Commands that are never executable, regardless of operator consent"
                .to_string(),
            version: "1".to_string(),
            last_updated: "2025-01-01".to_string(),
            patterns: vec![
                entry(
                    "env-dump",
                    "env-leak",
                    r"^\s*(env|printenv)\s*($|\||>)",
                    "dumps the full process environment",
                ),
                entry(
                    "proc-environ",
                    "env-leak",
                    r"/proc/(self|\d+)/environ",
                    "reads another process's environment",
                ),
                entry(
                    "node-env",
                    "env-leak",
                    r"process\.env",
                    "reads the runtime environment from code",
                ),
                entry(
                    "python-env",
                    "env-leak",
                    r"os\.environ",
                    "reads the runtime environment from code",
                ),
                entry(
                    "secret-mounts",
                    "secret-leak",
                    r"/(run|var/run)/secrets/",
                    "reads mounted secrets",
                ),
                entry(
                    "shell-export-dump",
                    "env-leak",
                    r"^\s*(set|export)\s*($|\|)",
                    "dumps shell variables",
                ),
            ],
        }
    }

    /// Load from the given file, falling back to the built-in set when the
    /// file is missing or unparseable.
    pub fn load_or_builtin(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Self>(&raw) {
                Ok(parsed) => {
                    debug!(path = %path.display(), count = parsed.patterns.len(), "loaded blocked patterns");
                    parsed
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "blocked-patterns file unparseable, using built-in set");
                    Self::builtin()
                },
            },
            Err(_) => Self::builtin(),
        }
    }
}

/// Built-in dangerous patterns: `(regex, reason)`. These require operator
/// approval in a private chat and are blocked in groups.
static DANGEROUS_PATTERN_DEFS: &[(&str, &str)] = &[
    // Filesystem destruction
    (r"rm\s+(-\S*\s+)*-\S*[rR]", "recursive delete"),
    (r"rm\s+(-\S*\s+)*\S*\*", "wildcard delete"),
    (r"\bshred\b", "secure file destruction"),
    (r"\bmkfs(\.\w+)?\b", "make filesystem"),
    (r"\bdd\b.*\bof=/dev/", "raw disk write with dd"),
    (r"\b(fdisk|parted|sgdisk)\b", "partition table manipulation"),
    // Privilege escalation / permissions
    (r"\bsudo\s+", "privilege escalation"),
    (r"chmod\s+(-\S+\s+)*(777|a\+rwx)\b", "world-writable permissions"),
    (r"chown\s+(-\S+\s+)*root\b", "ownership change to root"),
    // Network / firewall
    (r"\biptables\s+(-F|--flush)", "firewall flush"),
    (r"\bufw\s+disable\b", "firewall disable"),
    (r"(curl|wget)\s+[^|;]*\|\s*(sh|bash|zsh)\b", "pipe remote content to shell"),
    (r"\b(nc|ncat|netcat)\s+.*\s-e\s", "reverse shell"),
    (r"bash\s+-i\s+.*(/dev/tcp|/dev/udp)/", "reverse shell"),
    // Package / system state
    (r"(apt(-get)?|yum|dnf)\s+(remove|purge|autoremove)\s+.*(\*|-y)", "mass package removal"),
    (r"\bsystemctl\s+(stop|disable|mask)\s+", "service shutdown"),
    // Git history destruction
    (r"git\s+push\s+\S*\s*.*(-\S*f\S*|--force(-with-lease)?)\b", "git force push"),
    (r"git\s+reset\s+--hard", "git reset --hard"),
    (r"git\s+clean\s+-\S*f", "git clean with force"),
    // Databases
    (r"(?i)\bDROP\s+(TABLE|DATABASE|SCHEMA)\b", "DROP TABLE/DATABASE"),
    (r"(?i)\bTRUNCATE\s+(TABLE\s+)?\w", "TRUNCATE"),
    (r"(?i)\bDELETE\s+FROM\s+\w+\s*(;|$)", "unbounded DELETE"),
    // Containers / clusters
    (r"docker\s+system\s+prune\s+.*-a", "docker system prune -a"),
    (r"kubectl\s+delete\s+.*--all\b", "kubectl delete --all"),
    // Misc hazards
    (r":\(\)\s*\{.*\|.*&\s*\}\s*;", "fork bomb"),
    (r"\bfind\s+/\s", "full-filesystem scan"),
    (r"\bgrep\s+(-\S+\s+)*-r\S*\s+\S+\s+/\s*$", "full-filesystem scan"),
];

/// The classifier: compiled blocked set over compiled dangerous set.
pub struct CommandClassifier {
    blocked: Vec<(Regex, String)>,
    dangerous: RegexSet,
}

impl CommandClassifier {
    /// Compile from a blocked-pattern config. Individual invalid patterns
    /// are skipped with a warning rather than taking the classifier down.
    #[must_use]
    pub fn new(config: &BlockedPatterns) -> Self {
        let mut blocked = Vec::with_capacity(config.patterns.len());
        for p in &config.patterns {
            let source = match p.flags.as_deref() {
                Some(flags) if flags.contains('i') => format!("(?i){}", p.pattern),
                _ => p.pattern.clone(),
            };
            match Regex::new(&source) {
                Ok(re) => blocked.push((re, p.reason.clone())),
                Err(e) => warn!(id = %p.id, error = %e, "skipping invalid blocked pattern"),
            }
        }

        let dangerous = RegexSet::new(DANGEROUS_PATTERN_DEFS.iter().map(|(p, _)| *p))
            .unwrap_or_else(|e| panic!("built-in dangerous patterns must be valid regex: {e}"));

        Self { blocked, dangerous }
    }

    /// Classifier with the built-in blocked set.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(&BlockedPatterns::builtin())
    }

    /// Classify a command under the given chat context.
    ///
    /// Blocked dominates approval dominates safe. In group chats the
    /// dangerous tier has no approval path, so it degrades to blocked with
    /// a hint to retry in a private chat.
    #[must_use]
    pub fn classify(&self, command: &str, context: ChatContext) -> CommandVerdict {
        for (re, reason) in &self.blocked {
            if re.is_match(command) {
                return CommandVerdict::Blocked {
                    reason: reason.clone(),
                };
            }
        }

        if let Some(idx) = self.dangerous.matches(command).iter().next() {
            let reason = DANGEROUS_PATTERN_DEFS[idx].1.to_string();
            return match context {
                ChatContext::Private => CommandVerdict::NeedsApproval { reason },
                ChatContext::Group => CommandVerdict::Blocked {
                    reason: format!("{reason} — approval is unavailable in group chats, re-issue in a private chat"),
                },
            };
        }

        CommandVerdict::Safe
    }
}
