//! Platform dialect table.
//!
//! Vendor differences (how to dump the configuration, how to enter config
//! mode, how a line is negated, which prompts and errors the CLI prints) are
//! data, not behavior: every supported platform is one [`PlatformProfile`]
//! entry. Adding a vendor means adding an entry and its aliases.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::RegexSet;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// How a configuration line is withdrawn on a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NegationStyle {
    /// `no <line>`; negating `no <line>` yields `<line>`.
    NoPrefix,
    /// `undo <line>` as on VRP and Comware.
    UndoPrefix,
    /// JunOS `set`/`delete` and `activate`/`deactivate` pairs.
    SetDelete,
}

/// Everything the engine knows about one CLI dialect.
#[derive(Debug, PartialEq, Eq)]
pub struct PlatformProfile {
    pub key: &'static str,
    pub vendor: &'static str,
    pub family: &'static str,
    /// Dumps the full running configuration.
    pub config_command: &'static str,
    pub version_command: &'static str,
    /// Extra read-only commands collected by device-info requests.
    pub facts_commands: &'static [&'static str],
    pub enter_config: &'static str,
    pub exit_config: &'static str,
    /// Applies staged changes on candidate-config platforms.
    pub commit_command: Option<&'static str>,
    /// Leaves one nested configuration section.
    pub section_exit: Option<&'static str>,
    /// Config-mode verb deleting a whole top-level hierarchy, on platforms
    /// where staged changes replace the configuration at commit.
    pub clear_hierarchy: Option<&'static str>,
    /// Sent once after login so output never stops at a pager.
    pub pager_disable: Option<&'static str>,
    /// Privilege elevation command, for platforms with a user exec mode.
    pub enable_command: Option<&'static str>,
    pub comment_prefixes: &'static [&'static str],
    /// Lines of the config dump that carry no configuration.
    pub noise_patterns: &'static [&'static str],
    pub prompt_patterns: &'static [&'static str],
    /// Prompt patterns that mean the session is not yet privileged.
    pub user_prompt_patterns: &'static [&'static str],
    pub pager_patterns: &'static [&'static str],
    pub error_patterns: &'static [&'static str],
    pub negation: NegationStyle,
    /// Ordered platform names tried against the parsing-template corpus.
    pub parser_aliases: &'static [&'static str],
}

/// Serializable summary of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlatformMetadata {
    pub key: String,
    pub vendor: String,
    pub family: String,
    pub negation: NegationStyle,
    pub parser_aliases: Vec<String>,
}

/// Leading words of a statement that are not part of its hierarchy path.
const STATEMENT_VERBS: &[&str] = &["set", "delete", "activate", "deactivate", "protect", "unprotect"];

const ENABLE_PASSWORD_PROMPT: &str = r"(?i)^\x00*\r?(enable )?password:\s*$";

static PROFILES: &[PlatformProfile] = &[
    PlatformProfile {
        key: "cisco",
        vendor: "Cisco",
        family: "IOS/IOS-XE",
        config_command: "show running-config",
        version_command: "show version",
        facts_commands: &["show inventory", "show ip interface brief"],
        enter_config: "configure terminal",
        exit_config: "end",
        commit_command: None,
        section_exit: Some("exit"),
        clear_hierarchy: None,
        pager_disable: Some("terminal length 0"),
        enable_command: Some("enable"),
        comment_prefixes: &["!"],
        noise_patterns: &[
            r"^Building configuration",
            r"^Current configuration\s*:",
            r"^! Last configuration change",
            r"^! NVRAM config last updated",
            r"^ntp clock-period",
            r"^end$",
        ],
        prompt_patterns: &[r"^\S+\(\S+\)#\s*$", r"^[^\s#]+#\s*$", r"^[^\s<]+>\s*$"],
        user_prompt_patterns: &[r"^[^\s<]+>\s*$"],
        pager_patterns: &[r"\s*<--- More --->\s*", r"\s*--More--\s*"],
        error_patterns: &[
            r"% Invalid command at '\^' marker\.",
            r"% Invalid input detected",
            r"^%.+",
            r"^Command authorization failed.*",
            r"^Command rejected:.*",
            r"ERROR:.+",
        ],
        negation: NegationStyle::NoPrefix,
        parser_aliases: &["cisco_ios", "cisco_nxos", "cisco_xe"],
    },
    PlatformProfile {
        key: "huawei",
        vendor: "Huawei",
        family: "VRP",
        config_command: "display current-configuration",
        version_command: "display version",
        facts_commands: &["display device", "display interface brief"],
        enter_config: "system-view",
        exit_config: "return",
        commit_command: None,
        section_exit: Some("quit"),
        clear_hierarchy: None,
        pager_disable: Some("screen-length 0 temporary"),
        enable_command: None,
        comment_prefixes: &["#"],
        noise_patterns: &[r"^!Software Version", r"^!Last configuration was", r"^return$"],
        prompt_patterns: &[r"^(HRP_M|HRP_S){0,1}\[.+]+\s*$", r"^(RBM_P|RBM_S)?<.+>\s*$"],
        user_prompt_patterns: &[],
        pager_patterns: &[r"\s*---- More ----\s*"],
        error_patterns: &[r"Error: .+$", r"^\s*\^\s*$"],
        negation: NegationStyle::UndoPrefix,
        parser_aliases: &["huawei_vrp", "huawei", "cisco_ios"],
    },
    PlatformProfile {
        key: "h3c",
        vendor: "H3C",
        family: "Comware",
        config_command: "display current-configuration",
        version_command: "display version",
        facts_commands: &["display device", "display interface brief"],
        enter_config: "system-view",
        exit_config: "return",
        commit_command: None,
        section_exit: Some("quit"),
        clear_hierarchy: None,
        pager_disable: Some("screen-length disable"),
        enable_command: None,
        comment_prefixes: &["#"],
        noise_patterns: &[r"^return$"],
        prompt_patterns: &[r"^(RBM_P|RBM_S)?\[.+\]\s*$", r"^(RBM_P|RBM_S)?<.+>\s*$"],
        user_prompt_patterns: &[],
        pager_patterns: &[r"\s*---- More ----\s*"],
        error_patterns: &[r"% Unrecognized command found at '\^' position\.", r"% Wrong parameter", r"^\s*\^\s*$"],
        negation: NegationStyle::UndoPrefix,
        parser_aliases: &["hp_comware", "huawei_vrp", "hp_procurve"],
    },
    PlatformProfile {
        key: "juniper",
        vendor: "Juniper",
        family: "JunOS",
        config_command: "show configuration | display set",
        version_command: "show version",
        facts_commands: &["show chassis hardware", "show interfaces terse"],
        enter_config: "configure",
        exit_config: "exit configuration-mode",
        commit_command: Some("commit"),
        section_exit: None,
        clear_hierarchy: Some("delete"),
        pager_disable: Some("set cli screen-length 0"),
        enable_command: None,
        comment_prefixes: &["#"],
        noise_patterns: &[r"^## Last commit", r"^## Last changed"],
        prompt_patterns: &[r"^\S+@\S+[>#%]\s*$"],
        user_prompt_patterns: &[],
        pager_patterns: &[r"---\(more[^)]*\)---"],
        error_patterns: &[r"^error:", r"^syntax error", r"^unknown command"],
        negation: NegationStyle::SetDelete,
        parser_aliases: &["juniper_junos"],
    },
    PlatformProfile {
        key: "arista",
        vendor: "Arista",
        family: "EOS",
        config_command: "show running-config",
        version_command: "show version",
        facts_commands: &["show inventory", "show ip interface brief"],
        enter_config: "configure terminal",
        exit_config: "end",
        commit_command: None,
        section_exit: Some("exit"),
        clear_hierarchy: None,
        pager_disable: Some("terminal length 0"),
        enable_command: Some("enable"),
        comment_prefixes: &["!"],
        noise_patterns: &[r"^! Command:", r"^! device:", r"^! boot system", r"^end$"],
        prompt_patterns: &[r"^\S+\(\S+\)#\s*$", r"^[^\s#]+#\s*$", r"^[^\s<]+>\s*$"],
        user_prompt_patterns: &[r"^[^\s<]+>\s*$"],
        pager_patterns: &[r"\s*--More--\s*"],
        error_patterns: &[r"^% Invalid input", r"^% Incomplete command", r"^%.+"],
        negation: NegationStyle::NoPrefix,
        parser_aliases: &["arista_eos"],
    },
    PlatformProfile {
        key: "generic",
        vendor: "Generic",
        family: "Cisco-like CLI",
        config_command: "show running-config",
        version_command: "show version",
        facts_commands: &[],
        enter_config: "configure terminal",
        exit_config: "end",
        commit_command: None,
        section_exit: Some("exit"),
        clear_hierarchy: None,
        pager_disable: Some("terminal length 0"),
        enable_command: Some("enable"),
        comment_prefixes: &["!"],
        noise_patterns: &[r"^Building configuration", r"^Current configuration\s*:"],
        prompt_patterns: &[r"^\S+\(\S+\)#\s*$", r"^[^\s#]+#\s*$", r"^[^\s<]+>\s*$"],
        user_prompt_patterns: &[r"^[^\s<]+>\s*$"],
        pager_patterns: &[r"\s*--More--\s*"],
        error_patterns: &[r"^%.+"],
        negation: NegationStyle::NoPrefix,
        parser_aliases: &["cisco_ios"],
    },
];

/// Platform tags reported by inventories, mapped to profile keys.
static ALIASES: &[(&str, &str)] = &[
    ("cisco", "cisco"),
    ("cisco_ios", "cisco"),
    ("ios", "cisco"),
    ("cisco_iosxe", "cisco"),
    ("cisco_xe", "cisco"),
    ("iosxe", "cisco"),
    ("cisco_nxos", "cisco"),
    ("huawei", "huawei"),
    ("huawei_vrp", "huawei"),
    ("vrp", "huawei"),
    ("h3c", "h3c"),
    ("hp_comware", "h3c"),
    ("comware", "h3c"),
    ("juniper", "juniper"),
    ("juniper_junos", "juniper"),
    ("junos", "juniper"),
    ("arista", "arista"),
    ("arista_eos", "arista"),
    ("eos", "arista"),
    ("generic", "generic"),
];

struct CompiledProfile {
    noise: RegexSet,
    prompt: RegexSet,
    user_prompt: RegexSet,
    pager: RegexSet,
    error: RegexSet,
}

fn compile(patterns: &[&str], what: &str, key: &str) -> RegexSet {
    match RegexSet::new(patterns) {
        Ok(set) => set,
        Err(err) => panic!("invalid {what} pattern in platform profile '{key}': {err}"),
    }
}

static COMPILED: Lazy<HashMap<&'static str, CompiledProfile>> = Lazy::new(|| {
    PROFILES
        .iter()
        .map(|p| {
            (
                p.key,
                CompiledProfile {
                    noise: compile(p.noise_patterns, "noise", p.key),
                    prompt: compile(p.prompt_patterns, "prompt", p.key),
                    user_prompt: compile(p.user_prompt_patterns, "user prompt", p.key),
                    pager: compile(p.pager_patterns, "pager", p.key),
                    error: compile(p.error_patterns, "error", p.key),
                },
            )
        })
        .collect()
});

static ENABLE_PROMPT: Lazy<RegexSet> = Lazy::new(|| compile(&[ENABLE_PASSWORD_PROMPT], "enable", "*"));

fn normalize(platform: &str) -> String {
    platform.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

/// Exact lookup by platform tag or alias (case-insensitive).
pub fn lookup(platform: &str) -> Option<&'static PlatformProfile> {
    let tag = normalize(platform);
    let key = ALIASES
        .iter()
        .find(|(alias, _)| *alias == tag)
        .map(|(_, key)| *key)?;
    PROFILES.iter().find(|p| p.key == key)
}

/// Lookup that falls back to the generic Cisco-like profile.
pub fn profile_for(platform: &str) -> &'static PlatformProfile {
    lookup(platform).unwrap_or(&PROFILES[PROFILES.len() - 1])
}

/// Strict lookup for callers that must not guess.
pub fn platform_metadata(platform: &str) -> Result<PlatformMetadata, FleetError> {
    lookup(platform)
        .map(PlatformProfile::metadata)
        .ok_or_else(|| FleetError::TemplateNotFound(platform.to_string()))
}

/// Metadata for every built-in profile.
pub fn platform_catalog() -> Vec<PlatformMetadata> {
    PROFILES.iter().map(PlatformProfile::metadata).collect()
}

impl PlatformProfile {
    pub fn metadata(&self) -> PlatformMetadata {
        PlatformMetadata {
            key: self.key.to_string(),
            vendor: self.vendor.to_string(),
            family: self.family.to_string(),
            negation: self.negation,
            parser_aliases: self.parser_aliases.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn compiled(&self) -> Option<&'static CompiledProfile> {
        COMPILED.get(self.key)
    }

    pub fn is_noise(&self, line: &str) -> bool {
        self.compiled().is_some_and(|c| c.noise.is_match(line))
    }

    pub fn is_prompt(&self, line: &str) -> bool {
        self.compiled().is_some_and(|c| c.prompt.is_match(line))
    }

    pub fn is_user_prompt(&self, line: &str) -> bool {
        self.compiled().is_some_and(|c| c.user_prompt.is_match(line))
    }

    pub fn is_pager(&self, line: &str) -> bool {
        self.compiled().is_some_and(|c| c.pager.is_match(line))
    }

    pub fn is_error(&self, line: &str) -> bool {
        self.compiled().is_some_and(|c| c.error.is_match(line))
    }

    pub fn is_enable_password_prompt(&self, line: &str) -> bool {
        ENABLE_PROMPT.is_match(line)
    }

    pub fn is_comment(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        self.comment_prefixes.iter().any(|p| trimmed.starts_with(p))
    }

    /// Command that withdraws `line`, or `None` when the dialect cannot
    /// express it.
    pub fn negate(&self, line: &str) -> Option<String> {
        let cmd = line.trim();
        if cmd.is_empty() || self.is_comment(cmd) {
            return None;
        }
        let lower = cmd.to_ascii_lowercase();
        match self.negation {
            NegationStyle::SetDelete => {
                if let Some(rest) = cmd.strip_prefix("set ") {
                    Some(format!("delete {rest}"))
                } else if let Some(rest) = cmd.strip_prefix("activate ") {
                    Some(format!("deactivate {rest}"))
                } else {
                    cmd.strip_prefix("deactivate ")
                        .map(|rest| format!("activate {rest}"))
                }
            }
            NegationStyle::UndoPrefix => {
                if lower.starts_with("undo ") {
                    Some(cmd[5..].trim_start().to_string())
                } else {
                    Some(format!("undo {cmd}"))
                }
            }
            NegationStyle::NoPrefix => {
                if lower.starts_with("no ") {
                    Some(cmd[3..].trim_start().to_string())
                } else {
                    Some(format!("no {cmd}"))
                }
            }
        }
    }

    /// Top-level hierarchy of a statement: the first word after its verb.
    pub fn hierarchy<'a>(&self, line: &'a str) -> Option<&'a str> {
        let mut words = line.split_whitespace();
        let first = words.next()?;
        if STATEMENT_VERBS.contains(&first) {
            words.next()
        } else {
            Some(first)
        }
    }

    /// Distinct hierarchies of the given top-level lines, in first-seen order.
    pub fn hierarchies<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        let mut hierarchies: Vec<&str> = Vec::new();
        for line in lines {
            if let Some(hierarchy) = self.hierarchy(line)
                && !hierarchies.contains(&hierarchy)
            {
                hierarchies.push(hierarchy);
            }
        }
        hierarchies
    }

    /// Wraps configuration lines in the dialect's config-mode session.
    pub fn config_session(&self, lines: &[String]) -> Vec<String> {
        let mut commands = Vec::with_capacity(lines.len() + 3);
        commands.push(self.enter_config.to_string());
        commands.extend(lines.iter().cloned());
        if let Some(commit) = self.commit_command {
            commands.push(commit.to_string());
        }
        commands.push(self.exit_config.to_string());
        commands
    }

    /// Whether `command` only reads state.
    pub fn is_read_only(&self, command: &str) -> bool {
        let cmd = command.trim().to_ascii_lowercase();
        ["show ", "display ", "ping ", "traceroute ", "tracert "]
            .iter()
            .any(|prefix| cmd.starts_with(prefix))
            || cmd == self.config_command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_case_insensitively() {
        assert_eq!(profile_for("Cisco_IOS").key, "cisco");
        assert_eq!(profile_for("huawei-vrp").key, "huawei");
        assert_eq!(profile_for("HP_Comware").key, "h3c");
        assert_eq!(profile_for("junos").key, "juniper");
    }

    #[test]
    fn unknown_platform_falls_back_to_generic() {
        assert!(lookup("acme_os").is_none());
        assert_eq!(profile_for("acme_os").key, "generic");
        let err = platform_metadata("acme_os").expect_err("strict lookup must fail");
        assert!(matches!(err, FleetError::TemplateNotFound(_)));
    }

    #[test]
    fn every_profile_compiles_its_patterns() {
        for profile in PROFILES {
            assert!(profile.compiled().is_some(), "{} has no compiled set", profile.key);
        }
        assert_eq!(platform_catalog().len(), PROFILES.len());
    }

    #[test]
    fn negation_follows_dialect() {
        let cisco = profile_for("cisco_ios");
        assert_eq!(
            cisco.negate("snmp-server community public RO").as_deref(),
            Some("no snmp-server community public RO")
        );
        assert_eq!(cisco.negate("no shutdown").as_deref(), Some("shutdown"));
        assert_eq!(cisco.negate("! comment"), None);

        let huawei = profile_for("huawei");
        assert_eq!(huawei.negate("undo shutdown").as_deref(), Some("shutdown"));
        assert_eq!(huawei.negate("vlan 10").as_deref(), Some("undo vlan 10"));

        let junos = profile_for("juniper");
        assert_eq!(
            junos.negate("set system host-name r1").as_deref(),
            Some("delete system host-name r1")
        );
        assert_eq!(
            junos.negate("deactivate interfaces ge-0/0/0").as_deref(),
            Some("activate interfaces ge-0/0/0")
        );
        assert_eq!(junos.negate("delete system host-name r1"), None);
    }

    #[test]
    fn prompts_and_errors_are_recognised() {
        let cisco = profile_for("cisco");
        assert!(cisco.is_prompt("core-sw1#"));
        assert!(cisco.is_prompt("core-sw1(config-if)#"));
        assert!(cisco.is_user_prompt("core-sw1>"));
        assert!(!cisco.is_user_prompt("core-sw1#"));
        assert!(cisco.is_error("% Invalid input detected at '^' marker."));
        assert!(cisco.is_pager(" --More-- "));

        let huawei = profile_for("huawei");
        assert!(huawei.is_prompt("<HUAWEI>"));
        assert!(huawei.is_prompt("[HUAWEI-GigabitEthernet0/0/1]"));
        assert!(huawei.is_error("Error: Unrecognized command found at '^' position."));
    }

    #[test]
    fn config_session_wraps_commit_platforms() {
        let junos = profile_for("juniper");
        let session = junos.config_session(&["set system host-name r2".to_string()]);
        assert_eq!(
            session,
            vec![
                "configure".to_string(),
                "set system host-name r2".to_string(),
                "commit".to_string(),
                "exit configuration-mode".to_string(),
            ]
        );
    }

    #[test]
    fn statements_group_by_hierarchy() {
        let junos = profile_for("juniper");
        assert_eq!(junos.hierarchy("set system host-name r1"), Some("system"));
        assert_eq!(junos.hierarchy("deactivate interfaces ge-0/0/0"), Some("interfaces"));
        assert_eq!(junos.hierarchy("stray"), Some("stray"));
        let hierarchies = junos.hierarchies([
            "set system host-name r1",
            "set interfaces ge-0/0/0 unit 0",
            "set system services ssh",
        ]);
        assert_eq!(hierarchies, vec!["system", "interfaces"]);
        assert_eq!(junos.clear_hierarchy, Some("delete"));
        assert_eq!(profile_for("cisco").clear_hierarchy, None);
    }

    #[test]
    fn noise_lines_are_detected() {
        let cisco = profile_for("cisco");
        assert!(cisco.is_noise("Building configuration..."));
        assert!(cisco.is_noise("Current configuration : 1234 bytes"));
        assert!(!cisco.is_noise("hostname core-sw1"));
    }
}
