//! Hybrid command output parser.
//!
//! Turns raw CLI text into records by trying, in order:
//!
//! 1. custom templates registered for the deployment,
//! 2. an external template corpus, once per platform alias,
//! 3. built-in regular expressions for common tables,
//! 4. nothing: the raw text comes back with `parser = "none"`.
//!
//! Parsing never fails. Every result carries the raw text and metadata naming
//! the tier that produced it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::templates;

/// One structured row.
pub type Record = BTreeMap<String, String>;

/// Which strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParseTier {
    Custom,
    Corpus,
    Regex,
    None,
}

impl ParseTier {
    pub fn confidence(self) -> f64 {
        match self {
            ParseTier::Custom => 0.95,
            ParseTier::Corpus => 0.9,
            ParseTier::Regex => 0.6,
            ParseTier::None => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParseMetadata {
    pub tier: ParseTier,
    /// Name of the template, alias or regex family that matched, or `none`.
    pub parser: String,
    pub confidence: f64,
    pub platform: String,
    pub command: String,
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParsedOutput {
    pub records: Vec<Record>,
    pub metadata: ParseMetadata,
    pub raw: String,
}

impl ParsedOutput {
    pub fn is_structured(&self) -> bool {
        self.metadata.tier != ParseTier::None
    }
}

/// The external community template corpus.
pub trait TemplateCorpus: Send + Sync {
    /// Parses `output` of `command` with the templates of platform `alias`.
    /// `None` or an empty list means no match.
    fn parse(&self, alias: &str, command: &str, output: &str) -> Option<Vec<Record>>;
}

/// A deployment-specific parsing template.
///
/// `command_pattern` accepts `[[...]]` abbreviation markers, so
/// `di[[splay]] v[[lan]]` matches `dis vlan` as well as `display vlan`.
/// Every match of `line_pattern` yields one record built from its named
/// capture groups.
#[derive(Debug, Clone)]
pub struct CustomTemplate {
    pub name: String,
    pub platform: String,
    command_source: String,
    command_pattern: Regex,
    line_pattern: Regex,
}

static ABBREVIATION: Lazy<Regex> = Lazy::new(|| match Regex::new(r"\[\[([^\]]+)\]\]") {
    Ok(re) => re,
    Err(err) => panic!("invalid ABBREVIATION regex: {err}"),
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| match Regex::new(r"\s+") {
    Ok(re) => re,
    Err(err) => panic!("invalid WHITESPACE regex: {err}"),
});

/// Expands `[[abc]]` into `(a(b(c)?)?)?` and loosens whitespace.
fn expand_command_pattern(pattern: &str) -> String {
    let expanded = ABBREVIATION.replace_all(pattern, |caps: &regex::Captures<'_>| {
        let tail = &caps[1];
        let mut out = String::new();
        for ch in tail.chars() {
            out.push('(');
            out.push_str(&regex::escape(&ch.to_string()));
        }
        for _ in tail.chars() {
            out.push_str(")?");
        }
        out
    });
    WHITESPACE.replace_all(&expanded, r"\s+").into_owned()
}

impl CustomTemplate {
    pub fn new(
        name: impl Into<String>,
        platform: impl Into<String>,
        command_pattern: &str,
        line_pattern: &str,
    ) -> Result<Self, FleetError> {
        let name = name.into();
        let command = RegexBuilder::new(&expand_command_pattern(command_pattern))
            .case_insensitive(true)
            .build()
            .map_err(|e| FleetError::Parsing(format!("template {name}: bad command pattern: {e}")))?;
        let line = RegexBuilder::new(line_pattern)
            .multi_line(true)
            .build()
            .map_err(|e| FleetError::Parsing(format!("template {name}: bad line pattern: {e}")))?;
        if line.capture_names().flatten().next().is_none() {
            return Err(FleetError::Parsing(format!(
                "template {name}: line pattern has no named groups"
            )));
        }
        Ok(Self {
            name,
            platform: platform.into(),
            command_source: command_pattern.to_string(),
            command_pattern: command,
            line_pattern: line,
        })
    }

    fn applies_to(&self, platform: &str, command: &str) -> bool {
        same_platform(&self.platform, platform) && self.command_pattern.is_match(command)
    }

    fn extract(&self, output: &str) -> Vec<Record> {
        let names: Vec<&str> = self.line_pattern.capture_names().flatten().collect();
        self.line_pattern
            .captures_iter(output)
            .map(|caps| {
                names
                    .iter()
                    .filter_map(|name| {
                        caps.name(name)
                            .map(|m| (name.to_string(), m.as_str().trim().to_string()))
                    })
                    .collect::<Record>()
            })
            .filter(|record| !record.is_empty())
            .collect()
    }
}

fn same_platform(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    match (templates::lookup(a), templates::lookup(b)) {
        (Some(x), Some(y)) => x.key == y.key,
        _ => false,
    }
}

macro_rules! fallback_regex {
    ($name:ident, $pattern:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| {
            match RegexBuilder::new($pattern).case_insensitive(true).build() {
                Ok(re) => re,
                Err(err) => panic!("invalid {} regex: {err}", stringify!($name)),
            }
        });
    };
}

fallback_regex!(
    MAC_DASH_AGING,
    r"([0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4})\s+(\d+)\s+(\S+)\s+(\S+)\s+(\S+)"
);
fallback_regex!(
    MAC_DASH,
    r"([0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4})\s+(\d+)\s+(\S+)\s+(\S+)"
);
fallback_regex!(
    MAC_DOT,
    r"(\d+)\s+([0-9a-f]{4}\.[0-9a-f]{4}\.[0-9a-f]{4})\s+(\S+)\s+(\S+)"
);
fallback_regex!(
    INTERFACE_BRIEF,
    r"(?m)^\s*(\S+)\s+(up|down|admin-down|administratively\s+down)\s+(up|down)[ \t]*(.*)$"
);
fallback_regex!(VLAN_BLOCK, r"VLAN ID:\s*(\d+)");
fallback_regex!(VLAN_NAME, r"VLAN Name:\s*(\S+)");
fallback_regex!(VLAN_STATUS, r"VLAN Status:\s*(\S+)");
fallback_regex!(
    VLAN_ROW,
    r"(?m)^\s*(\d+)\s+(\S+)\s+(active|inactive|suspend)[ \t]*(.*)$"
);
fallback_regex!(
    ARP_DASH,
    r"(\d+\.\d+\.\d+\.\d+)\s+([0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4})\s+(\S+)"
);
fallback_regex!(
    ARP_COLON,
    r"(\d+\.\d+\.\d+\.\d+)\s+([0-9a-f]{2}(?::[0-9a-f]{2}){5})\s+(\S+)"
);
fallback_regex!(
    ARP_DOT,
    r"(\d+\.\d+\.\d+\.\d+)\s+(?:\S+\s+)?([0-9a-f]{4}\.[0-9a-f]{4}\.[0-9a-f]{4})\s+(?:\S+\s+)?(\S+)"
);

fn record(pairs: &[(&str, &str)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.trim().to_string()))
        .collect()
}

fn parse_mac_table(output: &str, vendor: &str) -> Vec<Record> {
    match vendor {
        "h3c" => MAC_DASH_AGING
            .captures_iter(output)
            .map(|c| {
                record(&[
                    ("mac", &c[1]),
                    ("vlan", &c[2]),
                    ("type", &c[3]),
                    ("port", &c[4]),
                    ("aging", &c[5]),
                ])
            })
            .collect(),
        "huawei" => MAC_DASH
            .captures_iter(output)
            .map(|c| record(&[("mac", &c[1]), ("vlan", &c[2]), ("type", &c[3]), ("port", &c[4])]))
            .collect(),
        _ => MAC_DOT
            .captures_iter(output)
            .map(|c| record(&[("vlan", &c[1]), ("mac", &c[2]), ("type", &c[3]), ("port", &c[4])]))
            .collect(),
    }
}

fn parse_interface_brief(output: &str) -> Vec<Record> {
    INTERFACE_BRIEF
        .captures_iter(output)
        .map(|c| {
            let link = WHITESPACE.replace_all(&c[2], "-").to_ascii_lowercase();
            record(&[
                ("interface", &c[1]),
                ("link", link.as_str()),
                ("protocol", c[3].to_ascii_lowercase().as_str()),
                ("description", &c[4]),
            ])
        })
        .collect()
}

fn parse_vlans(output: &str, vendor: &str) -> Vec<Record> {
    if vendor == "h3c" {
        let starts: Vec<(usize, usize, String)> = VLAN_BLOCK
            .captures_iter(output)
            .filter_map(|c| {
                let whole = c.get(0)?;
                Some((whole.start(), whole.end(), c[1].to_string()))
            })
            .collect();
        return starts
            .iter()
            .enumerate()
            .map(|(i, (_, body_start, id))| {
                let body_end = starts.get(i + 1).map_or(output.len(), |next| next.0);
                let body = &output[*body_start..body_end];
                let name = VLAN_NAME
                    .captures(body)
                    .map_or_else(|| "default".to_string(), |c| c[1].to_string());
                let status = VLAN_STATUS
                    .captures(body)
                    .map_or_else(|| "unknown".to_string(), |c| c[1].to_string());
                record(&[("vlan_id", id.as_str()), ("name", name.as_str()), ("status", status.as_str())])
            })
            .collect();
    }
    VLAN_ROW
        .captures_iter(output)
        .map(|c| {
            record(&[
                ("vlan_id", &c[1]),
                ("name", &c[2]),
                ("status", c[3].to_ascii_lowercase().as_str()),
                ("ports", &c[4]),
            ])
        })
        .collect()
}

fn parse_arp(output: &str, vendor: &str) -> Vec<Record> {
    let to_record = |c: regex::Captures<'_>| record(&[("ip", &c[1]), ("mac", &c[2]), ("interface", &c[3])]);
    if matches!(vendor, "h3c" | "huawei") {
        return ARP_DASH.captures_iter(output).map(to_record).collect();
    }
    ARP_COLON
        .captures_iter(output)
        .map(to_record)
        .chain(ARP_DOT.captures_iter(output).map(to_record))
        .collect()
}

/// Picks the regex family for a command, by keyword.
fn regex_fallback(output: &str, command: &str, vendor: &str) -> Option<(&'static str, Vec<Record>)> {
    let command = command.to_ascii_lowercase();
    let (family, records) = if command.contains("mac") && command.contains("address") {
        ("mac_table", parse_mac_table(output, vendor))
    } else if command.contains("int") && command.contains("brief") {
        ("interface_brief", parse_interface_brief(output))
    } else if command.contains("vlan") {
        ("vlan", parse_vlans(output, vendor))
    } else if command.contains("arp") {
        ("arp", parse_arp(output, vendor))
    } else {
        return None;
    };
    (!records.is_empty()).then_some((family, records))
}

/// Multi-tier parser. Cheap to share behind an [`Arc`].
#[derive(Default)]
pub struct HybridParser {
    custom: RwLock<Vec<CustomTemplate>>,
    corpus: Option<Arc<dyn TemplateCorpus>>,
}

impl HybridParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_corpus(corpus: Arc<dyn TemplateCorpus>) -> Self {
        Self {
            custom: RwLock::new(Vec::new()),
            corpus: Some(corpus),
        }
    }

    /// Registers a custom template. A template with the same name is replaced.
    pub fn register(&self, template: CustomTemplate) {
        let mut custom = self.custom.write().unwrap_or_else(|e| e.into_inner());
        custom.retain(|t| t.name != template.name);
        debug!(
            "registered custom template {} for {} / {}",
            template.name, template.platform, template.command_source
        );
        custom.push(template);
    }

    pub fn custom_template_names(&self) -> Vec<String> {
        self.custom
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Aliases tried against the corpus for `platform`, most specific first.
    pub fn aliases(platform: &str) -> Vec<String> {
        let profile = templates::profile_for(platform);
        let tag = platform.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let mut aliases = Vec::with_capacity(profile.parser_aliases.len() + 1);
        if !tag.is_empty() && templates::lookup(&tag).is_some_and(|p| p.key != tag) {
            aliases.push(tag);
        }
        for alias in profile.parser_aliases {
            if !aliases.iter().any(|a| a == alias) {
                aliases.push(alias.to_string());
            }
        }
        aliases
    }

    pub fn parse(&self, raw: &str, command: &str, platform: &str) -> ParsedOutput {
        let finish = |tier: ParseTier, parser: String, records: Vec<Record>| {
            trace!("{} via {:?}/{}: {} records", command, tier, parser, records.len());
            ParsedOutput {
                metadata: ParseMetadata {
                    tier,
                    parser,
                    confidence: tier.confidence(),
                    platform: platform.to_string(),
                    command: command.to_string(),
                    record_count: records.len(),
                },
                records,
                raw: raw.to_string(),
            }
        };

        if raw.trim().is_empty() {
            return finish(ParseTier::None, "none".to_string(), Vec::new());
        }

        if let Some((name, records)) = self.try_custom(raw, command, platform) {
            return finish(ParseTier::Custom, name, records);
        }

        if let Some(corpus) = &self.corpus {
            for alias in Self::aliases(platform) {
                match corpus.parse(&alias, command, raw) {
                    Some(records) if !records.is_empty() => {
                        return finish(ParseTier::Corpus, alias, records);
                    }
                    _ => trace!("corpus alias {} had no template for {}", alias, command),
                }
            }
        }

        let vendor = templates::profile_for(platform).key;
        if let Some((family, records)) = regex_fallback(raw, command, vendor) {
            return finish(ParseTier::Regex, family.to_string(), records);
        }

        finish(ParseTier::None, "none".to_string(), Vec::new())
    }

    /// Longest matching command pattern wins.
    fn try_custom(&self, raw: &str, command: &str, platform: &str) -> Option<(String, Vec<Record>)> {
        let custom = self.custom.read().unwrap_or_else(|e| e.into_inner());
        let template = custom
            .iter()
            .filter(|t| t.applies_to(platform, command))
            .max_by_key(|t| t.command_source.len())?;
        let records = template.extract(raw);
        if records.is_empty() {
            debug!("custom template {} matched {} but extracted nothing", template.name, command);
            return None;
        }
        Some((template.name.clone(), records))
    }
}
