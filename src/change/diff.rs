use super::*;

/// Change percentage past which a diff is flagged for closer review.
const REVIEW_PERCENT: f64 = 20.0;

/// One significant configuration line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLine {
    /// Line without trailing whitespace; indentation is kept.
    pub text: String,
    /// Top-level header owning an indented line.
    pub section: Option<String>,
    /// 1-based position in the raw configuration.
    pub number: usize,
}

impl ConfigLine {
    fn key(&self) -> (Option<&str>, &str) {
        (self.section.as_deref(), self.text.as_str())
    }
}

fn is_separator(line: &str) -> bool {
    matches!(line, "!" | "#")
}

/// Drops blank, separator and dialect noise lines and attaches every
/// indented line to the top-level header above it.
pub fn normalize_config(config: &str, profile: &PlatformProfile) -> Vec<ConfigLine> {
    let mut lines = Vec::new();
    let mut header: Option<String> = None;
    for (index, raw) in config.lines().enumerate() {
        let text = raw.trim_end();
        let trimmed = text.trim_start();
        if trimmed.is_empty() || is_separator(trimmed) || profile.is_noise(trimmed) {
            continue;
        }
        let indented = text.len() != trimmed.len();
        let section = if indented {
            header.clone()
        } else {
            header = Some(text.to_string());
            None
        };
        lines.push(ConfigLine {
            text: text.to_string(),
            section,
            number: index + 1,
        });
    }
    lines
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    line: String,
    children: Vec<String>,
}

/// Ordered two-level view of a configuration: top-level lines and the
/// trimmed lines nested under each. Comments are not part of the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigModel {
    sections: Vec<Section>,
}

impl ConfigModel {
    pub fn parse(config: &str, profile: &PlatformProfile) -> Self {
        let mut model = Self::default();
        for line in normalize_config(config, profile) {
            if profile.is_comment(&line.text) {
                continue;
            }
            match line.section {
                Some(section) => model.insert(Some(&section), line.text.trim()),
                None => model.insert(None, &line.text),
            }
        }
        model
    }

    fn position(&self, line: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.line == line)
    }

    pub fn contains(&self, section: Option<&str>, line: &str) -> bool {
        match section {
            None => self.position(line).is_some(),
            Some(header) => self
                .position(header)
                .is_some_and(|i| self.sections[i].children.iter().any(|c| c == line.trim())),
        }
    }

    /// Adds a line, creating its section when missing. Existing lines are
    /// left in place.
    pub fn insert(&mut self, section: Option<&str>, line: &str) {
        match section {
            None => {
                if self.position(line).is_none() {
                    self.sections.push(Section {
                        line: line.to_string(),
                        children: Vec::new(),
                    });
                }
            }
            Some(header) => {
                let index = match self.position(header) {
                    Some(index) => index,
                    None => {
                        self.sections.push(Section {
                            line: header.to_string(),
                            children: Vec::new(),
                        });
                        self.sections.len() - 1
                    }
                };
                let child = line.trim();
                let children = &mut self.sections[index].children;
                if !children.iter().any(|c| c == child) {
                    children.push(child.to_string());
                }
            }
        }
    }

    /// Removes a line. Removing a header removes its whole section.
    pub fn remove(&mut self, section: Option<&str>, line: &str) -> bool {
        match section {
            None => match self.position(line) {
                Some(index) => {
                    self.sections.remove(index);
                    true
                }
                None => false,
            },
            Some(header) => {
                let Some(index) = self.position(header) else {
                    return false;
                };
                let children = &mut self.sections[index].children;
                let before = children.len();
                children.retain(|c| c != line.trim());
                before != children.len()
            }
        }
    }

    /// Drops every top-level line, with its section, that `drop` selects.
    pub fn remove_where(&mut self, mut drop: impl FnMut(&str) -> bool) -> usize {
        let before = self.sections.len();
        self.sections.retain(|s| !drop(&s.line));
        before - self.sections.len()
    }

    /// Adds every line of `other` that is not already present.
    pub fn merge(&mut self, other: &ConfigModel) {
        for section in &other.sections {
            self.insert(None, &section.line);
            for child in &section.children {
                self.insert(Some(&section.line), child);
            }
        }
    }

    pub fn top_level(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.line.as_str())
    }

    fn canonical(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        self.sections
            .iter()
            .map(|s| {
                (
                    s.line.as_str(),
                    s.children.iter().map(String::as_str).collect(),
                )
            })
            .collect()
    }

    /// Same sections with the same children, in any order.
    pub fn equivalent(&self, other: &ConfigModel) -> bool {
        self.canonical() == other.canonical()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&section.line);
            out.push('\n');
            for child in &section.children {
                out.push(' ');
                out.push_str(child);
                out.push('\n');
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Config-mode lines recreating the whole model.
    pub fn commands(&self, section_exit: Option<&str>) -> Vec<String> {
        let mut commands = Vec::new();
        for section in &self.sections {
            commands.push(section.line.clone());
            if section.children.is_empty() {
                continue;
            }
            commands.extend(section.children.iter().cloned());
            if let Some(exit) = section_exit {
                commands.push(exit.to_string());
            }
        }
        commands
    }
}

static CATEGORY_RULES: Lazy<(RegexSet, Vec<Category>)> = Lazy::new(|| {
    let rules: [(&str, Category); 7] = [
        (
            r"(?i)^(aaa\b|crypto\b|username\b|enable\s+(secret|password)\b|password\b|local-user\b|local-aaa-user\b|ip\s+ssh\b|ssh\b|stelnet\b|radius|tacacs|hwtacacs|key\s+chain\b|service\s+password-encryption|security\b|system\s+login\b|user-interface\b|line\s+vty\b)",
            Category::Security,
        ),
        (
            r"(?i)^((ip|ipv6)\s+access-list\b|access-list\b|ip\s+access-group\b|access-group\b|acl\b|traffic-filter\b|packet-filter\b|firewall\b|object-group\b|rule\s+\d+\s+(permit|deny)\b|(\d+\s+)?(permit|deny)\b)",
            Category::AccessControl,
        ),
        (
            r"(?i)^(router\b|(ip|ipv6)\s+route\b|ip\s+route-static\b|route-map\b|ip\s+prefix-list\b|ospf\b|bgp\b|isis\b|rip\b|network\s|neighbor\b|redistribute\b|routing-options\b|protocols\b|peer\b)",
            Category::Routing,
        ),
        (
            r"(?i)^(interface\b|interfaces\b|(ip|ipv6)\s+address\b|shutdown\b|switchport\b|description\b|speed\b|duplex\b|mtu\b|channel-group\b|port\s+(link-type|access|trunk|hybrid)\b)",
            Category::Interface,
        ),
        (
            r"(?i)^(vlan\b|vlans\b|vlan\s+batch\b|port\s+default\s+vlan\b|name\s)",
            Category::Vlan,
        ),
        (r"(?i)^(snmp-server\b|snmp-agent\b|snmp\b)", Category::Snmp),
        (
            r"(?i)^(logging\b|log\b|info-center\b|syslog\b|system\s+syslog\b)",
            Category::Logging,
        ),
    ];
    let set = match RegexSet::new(rules.iter().map(|(pattern, _)| *pattern)) {
        Ok(set) => set,
        Err(err) => panic!("invalid category rule set: {err}"),
    };
    (set, rules.iter().map(|(_, category)| *category).collect())
});

static COMMAND_PREFIX: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"(?i)^\s*((no|undo|set|delete|activate|deactivate)\s+)*") {
        Ok(re) => re,
        Err(err) => panic!("invalid command prefix pattern: {err}"),
    }
});

fn classify_text(text: &str) -> Category {
    let body = COMMAND_PREFIX.replace(text, "");
    let (set, categories) = &*CATEGORY_RULES;
    set.matches(body.trim())
        .iter()
        .next()
        .map_or(Category::Other, |index| categories[index])
}

/// Category of a line; children inherit their header's category when the
/// header is recognised.
pub(super) fn classify(line: &str, section: Option<&str>, profile: &PlatformProfile) -> Category {
    if profile.is_comment(line) {
        return Category::Comment;
    }
    if let Some(header) = section {
        let inherited = classify_text(header);
        if !matches!(inherited, Category::Other | Category::Comment) {
            return inherited;
        }
    }
    classify_text(line)
}

fn diff_line(
    kind: ChangeKind,
    line: &ConfigLine,
    old: Option<&ConfigLine>,
    new_number: Option<usize>,
    profile: &PlatformProfile,
) -> DiffLine {
    let category = classify(&line.text, line.section.as_deref(), profile);
    let severity = if kind == ChangeKind::Unchanged {
        Severity::None
    } else {
        category.severity()
    };
    DiffLine {
        kind,
        line: line.text.clone(),
        old_line: old.filter(|_| kind == ChangeKind::Modified).map(|o| o.text.clone()),
        section: line.section.clone(),
        old_number: old.map(|o| o.number),
        new_number,
        category,
        severity,
    }
}

fn removed(line: &ConfigLine, profile: &PlatformProfile) -> DiffLine {
    diff_line(ChangeKind::Removed, line, Some(line), None, profile)
}

fn added(line: &ConfigLine, profile: &PlatformProfile) -> DiffLine {
    diff_line(ChangeKind::Added, line, None, Some(line.number), profile)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Compares two configurations of the same platform.
///
/// The returned diff carries no device or snapshot references; callers
/// holding snapshots fill those in.
pub fn diff_configs(
    before: &str,
    after: &str,
    profile: &PlatformProfile,
    config: &ChangeConfig,
) -> ConfigDiff {
    let old = normalize_config(before, profile);
    let new = normalize_config(after, profile);
    let old_keys: Vec<_> = old.iter().map(ConfigLine::key).collect();
    let new_keys: Vec<_> = new.iter().map(ConfigLine::key).collect();

    let mut lines = Vec::with_capacity(old.len().max(new.len()));
    for op in capture_diff_slices(Algorithm::Lcs, &old_keys, &new_keys) {
        match op {
            DiffOp::Equal {
                old_index,
                new_index,
                len,
            } => {
                for i in 0..len {
                    let (o, n) = (&old[old_index + i], &new[new_index + i]);
                    lines.push(diff_line(ChangeKind::Unchanged, n, Some(o), Some(n.number), profile));
                }
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                lines.extend(old[old_index..old_index + old_len].iter().map(|o| removed(o, profile)));
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                lines.extend(new[new_index..new_index + new_len].iter().map(|n| added(n, profile)));
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                for i in 0..old_len.max(new_len) {
                    let o = (i < old_len).then(|| &old[old_index + i]);
                    let n = (i < new_len).then(|| &new[new_index + i]);
                    match (o, n) {
                        (Some(o), Some(n)) if o.section == n.section => {
                            lines.push(diff_line(ChangeKind::Modified, n, Some(o), Some(n.number), profile));
                        }
                        (o, n) => {
                            if let Some(o) = o {
                                lines.push(removed(o, profile));
                            }
                            if let Some(n) = n {
                                lines.push(added(n, profile));
                            }
                        }
                    }
                }
            }
        }
    }

    let headers: BTreeSet<&str> = old
        .iter()
        .chain(new.iter())
        .filter_map(|l| l.section.as_deref())
        .collect();
    let summary = summarize(&lines);
    let regions = regions(&lines, &headers);
    let changed = summary.changed();
    let change_percent = round2(changed as f64 * 100.0 / old.len().max(new.len()).max(1) as f64);

    let mut risk = lines
        .iter()
        .filter(|l| l.is_change())
        .map(|l| l.severity)
        .max()
        .unwrap_or(Severity::None);
    if change_percent > config.risk_escalation_percent {
        risk = risk.escalate();
    }

    let mut diff = ConfigDiff {
        id: Uuid::new_v4(),
        device: None,
        platform: profile.key.to_string(),
        before: None,
        after: None,
        lines,
        regions,
        summary,
        change_percent,
        risk,
        recommendations: Vec::new(),
        created_at: Utc::now(),
    };
    diff.recommendations = recommendations(&diff, config);
    debug!(
        "diff on {}: +{} -{} ~{} ({}%), risk {}",
        diff.platform,
        diff.summary.added,
        diff.summary.removed,
        diff.summary.modified,
        diff.change_percent,
        diff.risk
    );
    diff
}

fn summarize(lines: &[DiffLine]) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for line in lines {
        match line.kind {
            ChangeKind::Added => summary.added += 1,
            ChangeKind::Removed => summary.removed += 1,
            ChangeKind::Modified => summary.modified += 1,
            ChangeKind::Unchanged => {
                summary.unchanged += 1;
                continue;
            }
        }
        *summary.by_category.entry(line.category).or_default() += 1;
        *summary.by_severity.entry(line.severity).or_default() += 1;
    }
    summary
}

fn regions(lines: &[DiffLine], headers: &BTreeSet<&str>) -> Vec<DiffRegion> {
    let mut regions: Vec<DiffRegion> = Vec::new();
    for line in lines.iter().filter(|l| l.is_change()) {
        let name = match &line.section {
            Some(section) => section.clone(),
            None if headers.contains(line.line.as_str()) => line.line.clone(),
            None => "global".to_string(),
        };
        let index = match regions
            .iter()
            .position(|r| r.section == name && r.category == line.category)
        {
            Some(index) => index,
            None => {
                regions.push(DiffRegion {
                    section: name,
                    category: line.category,
                    severity: line.category.severity(),
                    added: 0,
                    removed: 0,
                    modified: 0,
                });
                regions.len() - 1
            }
        };
        let region = &mut regions[index];
        match line.kind {
            ChangeKind::Added => region.added += 1,
            ChangeKind::Removed => region.removed += 1,
            ChangeKind::Modified => region.modified += 1,
            ChangeKind::Unchanged => {}
        }
    }
    regions
}

fn recommendations(diff: &ConfigDiff, config: &ChangeConfig) -> Vec<String> {
    let mut out = Vec::new();
    if diff.is_empty() {
        out.push("No configuration changes detected".to_string());
        return out;
    }
    if diff.summary.by_severity.contains_key(&Severity::Critical) {
        out.push("Critical changes detected: apply during a maintenance window".to_string());
        out.push("Make sure a complete configuration backup exists before applying".to_string());
        out.push("Apply the change in stages to ease troubleshooting".to_string());
    }
    if diff.change_percent > config.risk_escalation_percent {
        out.push("Large share of the configuration changed: review every change in detail".to_string());
    } else if diff.change_percent > REVIEW_PERCENT {
        out.push("Many lines changed: focus review on the key configuration items".to_string());
    }
    let categories = diff.categories();
    if categories.contains(&Category::Routing) {
        out.push("Routing changes included: verify network reachability afterwards".to_string());
    }
    if categories.contains(&Category::Security) || categories.contains(&Category::AccessControl) {
        out.push("Security changes included: confirm management access is preserved".to_string());
    }
    if categories.contains(&Category::Interface) {
        out.push("Interface changes included: check physical links and port state".to_string());
    }
    if out.is_empty() {
        out.push("Low-risk change: safe to apply normally".to_string());
    }
    out.push("Record the change in the change log for later tracing".to_string());
    out
}

impl ConfigDiff {
    /// Plain-text report with one marker per changed line.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(out, "Configuration diff ({})", self.platform);
        let _ = writeln!(out, "{}", "=".repeat(60));
        if let Some(device) = &self.device {
            let _ = writeln!(out, "Device: {device}");
        }
        let _ = writeln!(out, "Generated: {}", self.created_at.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(out);
        let _ = writeln!(out, "Summary:");
        let _ = writeln!(out, "  added: {}", self.summary.added);
        let _ = writeln!(out, "  removed: {}", self.summary.removed);
        let _ = writeln!(out, "  modified: {}", self.summary.modified);
        let _ = writeln!(out, "  changed: {:.1}%", self.change_percent);
        let _ = writeln!(out, "  risk: {}", self.risk);
        let _ = writeln!(out);
        let _ = writeln!(out, "Recommendations:");
        for rec in &self.recommendations {
            let _ = writeln!(out, "  - {rec}");
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Changes:");
        let mut current: Option<&str> = None;
        for line in self.changes() {
            let section = line.section.as_deref();
            if section.is_some() && section != current {
                let _ = writeln!(out, "[{}]", section.unwrap_or_default());
            }
            current = section;
            let prefix = match line.kind {
                ChangeKind::Added => "+",
                ChangeKind::Removed => "-",
                ChangeKind::Modified => "~",
                ChangeKind::Unchanged => " ",
            };
            match &line.old_line {
                Some(old) => {
                    let _ = writeln!(out, "{prefix}{} {} (was: {})", line.severity.marker(), line.line, old.trim());
                }
                None => {
                    let _ = writeln!(out, "{prefix}{} {}", line.severity.marker(), line.line);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = "\
Building configuration...

Current configuration : 1024 bytes
!
hostname edge-1
!
interface GigabitEthernet0/1
 description uplink
 ip address 10.0.0.1 255.255.255.0
!
snmp-server community public RO
logging host 10.9.9.9
end
";

    fn cisco() -> &'static PlatformProfile {
        templates::profile_for("cisco_ios")
    }

    #[test]
    fn noise_and_separators_are_dropped() {
        let lines = normalize_config(RUNNING, cisco());
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "hostname edge-1",
                "interface GigabitEthernet0/1",
                " description uplink",
                " ip address 10.0.0.1 255.255.255.0",
                "snmp-server community public RO",
                "logging host 10.9.9.9",
            ]
        );
        assert_eq!(lines[2].section.as_deref(), Some("interface GigabitEthernet0/1"));
        assert_eq!(lines[0].number, 5);
    }

    #[test]
    fn diff_against_itself_is_empty() {
        let diff = diff_configs(RUNNING, RUNNING, cisco(), &ChangeConfig::default());
        assert!(diff.is_empty());
        assert_eq!(diff.risk, Severity::None);
        assert_eq!(diff.change_percent, 0.0);
        assert!(diff.regions.is_empty());
        assert_eq!(diff.summary.unchanged, 6);
    }

    #[test]
    fn removed_snmp_community_is_critical() {
        let after = RUNNING.replace("snmp-server community public RO\n", "");
        let diff = diff_configs(RUNNING, &after, cisco(), &ChangeConfig::default());
        assert_eq!(diff.summary.removed, 1);
        let removed: Vec<_> = diff.changes().collect();
        assert_eq!(removed[0].category, Category::Snmp);
        assert_eq!(removed[0].severity, Severity::Critical);
        assert_eq!(diff.risk, Severity::Critical);
        assert!(diff.change_percent > 0.0);
    }

    #[test]
    fn child_line_change_is_modified_within_section() {
        let after = RUNNING.replace("description uplink", "description core uplink");
        let diff = diff_configs(RUNNING, &after, cisco(), &ChangeConfig::default());
        let change = diff.changes().next().expect("one change");
        assert_eq!(change.kind, ChangeKind::Modified);
        assert_eq!(change.old_line.as_deref(), Some(" description uplink"));
        assert_eq!(change.category, Category::Interface);
        assert_eq!(diff.regions.len(), 1);
        assert_eq!(diff.regions[0].section, "interface GigabitEthernet0/1");
        assert_eq!(diff.risk, Severity::High);
    }

    #[test]
    fn large_change_escalates_risk() {
        let before = "hostname a\nlogging host 1.1.1.1\n";
        let after = "hostname a\nlogging host 2.2.2.2\nlogging host 3.3.3.3\n";
        let diff = diff_configs(before, after, cisco(), &ChangeConfig::default());
        assert!(diff.change_percent > 50.0);
        assert_eq!(diff.risk, Severity::Medium);
        assert!(diff.report().contains("risk: medium"));
    }

    #[test]
    fn model_ignores_child_order() {
        let a = ConfigModel::parse("interface x\n a\n b\n", cisco());
        let b = ConfigModel::parse("interface x\n b\n a\n", cisco());
        assert!(a.equivalent(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn classification_uses_header_and_prefixes() {
        let profile = cisco();
        assert_eq!(classify("no ip route 0.0.0.0 0.0.0.0 1.1.1.1", None, profile), Category::Routing);
        assert_eq!(classify(" permit ip any any", Some("ip access-list extended X"), profile), Category::AccessControl);
        assert_eq!(classify(" name users", Some("vlan 10"), profile), Category::Vlan);
        assert_eq!(classify("! managed by netops", None, profile), Category::Comment);
        assert_eq!(classify("hostname a", None, profile), Category::Other);
    }
}
