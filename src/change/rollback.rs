use super::*;

static HIGH_RISK: Lazy<RegexSet> = Lazy::new(|| {
    match RegexSet::new([
        r"(?i)\b(no|undo|delete)\s+interfaces?\b",
        r"(?i)\b(no|undo)\s+ip\s+route",
        r"(?i)\b(no|undo)\s+router\b",
        r"(?i)^\s*shutdown\b",
        r"(?i)\b(no|undo)\s+(ip\s+)?access-list\b",
    ]) {
        Ok(set) => set,
        Err(err) => panic!("invalid rollback risk patterns: {err}"),
    }
});

static MEDIUM_RISK: Lazy<RegexSet> = Lazy::new(|| {
    match RegexSet::new([
        r"(?i)\b(no|undo|delete)\s+vlans?\b",
        r"(?i)\b(no|undo)\s+switchport\b",
        r"(?i)\bdescription\b",
    ]) {
        Ok(set) => set,
        Err(err) => panic!("invalid rollback risk patterns: {err}"),
    }
});

static COMPLEX: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"(?i)\b(interfaces?|router|access-list|crypto)\b") {
        Ok(re) => re,
        Err(err) => panic!("invalid complex command pattern: {err}"),
    }
});

/// More than this many medium-risk commands raise the plan to medium.
const MEDIUM_RISK_COUNT: usize = 5;

fn assess_risk(commands: &[String]) -> RollbackRisk {
    if commands.iter().any(|c| HIGH_RISK.is_match(c)) {
        return RollbackRisk::High;
    }
    match commands.iter().filter(|c| MEDIUM_RISK.is_match(c)).count() {
        0 => RollbackRisk::Minimal,
        n if n > MEDIUM_RISK_COUNT => RollbackRisk::Medium,
        _ => RollbackRisk::Low,
    }
}

fn estimate_seconds(commands: &[String], config: &ChangeConfig) -> u64 {
    let complex = commands.iter().filter(|c| COMPLEX.is_match(c)).count() as u64;
    config.base_rollback_secs
        + config.per_command_secs * commands.len() as u64
        + config.complex_command_secs * complex
}

/// A line keyed by its section, children compared trimmed.
type Placed = (Option<String>, String);

fn placed(line: &DiffLine, text: &str) -> Placed {
    let text = match line.section {
        Some(_) => text.trim().to_string(),
        None => text.to_string(),
    };
    (line.section.clone(), text)
}

/// Lines to withdraw and restore so that the diff's `after` side becomes
/// its `before` side. Lines that only moved cancel out.
fn inverse_lines(diff: &ConfigDiff, profile: &PlatformProfile) -> (Vec<Placed>, Vec<Placed>) {
    let mut withdraw = Vec::new();
    let mut restore = Vec::new();
    for line in diff.changes() {
        match line.kind {
            ChangeKind::Added => withdraw.push(placed(line, &line.line)),
            ChangeKind::Removed => restore.push(placed(line, &line.line)),
            ChangeKind::Modified => {
                withdraw.push(placed(line, &line.line));
                if let Some(old) = &line.old_line {
                    restore.push(placed(line, old));
                }
            }
            ChangeKind::Unchanged => {}
        }
    }
    withdraw.retain(|(_, text)| !profile.is_comment(text));
    restore.retain(|(_, text)| !profile.is_comment(text));

    let mut moved = Vec::new();
    for (i, line) in withdraw.iter().enumerate() {
        if let Some(j) = restore
            .iter()
            .enumerate()
            .position(|(j, r)| r == line && !moved.iter().any(|&(_, m)| m == j))
        {
            moved.push((i, j));
        }
    }
    let (gone_w, gone_r): (BTreeSet<usize>, BTreeSet<usize>) = moved.into_iter().unzip();
    let withdraw = withdraw
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !gone_w.contains(i))
        .map(|(_, l)| l)
        .collect();
    let restore = restore
        .into_iter()
        .enumerate()
        .filter(|(j, _)| !gone_r.contains(j))
        .map(|(_, l)| l)
        .collect();
    (withdraw, restore)
}

/// Steps ordered for execution: top-level withdrawals, then each touched
/// section, then top-level restores. `None` when a withdrawal cannot be
/// expressed in the dialect.
fn inverse_steps(diff: &ConfigDiff, profile: &PlatformProfile) -> Option<Vec<RollbackStep>> {
    let (withdraw, restore) = inverse_lines(diff, profile);
    let withdrawn_headers: BTreeSet<String> = withdraw
        .iter()
        .filter(|(section, _)| section.is_none())
        .map(|(_, line)| line.clone())
        .collect();

    let mut top_withdraw = Vec::new();
    let mut sections: Vec<(String, Vec<RollbackStep>)> = Vec::new();
    let mut top_restore = Vec::new();

    let mut section_group = |header: &str, step: RollbackStep| match sections
        .iter_mut()
        .find(|(h, _)| h == header)
    {
        Some((_, steps)) => steps.push(step),
        None => sections.push((header.to_string(), vec![step])),
    };

    for (section, line) in withdraw {
        if section.as_ref().is_some_and(|s| withdrawn_headers.contains(s)) {
            continue;
        }
        let command = profile.negate(&line)?;
        let step = RollbackStep {
            kind: StepKind::Withdraw,
            section: section.clone(),
            line,
            command,
        };
        match section {
            Some(header) => section_group(&header, step),
            None => top_withdraw.push(step),
        }
    }
    for (section, line) in restore {
        let step = RollbackStep {
            kind: StepKind::Restore,
            section: section.clone(),
            command: line.clone(),
            line,
        };
        match section {
            Some(header) => section_group(&header, step),
            None => top_restore.push(step),
        }
    }

    let mut steps = top_withdraw;
    for (_, group) in sections {
        steps.extend(group);
    }
    steps.extend(top_restore);
    Some(steps)
}

/// Renders steps into config-mode lines. Steps inside a section are
/// wrapped in the section header and the dialect's section exit.
fn render_steps(steps: &[RollbackStep], profile: &PlatformProfile) -> Vec<String> {
    let headers_with_children: BTreeSet<&str> =
        steps.iter().filter_map(|s| s.section.as_deref()).collect();
    let mut commands = Vec::with_capacity(steps.len() + 2 * headers_with_children.len());
    let mut open: Option<&str> = None;
    for step in steps {
        let section = step.section.as_deref();
        if open.is_some() && open != section {
            if let Some(exit) = profile.section_exit {
                commands.push(exit.to_string());
            }
            open = None;
        }
        match section {
            Some(header) => {
                if open.is_none() {
                    commands.push(header.to_string());
                    open = Some(header);
                }
                commands.push(step.command.clone());
            }
            None => {
                let implied = step.kind == StepKind::Restore
                    && headers_with_children.contains(step.line.as_str());
                if !implied {
                    commands.push(step.command.clone());
                }
            }
        }
    }
    if open.is_some()
        && let Some(exit) = profile.section_exit
    {
        commands.push(exit.to_string());
    }
    commands
}

impl RollbackPlan {
    /// Builds a plan that brings a device from `diff.after` back to
    /// `target`. `diff` must compare the target configuration (before) with
    /// the configuration being undone (after).
    pub fn build(
        target: &ConfigSnapshot,
        source: Option<&ConfigSnapshot>,
        diff: &ConfigDiff,
        profile: &PlatformProfile,
        config: &ChangeConfig,
    ) -> Result<Self, FleetError> {
        if diff.is_empty() {
            return Err(FleetError::ConfigDiff(format!(
                "{} already matches snapshot {}",
                target.device, target.id
            )));
        }
        let mut warnings: Vec<String> = Vec::new();
        let (strategy, commands, risk) = match inverse_steps(diff, profile) {
            Some(steps) => {
                let commands = render_steps(&steps, profile);
                let risk = assess_risk(&commands);
                (RollbackStrategy::Inverse { steps }, commands, risk)
            }
            None => {
                warn!(
                    "{}: diff cannot be inverted on {}, planning a full restore",
                    target.device, profile.key
                );
                let restored = ConfigModel::parse(&target.config, profile);
                let device_side = diff
                    .lines
                    .iter()
                    .filter(|l| l.section.is_none() && l.kind != ChangeKind::Removed)
                    .map(|l| l.line.as_str());
                let (cleared, mut commands) = match profile.clear_hierarchy {
                    Some(verb) => {
                        let cleared: Vec<String> = profile
                            .hierarchies(device_side.chain(restored.top_level()))
                            .into_iter()
                            .map(str::to_string)
                            .collect();
                        let commands: Vec<String> =
                            cleared.iter().map(|h| format!("{verb} {h}")).collect();
                        (cleared, commands)
                    }
                    None => {
                        let (withdraw, _) = inverse_lines(diff, profile);
                        warnings = withdraw
                            .into_iter()
                            .map(|(section, line)| match section {
                                Some(header) => format!("{header}: {line} stays configured"),
                                None => format!("{line} stays configured"),
                            })
                            .collect();
                        (Vec::new(), Vec::new())
                    }
                };
                commands.extend(restored.commands(profile.section_exit));
                let strategy = RollbackStrategy::FullRestore {
                    config: target.config.clone(),
                    cleared,
                };
                (strategy, commands, RollbackRisk::High)
            }
        };
        Ok(Self {
            id: Uuid::new_v4(),
            device: target.device.clone(),
            platform: target.platform.clone(),
            target_snapshot: target.id,
            source_snapshot: source.map(|s| s.id),
            source_checksum: source.map(|s| s.checksum.clone()),
            estimated_seconds: estimate_seconds(&commands, config),
            strategy,
            commands,
            warnings,
            risk,
            change_risk: diff.risk,
            status: RollbackStatus::Pending,
            dry_run: None,
            outcome: None,
            created_at: Utc::now(),
            executed_at: None,
            completed_at: None,
        })
    }

    pub fn is_full_restore(&self) -> bool {
        matches!(self.strategy, RollbackStrategy::FullRestore { .. })
    }

    /// Simulates the plan on `config` and renders the resulting model.
    pub fn apply_to(&self, config: &str, profile: &PlatformProfile) -> String {
        match &self.strategy {
            RollbackStrategy::FullRestore { config: target, cleared } => {
                let mut model = ConfigModel::parse(config, profile);
                model.remove_where(|line| {
                    profile
                        .hierarchy(line)
                        .is_some_and(|h| cleared.iter().any(|c| c == h))
                });
                model.merge(&ConfigModel::parse(target, profile));
                model.render()
            }
            RollbackStrategy::Inverse { steps } => {
                let mut model = ConfigModel::parse(config, profile);
                for step in steps {
                    match step.kind {
                        StepKind::Withdraw => {
                            model.remove(step.section.as_deref(), &step.line);
                        }
                        StepKind::Restore => model.insert(step.section.as_deref(), &step.line),
                    }
                }
                model.render()
            }
        }
    }

    /// Checks the plan against the live configuration without changing it.
    pub fn validate_against(&self, live: &str, profile: &PlatformProfile) -> DryRunReport {
        let live_checksum = checksum(live);
        let drift = self
            .source_checksum
            .as_ref()
            .is_some_and(|c| *c != live_checksum);
        let model = ConfigModel::parse(live, profile);
        let mut missing_withdrawals = Vec::new();
        let mut already_present = Vec::new();
        if let RollbackStrategy::Inverse { steps } = &self.strategy {
            for step in steps {
                let present = model.contains(step.section.as_deref(), &step.line);
                match step.kind {
                    StepKind::Withdraw if !present => missing_withdrawals.push(step.line.clone()),
                    StepKind::Restore if present => already_present.push(step.line.clone()),
                    _ => {}
                }
            }
        }
        DryRunReport {
            valid: !drift && missing_withdrawals.is_empty() && self.warnings.is_empty(),
            live_checksum,
            drift,
            missing_withdrawals,
            already_present,
            commands: self.commands.clone(),
            checked_at: Utc::now(),
        }
    }
}
