//! Process scoping for callstack sampling.
//!
//! Every pid is classified once per data source, the first time a sample for it shows up. The
//! rules are evaluated in a fixed order:
//!
//! 1. an explicit exclude (cmdline glob or pid) rejects,
//! 2. an explicit allow (cmdline glob or pid) accepts,
//! 3. no allow rules at all accepts,
//! 4. the pid falls into the chosen process shard,
//! 5. the cmdline is one of the first `additional_cmdline_count` cmdlines seen.
//!
//! Anything else is rejected.

use std::collections::HashSet;
use std::fs;

use anyhow::{Context, Result};
use rand::Rng;
use regex::Regex;

/// Subset of all processes selected by `pid % shard_count`. Shared by every data source in a
/// tracing session so they agree on which processes are in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSharding {
    pub shard_count: u32,
    pub chosen_shard: u32,
}

impl ProcessSharding {
    /// Picks one of `shard_count` shards at random. `shard_count` must be non-zero.
    pub fn choose<R: Rng>(shard_count: u32, rng: &mut R) -> Self {
        ProcessSharding {
            shard_count,
            chosen_shard: rng.random_range(0..shard_count),
        }
    }
}

/// A cmdline glob. Patterns starting with `/` are matched against the full argv0, everything
/// else against the binary name.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let escaped = regex::escape(pattern)
            .replace(r"\*", ".*")
            .replace(r"\?", ".");
        let regex = Regex::new(&format!("^{escaped}$"))
            .with_context(|| format!("Invalid cmdline pattern {pattern}"))?;
        Ok(GlobPattern {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, cmdline: &str, binname: &str) -> bool {
        if self.pattern.starts_with('/') {
            self.regex.is_match(cmdline)
        } else {
            self.regex.is_match(binname)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    pub cmdlines: Vec<GlobPattern>,
    pub exclude_cmdlines: Vec<GlobPattern>,
    pub pids: HashSet<i32>,
    pub exclude_pids: HashSet<i32>,
    pub additional_cmdline_count: u32,
    pub process_sharding: Option<ProcessSharding>,
}

impl TargetFilter {
    pub fn is_empty(&self) -> bool {
        self.cmdlines.is_empty()
            && self.pids.is_empty()
            && self.additional_cmdline_count == 0
            && self.process_sharding.is_none()
    }
}

/// Binary name of an argv0: everything after the last `/`.
pub fn binary_name(cmdline: &str) -> &str {
    match cmdline.rfind('/') {
        Some(idx) => &cmdline[idx + 1..],
        None => cmdline,
    }
}

/// Reads argv0 of `pid`. Returns `None` for kernel threads (empty cmdline) and for processes
/// that are already gone.
pub fn read_proc_pid_cmdline(pid: i32) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let argv0 = raw.split(|&b| b == 0).next().unwrap_or_default();
    if argv0.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(argv0).into_owned())
}

/// Whether samples for `pid` should be dropped. `skip_cmdline` is set for kernel threads, whose
/// cmdline is meaningless. `additional_cmdlines` is the per data source memo backing
/// `additional_cmdline_count`.
pub fn should_reject_due_to_filter<F>(
    pid: i32,
    filter: &TargetFilter,
    skip_cmdline: bool,
    additional_cmdlines: &mut HashSet<String>,
    read_cmdline: F,
) -> bool
where
    F: FnOnce(i32) -> Option<String>,
{
    let cmdline = if skip_cmdline { None } else { read_cmdline(pid) };
    let binname = cmdline.as_deref().map(binary_name).unwrap_or("");

    let has_matching_pattern = |patterns: &[GlobPattern]| match cmdline.as_deref() {
        Some(cmdline) => patterns.iter().any(|p| p.matches(cmdline, binname)),
        None => false,
    };

    if has_matching_pattern(&filter.exclude_cmdlines) {
        tracing::debug!("Explicitly rejecting samples for pid [{pid}] due to cmdline");
        return true;
    }
    if filter.exclude_pids.contains(&pid) {
        tracing::debug!("Explicitly rejecting samples for pid [{pid}] due to pid");
        return true;
    }

    if has_matching_pattern(&filter.cmdlines) {
        return false;
    }
    if filter.pids.contains(&pid) {
        return false;
    }

    if filter.is_empty() {
        return false;
    }

    if let Some(sharding) = filter.process_sharding {
        if (pid as u32) % sharding.shard_count == sharding.chosen_shard {
            return false;
        }
    }

    if let Some(cmdline) = cmdline {
        if additional_cmdlines.contains(&cmdline) {
            return false;
        }
        if additional_cmdlines.len() < filter.additional_cmdline_count as usize {
            additional_cmdlines.insert(cmdline);
            return false;
        }
    }

    tracing::debug!("Rejecting samples for pid [{pid}]");
    true
}
