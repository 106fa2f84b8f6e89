//! Process tree inspection through `/proc`.
//!
//! The governor's watchdog uses this to measure every descendant of a
//! governed command, including processes that were reparented onto the
//! sandbox's subreaper or that stayed in its process group.

use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::fs::MetadataExt;

/// The few `/proc/<pid>/stat` fields the watchdog needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub ppid: i32,
    pub pgrp: i32,
    pub threads: u64,
    pub rss_pages: u64,
}

/// Parse the contents of `/proc/<pid>/stat`.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so fields are located relative to the last `)`.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid: i32 = content[..open].trim().parse().ok()?;
    let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();

    // rest[0] is field 3 (state); field N lives at rest[N - 3]
    let field = |n: usize| rest.get(n - 3).copied();

    Some(ProcStat {
        pid,
        ppid: field(4)?.parse().ok()?,
        pgrp: field(5)?.parse().ok()?,
        threads: field(20)?.parse().ok()?,
        rss_pages: field(24)?.parse().ok()?,
    })
}

/// Read every process currently visible in `/proc`
pub fn snapshot() -> Vec<ProcStat> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_name().to_str()
                .map(|name| name.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false)
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|content| parse_stat(&content))
        .collect()
}

/// Aggregate usage of one governed process tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeUsage {
    /// Member pids, the root included
    pub pids: Vec<i32>,
    /// Threads across all members, the root excluded
    pub threads: u64,
    /// Resident memory across all members, the root excluded
    pub rss_kb: u64,
}

/// Collect the tree rooted at `root` plus every process in group `pgid`.
///
/// The root is the sandbox supervisor, which only waits; it is listed in
/// `pids` but not counted against the submission's budgets.
pub fn tree_usage(root: i32, pgid: i32, procs: &[ProcStat], page_kb: u64) -> TreeUsage {
    let mut children: HashMap<i32, Vec<&ProcStat>> = HashMap::new();
    for stat in procs {
        children.entry(stat.ppid).or_default().push(stat);
    }

    let mut members: HashSet<i32> = HashSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if !members.insert(pid) {
            continue;
        }
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().map(|s| s.pid));
        }
    }

    let mut usage = TreeUsage::default();
    for stat in procs {
        if !members.contains(&stat.pid) && stat.pgrp != pgid {
            continue;
        }
        usage.pids.push(stat.pid);
        if stat.pid != root {
            usage.threads += stat.threads;
            usage.rss_kb += stat.rss_pages * page_kb;
        }
    }
    usage
}

/// Size of a memory page in kilobytes
pub fn page_kb() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 / 1024 } else { 4 }
}

/// Send `signal` to every process whose effective uid is `uid`.
///
/// Used to tear down everything a dedicated sandbox identity left behind.
/// Returns the number of processes signalled.
pub fn signal_uid(uid: u32, signal: libc::c_int) -> usize {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };

    let mut count = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        match entry.metadata() {
            Ok(meta) if meta.uid() == uid => {
                if unsafe { libc::kill(pid, signal) } == 0 {
                    count += 1;
                }
            }
            _ => {}
        }
    }
    count
}
