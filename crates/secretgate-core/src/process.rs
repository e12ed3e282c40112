//! Process-chain resolution.
//!
//! A request arriving over the bus names a connection, and a connection names
//! a PID. That PID is frequently a shell that merely forwarded the call. To
//! tell a human *what* is asking, the resolver walks parent links toward the
//! root and picks a "true invoker" that is not a shell.
//!
//! Reads are best-effort. An unreadable process ends the walk; nothing here
//! returns an error. This is an attribution aid, not a security boundary.
//!
//! # Invoker strategies
//!
//! Bus senders and local peers are attributed differently, so the choice of
//! invoker is behind [`InvokerStrategy`]:
//!
//! - [`BusSenderStrategy`]: skip leading shells.
//! - [`LocalPeerStrategy`]: skip a fixed number of immediate ancestors (the
//!   thin client and the program that spawned it), then skip shells.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Shells skipped when looking for the invoking program.
pub const KNOWN_SHELLS: &[&str] = &["sh", "bash", "zsh", "fish", "dash", "csh", "tcsh", "ksh"];

/// Upper bound on chain length; guards against PID cycles in corrupt sources.
pub const MAX_CHAIN_DEPTH: usize = 64;

/// Default number of ancestors [`LocalPeerStrategy`] skips.
pub const DEFAULT_LOCAL_PEER_SKIP: usize = 2;

/// One link in a process chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Short command name (`comm`).
    pub name: String,
    /// Process ID.
    pub pid: u32,
}

impl ProcessInfo {
    /// Creates a new process entry.
    #[must_use]
    pub fn new(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
        }
    }
}

/// The subset of `/proc/<pid>/stat` the resolver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    /// Command name.
    pub name: String,
    /// Parent PID.
    pub ppid: u32,
    /// Session ID.
    pub session: u32,
}

/// Source of per-process information.
pub trait ProcessSource: Send + Sync {
    /// Returns the stat entry for `pid`, or `None` if it cannot be read.
    fn stat(&self, pid: u32) -> Option<ProcStat>;
}

/// [`ProcessSource`] backed by a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    root: PathBuf,
}

impl ProcfsSource {
    /// Reads from `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Reads from a procfs mounted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the procfs root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for ProcfsSource {
    fn stat(&self, pid: u32) -> Option<ProcStat> {
        let contents = std::fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        parse_stat(&contents)
    }
}

/// Parses a `/proc/<pid>/stat` line.
///
/// The command name is enclosed in parentheses and may itself contain spaces
/// or parentheses, so fields are located relative to the *last* `)`.
#[must_use]
pub fn parse_stat(contents: &str) -> Option<ProcStat> {
    let open = contents.find('(')?;
    let (head, after_comm) = contents.rsplit_once(')')?;
    let name = head.get(open + 1..)?.to_string();
    let tokens: Vec<&str> = after_comm.split_whitespace().collect();
    // state ppid pgrp session ...
    let ppid = tokens.get(1)?.parse().ok()?;
    let session = tokens.get(3)?.parse().ok()?;
    Some(ProcStat {
        name,
        ppid,
        session,
    })
}

/// Returns `true` if `name` is a known shell.
///
/// Login shells report themselves as `-bash`; the dash is ignored.
#[must_use]
pub fn is_shell(name: &str) -> bool {
    let name = name.strip_prefix('-').unwrap_or(name);
    KNOWN_SHELLS.contains(&name)
}

/// Walks from `pid` toward the root.
///
/// The walk stops before PID 1, at the first unreadable process, or, when
/// `trim_at_session_leader` is set, right after the first process that leads
/// its own session.
#[must_use]
pub fn read_process_chain(
    source: &dyn ProcessSource,
    pid: u32,
    trim_at_session_leader: bool,
) -> Vec<ProcessInfo> {
    let mut chain = Vec::new();
    let mut current = pid;

    while current > 1 && chain.len() < MAX_CHAIN_DEPTH {
        let Some(stat) = source.stat(current) else {
            break;
        };
        chain.push(ProcessInfo::new(stat.name, current));

        if trim_at_session_leader && stat.session == current {
            break;
        }
        if stat.ppid == current {
            break;
        }
        current = stat.ppid;
    }

    chain
}

/// Resolves the invoker for `pid` using [`BusSenderStrategy`].
///
/// Returns the process itself if it is not a shell, the first non-shell
/// ancestor otherwise, or the process itself if every ancestor is a shell.
/// Returns `None` only if `pid` cannot be read.
#[must_use]
pub fn resolve_invoker(source: &dyn ProcessSource, pid: u32) -> Option<ProcessInfo> {
    BusSenderStrategy.resolve_invoker(&read_process_chain(source, pid, false))
}

/// Picks the process to attribute a request to from a process chain.
pub trait InvokerStrategy: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Returns the invoker, or `None` if `chain` is empty.
    fn resolve_invoker(&self, chain: &[ProcessInfo]) -> Option<ProcessInfo>;
}

/// Strategy for bus senders: the sender itself, unless it is a shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusSenderStrategy;

impl InvokerStrategy for BusSenderStrategy {
    fn name(&self) -> &'static str {
        "bus-sender"
    }

    fn resolve_invoker(&self, chain: &[ProcessInfo]) -> Option<ProcessInfo> {
        chain
            .iter()
            .find(|p| !is_shell(&p.name))
            .or_else(|| chain.first())
            .cloned()
    }
}

/// Strategy for local peers: skip the thin client and the intercepted
/// program, then skip shells.
#[derive(Debug, Clone, Copy)]
pub struct LocalPeerStrategy {
    /// Immediate ancestors skipped before shell skipping starts.
    pub skip_ancestors: usize,
}

impl LocalPeerStrategy {
    /// Creates a strategy that skips `skip_ancestors` entries.
    #[must_use]
    pub const fn new(skip_ancestors: usize) -> Self {
        Self { skip_ancestors }
    }
}

impl Default for LocalPeerStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_PEER_SKIP)
    }
}

impl InvokerStrategy for LocalPeerStrategy {
    fn name(&self) -> &'static str {
        "local-peer"
    }

    fn resolve_invoker(&self, chain: &[ProcessInfo]) -> Option<ProcessInfo> {
        chain
            .iter()
            .skip(self.skip_ancestors)
            .find(|p| !is_shell(&p.name))
            .or_else(|| chain.last())
            .cloned()
    }
}

/// In-memory [`ProcessSource`] for tests of code that walks process chains.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::collections::HashMap;

    use super::{ProcStat, ProcessSource};

    /// In-memory process table: pid -> (name, ppid, session).
    #[derive(Debug, Default)]
    pub struct FakeProcesses {
        entries: HashMap<u32, ProcStat>,
    }

    impl FakeProcesses {
        /// Adds `pid` named `name` with parent `ppid` in `session`.
        #[must_use]
        pub fn with(mut self, pid: u32, name: &str, ppid: u32, session: u32) -> Self {
            self.entries.insert(
                pid,
                ProcStat {
                    name: name.to_string(),
                    ppid,
                    session,
                },
            );
            self
        }
    }

    impl ProcessSource for FakeProcesses {
        fn stat(&self, pid: u32) -> Option<ProcStat> {
            self.entries.get(&pid).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeProcesses;
    use super::*;

    fn names(chain: &[ProcessInfo]) -> Vec<&str> {
        chain.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_parse_stat_with_spaces_in_name() {
        let stat = parse_stat("4242 (tmux: server) S 1 4242 4242 0 -1 4194560 0 0").unwrap();
        assert_eq!(stat.name, "tmux: server");
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.session, 4242);

        let stat = parse_stat("17 (a) b)) R 9 17 3 0").unwrap();
        assert_eq!(stat.name, "a) b)");
        assert_eq!(stat.ppid, 9);
        assert_eq!(stat.session, 3);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat("").is_none());
        assert!(parse_stat("12 (x) S").is_none());
        assert!(parse_stat("12 (x) S notanumber 1 1").is_none());
    }

    #[test]
    fn test_shell_chain_resolves_to_claude() {
        let procs = FakeProcesses::default()
            .with(300, "bash", 200, 50)
            .with(200, "zsh", 100, 50)
            .with(100, "claude", 50, 50)
            .with(50, "sshd", 1, 50);

        let invoker = resolve_invoker(&procs, 300).unwrap();
        assert_eq!(invoker, ProcessInfo::new("claude", 100));
    }

    #[test]
    fn test_non_shell_is_returned_unchanged() {
        let procs = FakeProcesses::default()
            .with(300, "python3", 200, 50)
            .with(200, "bash", 1, 50);

        assert_eq!(
            resolve_invoker(&procs, 300).unwrap(),
            ProcessInfo::new("python3", 300)
        );
    }

    #[test]
    fn test_all_shells_returns_original() {
        let procs = FakeProcesses::default()
            .with(300, "sh", 200, 100)
            .with(200, "-bash", 100, 100)
            .with(100, "zsh", 1, 100);

        assert_eq!(
            resolve_invoker(&procs, 300).unwrap(),
            ProcessInfo::new("sh", 300)
        );
    }

    #[test]
    fn test_unreadable_pid_resolves_to_none() {
        assert!(resolve_invoker(&FakeProcesses::default(), 99).is_none());
    }

    #[test]
    fn test_chain_stops_before_init_and_at_unreadable() {
        let procs = FakeProcesses::default()
            .with(30, "git", 20, 10)
            .with(20, "bash", 10, 10)
            .with(10, "login", 1, 10)
            .with(1, "systemd", 0, 1);
        assert_eq!(
            names(&read_process_chain(&procs, 30, false)),
            ["git", "bash", "login"]
        );

        let gap = FakeProcesses::default()
            .with(30, "git", 20, 10)
            .with(10, "login", 1, 10);
        assert_eq!(names(&read_process_chain(&gap, 30, false)), ["git"]);
    }

    #[test]
    fn test_chain_trims_after_session_leader() {
        let procs = FakeProcesses::default()
            .with(30, "git", 20, 20)
            .with(20, "bash", 10, 20)
            .with(10, "tmux", 1, 10);

        assert_eq!(
            names(&read_process_chain(&procs, 30, true)),
            ["git", "bash"]
        );
        assert_eq!(
            names(&read_process_chain(&procs, 30, false)),
            ["git", "bash", "tmux"]
        );
    }

    #[test]
    fn test_chain_cycle_is_bounded() {
        let procs = FakeProcesses::default()
            .with(5, "a", 6, 0)
            .with(6, "b", 5, 0);
        assert_eq!(read_process_chain(&procs, 5, false).len(), MAX_CHAIN_DEPTH);
    }

    #[test]
    fn test_local_peer_strategy_skips_client_and_program() {
        let chain = vec![
            ProcessInfo::new("secretgate-sign", 40),
            ProcessInfo::new("git", 30),
            ProcessInfo::new("bash", 20),
            ProcessInfo::new("claude", 10),
        ];

        let local = LocalPeerStrategy::default();
        assert_eq!(
            local.resolve_invoker(&chain).unwrap(),
            ProcessInfo::new("claude", 10)
        );
        // The bus strategy would stop at the thin client itself.
        assert_eq!(
            BusSenderStrategy.resolve_invoker(&chain).unwrap(),
            ProcessInfo::new("secretgate-sign", 40)
        );
    }

    #[test]
    fn test_local_peer_strategy_falls_back_to_last() {
        let chain = vec![
            ProcessInfo::new("secretgate-sign", 40),
            ProcessInfo::new("git", 30),
            ProcessInfo::new("zsh", 20),
        ];
        assert_eq!(
            LocalPeerStrategy::default().resolve_invoker(&chain).unwrap(),
            ProcessInfo::new("zsh", 20)
        );
        assert!(LocalPeerStrategy::default().resolve_invoker(&[]).is_none());
    }

    #[test]
    fn test_is_shell() {
        for shell in KNOWN_SHELLS {
            assert!(is_shell(shell));
        }
        assert!(is_shell("-zsh"));
        assert!(!is_shell("claude"));
        assert!(!is_shell("bash2"));
    }

    #[test]
    fn test_procfs_source_reads_fixture_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let write = |pid: u32, line: &str| {
            let dir = tmp.path().join(pid.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("stat"), line).unwrap();
        };
        write(12, "12 (bash) S 7 12 7 0");
        write(7, "7 (code) S 1 7 7 0");

        let source = ProcfsSource::with_root(tmp.path());
        let invoker = resolve_invoker(&source, 12).unwrap();
        assert_eq!(invoker, ProcessInfo::new("code", 7));
    }
}
