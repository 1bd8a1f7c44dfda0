//! Online log-template clustering for failure reasons.
//!
//! Incoming messages are masked to suppress volatile substrings, then
//! matched against existing clusters through a token-count bucket and a
//! shallow prefix tree. Cluster state persists in a JSON snapshot with
//! an advisory lock enforcing the single-writer deployment constraint.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process;

use cimet_core::Cluster;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cimet-miner";

/// Token standing in for any value at a generalized template position.
pub const WILDCARD: &str = "<*>";

const SIM_THRESHOLD: f64 = 0.8;
const TREE_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error(
        "snapshot lock already held: {path} (another writer is live; \
         delete the file by hand if its owner cannot be determined)"
    )]
    LockHeld { path: PathBuf },
    #[error("reading snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("decoding snapshot {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One ordered pattern-to-placeholder substitution. Later rules operate
/// on text already masked by earlier ones.
#[derive(Debug, Clone)]
pub struct MaskRule {
    pattern: Regex,
    placeholder: String,
}

impl MaskRule {
    pub fn new(pattern: &str, placeholder: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            placeholder: placeholder.to_string(),
        })
    }
}

/// Default masking rules for CI failure text. Specific shapes come
/// before the catch-all numeric rule so they keep their placeholder.
pub fn default_mask_rules() -> Vec<MaskRule> {
    let rules = [
        (
            r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:[+-]\d{2}:?\d{2}|Z)?",
            "<TIMESTAMP>",
        ),
        (r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d+\b", "<ADDR>"),
        (r"\b(?:node|worker|host|smithi)\d+\b", "<HOST>"),
        (r"\bpid[=\s]\d+\b", "<PID>"),
        (r"\btries \(\d+\)", "<RETRIES>"),
        (r"\bretry \d+\b", "<RETRIES>"),
        (r"\b\d+\.\d+\.\d+(?:-[\w.]+)?\b", "<VERSION>"),
        (r"\b\d+(?:\.\d+)?s(?:ec(?:ond)?s?)?\b", "<DURATION>"),
        (r"\b\d+\b", "<NUM>"),
    ];
    rules
        .iter()
        .map(|(pattern, placeholder)| {
            MaskRule::new(pattern, placeholder).expect("default mask rule compiles")
        })
        .collect()
}

#[derive(Debug)]
pub struct Masker {
    rules: Vec<MaskRule>,
}

impl Masker {
    pub fn new(rules: Vec<MaskRule>) -> Self {
        Self { rules }
    }

    pub fn apply(&self, raw: &str) -> String {
        let mut text = raw.to_string();
        for rule in &self.rules {
            text = rule
                .pattern
                .replace_all(&text, rule.placeholder.as_str())
                .into_owned();
        }
        text
    }
}

impl Default for Masker {
    fn default() -> Self {
        Self::new(default_mask_rules())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    clusters: Vec<Cluster>,
}

/// Durable snapshot file plus its advisory lock.
///
/// The lock is a `create_new` sibling file holding the owner pid,
/// removed on drop. A lock whose owner is gone is stale and gets
/// reclaimed; a lock with a live or unreadable owner refuses startup.
#[derive(Debug)]
struct SnapshotStore {
    path: PathBuf,
    lock_path: PathBuf,
}

fn lock_is_stale(lock_path: &Path) -> bool {
    let Ok(text) = fs::read_to_string(lock_path) else {
        return false;
    };
    let Ok(pid) = text.trim().parse::<u32>() else {
        return false;
    };
    pid != process::id() && !Path::new(&format!("/proc/{pid}")).exists()
}

fn acquire_lock(lock_path: &Path) -> Result<(), MinerError> {
    // One reclaim attempt, then give up to the manual-removal path.
    for _ in 0..2 {
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                file.write_all(process::id().to_string().as_bytes())
                    .map_err(|source| MinerError::Write {
                        path: lock_path.to_path_buf(),
                        source,
                    })?;
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !lock_is_stale(lock_path) {
                    return Err(MinerError::LockHeld {
                        path: lock_path.to_path_buf(),
                    });
                }
                warn!(path = %lock_path.display(), "reclaiming stale lock from dead owner");
                let _ = fs::remove_file(lock_path);
            }
            Err(source) => {
                return Err(MinerError::Write {
                    path: lock_path.to_path_buf(),
                    source,
                })
            }
        }
    }
    Err(MinerError::LockHeld {
        path: lock_path.to_path_buf(),
    })
}

impl SnapshotStore {
    fn open(path: &Path) -> Result<(Self, Snapshot), MinerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| MinerError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let lock_path = path.with_extension("lock");
        acquire_lock(&lock_path)?;

        let snapshot = match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| MinerError::Decode {
                path: path.to_path_buf(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Snapshot::default(),
            Err(source) => {
                return Err(MinerError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        Ok((
            Self {
                path: path.to_path_buf(),
                lock_path,
            },
            snapshot,
        ))
    }

    /// Atomic write-temp-then-rename, so a crash mid-save never leaves a
    /// half-written snapshot behind.
    fn save(&self, snapshot: &Snapshot) -> Result<(), MinerError> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|source| MinerError::Decode {
            path: self.path.clone(),
            source,
        })?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &bytes).map_err(|source| MinerError::Write {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|source| MinerError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for SnapshotStore {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    cluster_ids: Vec<u64>,
}

fn has_digit(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

/// Branch key for one template token. Digit-bearing tokens share the
/// wildcard branch so numeric variants land in the same leaf.
fn branch_key(token: &str) -> &str {
    if token == WILDCARD || has_digit(token) {
        WILDCARD
    } else {
        token
    }
}

pub struct TemplateMiner {
    masker: Masker,
    clusters: HashMap<u64, Cluster>,
    /// Token count -> prefix tree over the first `TREE_DEPTH` tokens.
    index: HashMap<usize, Node>,
    next_id: u64,
    store: SnapshotStore,
}

impl TemplateMiner {
    pub fn open(snapshot_path: &Path) -> Result<Self, MinerError> {
        Self::open_with_masker(snapshot_path, Masker::default())
    }

    pub fn open_with_masker(snapshot_path: &Path, masker: Masker) -> Result<Self, MinerError> {
        let (store, snapshot) = SnapshotStore::open(snapshot_path)?;
        let mut miner = Self {
            masker,
            clusters: HashMap::new(),
            index: HashMap::new(),
            next_id: snapshot.next_id,
            store,
        };
        let restored = snapshot.clusters.len();
        for cluster in snapshot.clusters {
            miner.insert_into_index(&cluster);
            miner.clusters.insert(cluster.cluster_id, cluster);
        }
        debug!(restored, path = %snapshot_path.display(), "restored cluster snapshot");
        Ok(miner)
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Map one raw failure message to its cluster, creating or
    /// generalizing as needed. Snapshot save failures are logged rather
    /// than propagated; state loss is bounded by the next save.
    pub fn add_message(&mut self, raw: &str) -> Cluster {
        let masked = self.masker.apply(raw);
        let tokens: Vec<String> = masked.split_whitespace().map(str::to_string).collect();

        let matched = self.best_match(&tokens);
        let result = match matched {
            Some(cluster_id) => {
                let cluster = self
                    .clusters
                    .get_mut(&cluster_id)
                    .expect("matched cluster exists");
                generalize(&mut cluster.template, &tokens);
                cluster.match_count += 1;
                cluster.clone()
            }
            None => {
                let cluster = Cluster {
                    cluster_id: self.next_id,
                    template: tokens.clone(),
                    match_count: 1,
                };
                self.next_id += 1;
                self.insert_into_index(&cluster);
                self.clusters.insert(cluster.cluster_id, cluster.clone());
                cluster
            }
        };

        if let Err(err) = self.save() {
            warn!(error = %err, "failed to persist cluster snapshot");
        }
        result
    }

    /// Candidates share the message's token count and prefix path; the
    /// highest similarity at or above the threshold wins, first found
    /// on ties (observed behavior, not a guarantee).
    fn best_match(&self, tokens: &[String]) -> Option<u64> {
        let root = self.index.get(&tokens.len())?;
        let mut candidates = Vec::new();
        collect_candidates(root, tokens, 0, &mut candidates);

        let mut best: Option<(u64, f64)> = None;
        for cluster_id in candidates {
            let cluster = &self.clusters[&cluster_id];
            let sim = similarity(&cluster.template, tokens);
            if sim >= SIM_THRESHOLD && best.map_or(true, |(_, b)| sim > b) {
                best = Some((cluster_id, sim));
            }
        }
        best.map(|(id, _)| id)
    }

    fn insert_into_index(&mut self, cluster: &Cluster) {
        let depth = TREE_DEPTH.min(cluster.template.len());
        let mut node = self.index.entry(cluster.template.len()).or_default();
        for token in &cluster.template[..depth] {
            node = node
                .children
                .entry(branch_key(token).to_string())
                .or_default();
        }
        node.cluster_ids.push(cluster.cluster_id);
    }

    fn save(&self) -> Result<(), MinerError> {
        let mut clusters: Vec<Cluster> = self.clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.cluster_id);
        self.store.save(&Snapshot {
            next_id: self.next_id,
            clusters,
        })
    }
}

fn collect_candidates(node: &Node, tokens: &[String], level: usize, out: &mut Vec<u64>) {
    let depth = TREE_DEPTH.min(tokens.len());
    if level == depth {
        out.extend(&node.cluster_ids);
        return;
    }
    let token = &tokens[level];
    if !has_digit(token) && token != WILDCARD {
        if let Some(child) = node.children.get(token.as_str()) {
            collect_candidates(child, tokens, level + 1, out);
        }
    }
    if let Some(child) = node.children.get(WILDCARD) {
        collect_candidates(child, tokens, level + 1, out);
    }
}

/// Fraction of positions matching at the same index. A wildcard
/// template position matches any token. Callers never compare
/// sequences of different length.
fn similarity(template: &[String], tokens: &[String]) -> f64 {
    debug_assert_eq!(template.len(), tokens.len());
    if template.is_empty() {
        return 1.0;
    }
    let matches = template
        .iter()
        .zip(tokens)
        .filter(|(t, m)| *t == *m || t.as_str() == WILDCARD)
        .count();
    matches as f64 / template.len() as f64
}

/// Replace every disagreeing position with the wildcard. Once
/// wildcarded, a position never reverts.
fn generalize(template: &mut [String], tokens: &[String]) {
    for (slot, token) in template.iter_mut().zip(tokens) {
        if slot != token && slot.as_str() != WILDCARD {
            *slot = WILDCARD.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("clusters.json")
    }

    #[test]
    fn masking_is_deterministic_and_suppresses_volatile_substrings() {
        let masker = Masker::default();
        let a = masker.apply("Command failed on node012 at 2024-01-01T10:00:00.123456+0000");
        let b = masker.apply("Command failed on node099 at 2024-03-07T22:14:09.000001+0000");
        assert_eq!(a, b);
        assert_eq!(a, masker.apply("Command failed on node012 at 2024-01-01T10:00:00.123456+0000"));
        assert_eq!(a, "Command failed on <HOST> at <TIMESTAMP>");
    }

    #[test]
    fn specific_rules_mask_before_the_numeric_catch_all() {
        let masker = Masker::default();
        assert_eq!(
            masker.apply("daemon 10.0.0.1:6789 version 17.2.6-1.el9 exited with 3"),
            "daemon <ADDR> version <VERSION> exited with <NUM>"
        );
    }

    #[test]
    fn identical_messages_map_to_one_cluster() {
        let dir = tempdir().unwrap();
        let mut miner = TemplateMiner::open(&snapshot_path(&dir)).unwrap();

        let first = miner.add_message("Test failure: reached maximum tries (301)");
        let second = miner.add_message("Test failure: reached maximum tries (904)");

        assert_eq!(first.cluster_id, second.cluster_id);
        assert_eq!(second.match_count, 2);
        assert_eq!(miner.cluster_count(), 1);
    }

    #[test]
    fn merge_at_threshold_generalizes_mismatched_positions() {
        let dir = tempdir().unwrap();
        let mut miner = TemplateMiner::open(&snapshot_path(&dir)).unwrap();

        // 5 tokens, 4 equal -> similarity 0.8, exactly at threshold.
        let first = miner.add_message("daemon crashed during shutdown early");
        let second = miner.add_message("daemon crashed during shutdown late");

        assert_eq!(first.cluster_id, second.cluster_id);
        assert_eq!(
            second.template,
            vec!["daemon", "crashed", "during", "shutdown", WILDCARD]
        );

        // A wildcarded position never reverts, even on an exact replay.
        let third = miner.add_message("daemon crashed during shutdown early");
        assert_eq!(third.template.last().map(String::as_str), Some(WILDCARD));
    }

    #[test]
    fn below_threshold_creates_a_new_cluster_with_masked_tokens() {
        let dir = tempdir().unwrap();
        let mut miner = TemplateMiner::open(&snapshot_path(&dir)).unwrap();

        let first = miner.add_message("daemon crashed during shutdown early");
        let second = miner.add_message("workload timed out during teardown");

        assert_ne!(first.cluster_id, second.cluster_id);
        assert_eq!(
            second.template,
            vec!["workload", "timed", "out", "during", "teardown"]
        );
        assert_eq!(second.match_count, 1);
    }

    #[test]
    fn different_token_counts_are_never_compared() {
        let dir = tempdir().unwrap();
        let mut miner = TemplateMiner::open(&snapshot_path(&dir)).unwrap();

        let first = miner.add_message("daemon crashed during shutdown");
        let second = miner.add_message("daemon crashed during shutdown early");
        assert_ne!(first.cluster_id, second.cluster_id);
    }

    #[test]
    fn snapshot_restores_cluster_identity_across_processes() {
        let dir = tempdir().unwrap();
        let path = snapshot_path(&dir);

        let first = {
            let mut miner = TemplateMiner::open(&path).unwrap();
            miner.add_message("Test failure: reached maximum tries (301)")
        };

        let mut reopened = TemplateMiner::open(&path).unwrap();
        let second = reopened.add_message("Test failure: reached maximum tries (77)");

        assert_eq!(first.cluster_id, second.cluster_id);
        assert_eq!(second.match_count, 2);
    }

    #[test]
    fn new_clusters_after_restart_never_reuse_ids() {
        let dir = tempdir().unwrap();
        let path = snapshot_path(&dir);

        let first = {
            let mut miner = TemplateMiner::open(&path).unwrap();
            miner.add_message("daemon crashed during shutdown")
        };

        let mut reopened = TemplateMiner::open(&path).unwrap();
        let second = reopened.add_message("workload timed out during teardown phase");
        assert!(second.cluster_id > first.cluster_id);
    }

    #[test]
    fn second_writer_is_refused_while_lock_is_held() {
        let dir = tempdir().unwrap();
        let path = snapshot_path(&dir);

        let _live = TemplateMiner::open(&path).unwrap();
        let err = TemplateMiner::open(&path).err().expect("lock conflict");
        assert!(matches!(err, MinerError::LockHeld { .. }));
    }

    #[test]
    fn stale_lock_from_a_dead_owner_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = snapshot_path(&dir);

        // Far beyond any kernel pid limit, so the owner cannot be alive.
        fs::write(path.with_extension("lock"), "999999999").unwrap();
        let miner = TemplateMiner::open(&path).expect("stale lock reclaimed");
        drop(miner);
        assert!(!path.with_extension("lock").exists());
    }

    #[test]
    fn lock_with_an_unreadable_owner_still_refuses_startup() {
        let dir = tempdir().unwrap();
        let path = snapshot_path(&dir);

        fs::write(path.with_extension("lock"), "not-a-pid").unwrap();
        let err = TemplateMiner::open(&path).err().expect("lock conflict");
        assert!(matches!(err, MinerError::LockHeld { .. }));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = snapshot_path(&dir);

        drop(TemplateMiner::open(&path).unwrap());
        assert!(TemplateMiner::open(&path).is_ok());
    }
}
