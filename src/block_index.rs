//! Block index: the tree of every header ever seen
//!
//! Entries live in an arena and refer to their parent by index, so the
//! tree never owns cycles. Each entry carries its cumulative work and a
//! status that only moves forward, except into the invalid sink. Marking a
//! block invalid runs an explicit pass over its descendants.
//!
//! Candidates for the active tip are kept ordered by (cumulative work,
//! earliest data arrival), so tip selection is a lookup rather than a
//! rescan.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::params::ConsensusParams;
use crate::pow::{
    block_work, calculate_next_work_required, check_proof_of_work, is_retarget_height,
    median_time_past, U256,
};
use crate::types::*;

/// Validation progress of a block. Ordered: later variants of the valid
/// range imply the earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Header accepted, no block data yet
    HeaderOnly,
    /// Block data passed the stateless checks
    ValidStructure,
    /// Block data passed the checks against its ancestors
    ValidContext,
    /// Block was connected on top of a fully valid chain at least once
    ValidChain,
    /// Block failed validation itself
    Invalid,
    /// Block descends from an invalid block
    InvalidChild,
}

impl BlockStatus {
    pub fn is_invalid(self) -> bool {
        matches!(self, BlockStatus::Invalid | BlockStatus::InvalidChild)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("unknown parent {}", hash_to_hex(.0))]
    UnknownParent(Hash),
    #[error("header already known")]
    Duplicate,
    #[error("header previously marked invalid")]
    KnownInvalid,
    #[error("header hash does not meet its proof-of-work target")]
    InvalidProofOfWork,
    #[error("incorrect difficulty bits {actual:#010x}, expected {expected:#010x}")]
    BadDifficulty { expected: u32, actual: u32 },
    #[error("timestamp {time} not above median time past {median}")]
    TimeTooOld { time: u32, median: u32 },
    #[error("timestamp {time} too far ahead of adjusted time {now}")]
    TimeTooNew { time: u32, now: u64 },
    #[error("header descends from an invalid block")]
    InvalidParent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub hash: Hash,
    pub header: BlockHeader,
    pub parent: Option<usize>,
    /// Ancestor used to jump back in logarithmic steps
    skip: Option<usize>,
    pub height: Natural,
    pub chain_work: U256,
    pub status: BlockStatus,
    /// Block data has been received and stored
    pub has_data: bool,
    /// This block and all of its ancestors have data
    pub chain_has_data: bool,
    /// Order in which the block became connectable (its whole chain has
    /// data); earlier wins ties
    pub sequence_id: u64,
    children: Vec<usize>,
}

fn invert_lowest_one(value: u64) -> u64 {
    value & value.saturating_sub(1)
}

fn skip_height(height: Natural) -> Natural {
    if height < 2 {
        0
    } else if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

type CandidateKey = (U256, Reverse<u64>, usize);

#[derive(Debug, Clone)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash, usize>,
    /// Blocks with data whose chain is complete and not known invalid
    candidates: BTreeSet<CandidateKey>,
    /// parent index -> children with data waiting for the parent's chain data
    unlinked: HashMap<usize, Vec<usize>>,
    active: Vec<usize>,
    next_sequence: u64,
}

impl BlockIndex {
    /// New index rooted at `genesis`, which is the active tip
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let entry = BlockIndexEntry {
            hash,
            chain_work: block_work(genesis.bits),
            header: genesis,
            parent: None,
            skip: None,
            height: 0,
            status: BlockStatus::ValidChain,
            has_data: true,
            chain_has_data: true,
            sequence_id: 0,
            children: Vec::new(),
        };
        let mut index = Self {
            candidates: BTreeSet::new(),
            by_hash: HashMap::new(),
            unlinked: HashMap::new(),
            active: vec![0],
            next_sequence: 1,
            entries: Vec::new(),
        };
        index.candidates.insert(Self::key_of(&entry, 0));
        index.by_hash.insert(hash, 0);
        index.entries.push(entry);
        index
    }

    fn key_of(entry: &BlockIndexEntry, idx: usize) -> CandidateKey {
        (entry.chain_work, Reverse(entry.sequence_id), idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, hash: &Hash) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    pub fn entry(&self, idx: usize) -> &BlockIndexEntry {
        &self.entries[idx]
    }

    pub fn entry_by_hash(&self, hash: &Hash) -> Option<&BlockIndexEntry> {
        self.find(hash).map(|idx| &self.entries[idx])
    }

    pub fn genesis(&self) -> usize {
        0
    }

    // ============================================================================
    // Active chain
    // ============================================================================

    pub fn tip(&self) -> usize {
        self.active.last().copied().unwrap_or(0)
    }

    pub fn tip_entry(&self) -> &BlockIndexEntry {
        &self.entries[self.tip()]
    }

    pub fn active_height(&self) -> Natural {
        self.active.len().saturating_sub(1) as Natural
    }

    pub fn active_at(&self, height: Natural) -> Option<usize> {
        self.active.get(height as usize).copied()
    }

    pub fn is_active(&self, idx: usize) -> bool {
        self.active_at(self.entries[idx].height) == Some(idx)
    }

    /// Make `idx` the active tip, rewriting the active chain from the fork
    pub fn set_tip(&mut self, idx: usize) {
        let height = self.entries[idx].height as usize;
        self.active.truncate(height + 1);
        let mut path = Vec::new();
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            let h = self.entries[i].height as usize;
            if self.active.get(h) == Some(&i) {
                break;
            }
            path.push(i);
            cursor = self.entries[i].parent;
        }
        if let Some(&lowest) = path.last() {
            self.active.truncate(self.entries[lowest].height as usize);
        }
        self.active.extend(path.into_iter().rev());
    }

    /// Hashes stepping back from the tip: ten single steps, then doubling
    pub fn locator(&self) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let mut height = self.active_height() as i64;
        let mut step = 1i64;
        while height > 0 {
            hashes.push(self.entries[self.active[height as usize]].hash);
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        hashes.push(self.entries[0].hash);
        hashes
    }

    // ============================================================================
    // Ancestry
    // ============================================================================

    /// GetAncestor: entry × height → entry
    pub fn get_ancestor(&self, idx: usize, height: Natural) -> Option<usize> {
        let mut current = idx;
        if height > self.entries[current].height {
            return None;
        }
        if self.is_active(current) {
            return self.active_at(height);
        }
        while self.entries[current].height > height {
            let entry = &self.entries[current];
            current = match entry.skip {
                Some(skip) if self.entries[skip].height >= height => skip,
                _ => entry.parent?,
            };
        }
        Some(current)
    }

    /// FindCommonAncestor: walk both entries back to equal height, then in
    /// lockstep until they meet
    pub fn find_common_ancestor(&self, a: usize, b: usize) -> usize {
        let height = self.entries[a].height.min(self.entries[b].height);
        let mut a = self.get_ancestor(a, height).unwrap_or(0);
        let mut b = self.get_ancestor(b, height).unwrap_or(0);
        while a != b {
            match (self.entries[a].parent, self.entries[b].parent) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => return 0,
            }
        }
        a
    }

    /// Median of the timestamps of `idx` and its predecessors
    pub fn median_time_past(&self, idx: usize, params: &ConsensusParams) -> u32 {
        let mut times = Vec::with_capacity(params.median_time_span);
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            if times.len() == params.median_time_span {
                break;
            }
            times.push(self.entries[i].header.timestamp);
            cursor = self.entries[i].parent;
        }
        median_time_past(&times)
    }

    /// Difficulty bits required for a child of `parent`
    pub fn required_bits(&self, parent: usize, params: &ConsensusParams) -> u32 {
        let entry = &self.entries[parent];
        let height = entry.height + 1;
        if !is_retarget_height(height, params) {
            return entry.header.bits;
        }
        let first_height = height.saturating_sub(params.retarget_interval);
        let first = self.get_ancestor(parent, first_height).unwrap_or(0);
        calculate_next_work_required(
            entry.header.bits,
            self.entries[first].header.timestamp,
            entry.header.timestamp,
            params,
        )
    }

    // ============================================================================
    // Insertion
    // ============================================================================

    /// AddHeader: ℋ × ℕ → entry | error
    ///
    /// 1. Unknown hash; a known invalid one reports KnownInvalid
    /// 2. Parent present, otherwise UnknownParent (buffered by the caller)
    /// 3. Parent not invalid, otherwise stored as InvalidChild
    /// 4. hash ≤ target(bits)
    /// 5. bits = retarget schedule given the ancestors
    /// 6. median_time_past(parent) < timestamp ≤ now + max_future_block_time
    ///
    /// Failures of 5 and 6 (old time) are recorded as Invalid so that
    /// descendants are rejected without re-checking.
    pub fn add_header(
        &mut self,
        header: &BlockHeader,
        now: u64,
        params: &ConsensusParams,
    ) -> Result<usize, HeaderError> {
        let hash = header.hash();
        if let Some(idx) = self.find(&hash) {
            return Err(if self.entries[idx].status.is_invalid() {
                HeaderError::KnownInvalid
            } else {
                HeaderError::Duplicate
            });
        }
        let parent = self
            .find(&header.prev_block_hash)
            .ok_or(HeaderError::UnknownParent(header.prev_block_hash))?;

        if self.entries[parent].status.is_invalid() {
            self.insert_entry(header, hash, parent, BlockStatus::InvalidChild);
            return Err(HeaderError::InvalidParent);
        }

        if !matches!(check_proof_of_work(header, params), Ok(true)) {
            return Err(HeaderError::InvalidProofOfWork);
        }

        let max_time = now.saturating_add(params.max_future_block_time);
        if header.timestamp as u64 > max_time {
            return Err(HeaderError::TimeTooNew {
                time: header.timestamp,
                now,
            });
        }

        let expected = self.required_bits(parent, params);
        if header.bits != expected {
            self.insert_entry(header, hash, parent, BlockStatus::Invalid);
            return Err(HeaderError::BadDifficulty {
                expected,
                actual: header.bits,
            });
        }

        let median = self.median_time_past(parent, params);
        if header.timestamp <= median {
            self.insert_entry(header, hash, parent, BlockStatus::Invalid);
            return Err(HeaderError::TimeTooOld {
                time: header.timestamp,
                median,
            });
        }

        let idx = self.insert_entry(header, hash, parent, BlockStatus::HeaderOnly);
        debug!(
            hash = %hash_to_hex(&hash),
            height = self.entries[idx].height,
            "accepted header"
        );
        Ok(idx)
    }

    fn insert_entry(
        &mut self,
        header: &BlockHeader,
        hash: Hash,
        parent: usize,
        status: BlockStatus,
    ) -> usize {
        let idx = self.entries.len();
        let height = self.entries[parent].height + 1;
        let chain_work = self.entries[parent]
            .chain_work
            .saturating_add(&block_work(header.bits));
        let skip = self.get_ancestor(parent, skip_height(height));
        self.entries.push(BlockIndexEntry {
            hash,
            header: header.clone(),
            parent: Some(parent),
            skip,
            height,
            chain_work,
            status,
            has_data: false,
            chain_has_data: false,
            sequence_id: u64::MAX,
            children: Vec::new(),
        });
        self.entries[parent].children.push(idx);
        self.by_hash.insert(hash, idx);
        idx
    }

    /// Advance the status of a block; never leaves the invalid sink and
    /// never moves backwards
    pub fn raise_status(&mut self, idx: usize, status: BlockStatus) {
        let entry = &mut self.entries[idx];
        if !entry.status.is_invalid() && status > entry.status && !status.is_invalid() {
            entry.status = status;
        }
    }

    /// Record that the block data for `idx` was received. Returns the
    /// blocks that became tip candidates as a result, in the order their
    /// sequence ids were assigned.
    pub fn record_block_data(&mut self, idx: usize) -> Vec<usize> {
        if self.entries[idx].has_data {
            return Vec::new();
        }
        let entry = &mut self.entries[idx];
        entry.has_data = true;

        let parent = match entry.parent {
            Some(parent) => parent,
            None => return Vec::new(),
        };
        if !self.entries[parent].chain_has_data {
            self.unlinked.entry(parent).or_default().push(idx);
            return Vec::new();
        }

        let mut linked = Vec::new();
        let mut queue = VecDeque::from([idx]);
        while let Some(i) = queue.pop_front() {
            self.entries[i].chain_has_data = true;
            self.entries[i].sequence_id = self.next_sequence;
            self.next_sequence += 1;
            if !self.entries[i].status.is_invalid() {
                self.candidates.insert(Self::key_of(&self.entries[i], i));
                linked.push(i);
            }
            if let Some(waiting) = self.unlinked.remove(&i) {
                queue.extend(waiting);
            }
        }
        linked
    }

    // ============================================================================
    // Candidates and invalidity
    // ============================================================================

    /// Most-work candidate; earliest arrival among equals
    pub fn best_candidate(&self) -> Option<usize> {
        self.candidates.iter().next_back().map(|key| key.2)
    }

    /// Whether `a` ranks above `b` for tip selection: more work, or equal
    /// work with earlier data arrival
    pub fn outranks(&self, a: usize, b: usize) -> bool {
        let (ea, eb) = (&self.entries[a], &self.entries[b]);
        (ea.chain_work, Reverse(ea.sequence_id)) > (eb.chain_work, Reverse(eb.sequence_id))
    }

    pub fn is_candidate(&self, idx: usize) -> bool {
        self.candidates.contains(&Self::key_of(&self.entries[idx], idx))
    }

    pub fn remove_candidate(&mut self, idx: usize) {
        let key = Self::key_of(&self.entries[idx], idx);
        self.candidates.remove(&key);
    }

    /// Mark `idx` invalid and poison every descendant
    pub fn mark_invalid(&mut self, idx: usize) -> usize {
        warn!(hash = %hash_to_hex(&self.entries[idx].hash), "marking block invalid");
        self.remove_candidate(idx);
        self.entries[idx].status = BlockStatus::Invalid;

        let mut poisoned = 0;
        let mut queue: VecDeque<usize> = self.entries[idx].children.iter().copied().collect();
        while let Some(child) = queue.pop_front() {
            if self.entries[child].status == BlockStatus::InvalidChild {
                continue;
            }
            self.remove_candidate(child);
            self.entries[child].status = BlockStatus::InvalidChild;
            poisoned += 1;
            queue.extend(self.entries[child].children.iter().copied());
        }
        self.unlinked.remove(&idx);
        poisoned
    }
}
