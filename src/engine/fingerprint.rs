//! Near-duplicate detection with 64-bit similarity fingerprints
//!
//! A fingerprint is a SimHash over word shingles of normalised text: copies of
//! the same post that differ only in case, punctuation, counters or spacing
//! map to the same value, and lightly edited copies land a few bits apart.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Token substituted for every run of digits
const NUMBER_TOKEN: &str = "num";

/// 64-bit similarity hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Number of differing bits
    #[inline]
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    #[inline]
    pub fn is_similar(&self, other: &Fingerprint, threshold: u32) -> bool {
        self.distance(other) <= threshold
    }
}

/// Lowercase, drop punctuation, fold digit runs into one token, collapse spaces
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_number = false;

    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_numeric() {
            if !in_number {
                out.push(' ');
                out.push_str(NUMBER_TOKEN);
                out.push(' ');
                in_number = true;
            }
        } else if c.is_alphanumeric() {
            in_number = false;
            out.push(c);
        } else if c.is_whitespace() {
            in_number = false;
            out.push(' ');
        }
        // punctuation is dropped without ending a digit run: "1,000" is one number
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn murmur3_32(bytes: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut hash = seed;
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= bytes.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^ (hash >> 16)
}

#[inline]
fn shingle_hash(shingle: &str) -> u64 {
    let bytes = shingle.as_bytes();
    ((fnv1a32(bytes) as u64) << 32) | murmur3_32(bytes, 0x9747_b28c) as u64
}

/// Fingerprint `text`, or `None` when the normalised text is too short to carry signal
pub fn compute_fingerprint(text: &str, shingle_size: usize, min_text_length: usize) -> Option<Fingerprint> {
    let normalized = normalize(text);
    if normalized.is_empty() || normalized.chars().count() < min_text_length {
        return None;
    }

    let words: Vec<&str> = normalized.split(' ').collect();
    let size = shingle_size.max(1);
    let mut votes = [0i32; 64];

    let mut vote = |shingle: &str| {
        let hash = shingle_hash(shingle);
        for (bit, slot) in votes.iter_mut().enumerate() {
            if (hash >> bit) & 1 == 1 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    };

    if words.len() < size {
        vote(&normalized);
    } else {
        for window in words.windows(size) {
            vote(&window.join(" "));
        }
    }

    let bits = votes
        .iter()
        .enumerate()
        .filter(|(_, v)| **v > 0)
        .fold(0u64, |acc, (bit, _)| acc | (1u64 << bit));

    Some(Fingerprint(bits))
}

/// A fingerprint that was decided as filtered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecidedEntry {
    pub fingerprint: Fingerprint,
    pub reason: String,
}

/// Bounded memory of seen and previously filtered fingerprints
#[derive(Debug, Clone)]
pub struct FingerprintIndex {
    threshold: u32,
    capacity: usize,
    seen: VecDeque<Fingerprint>,
    decided: VecDeque<DecidedEntry>,
}

impl FingerprintIndex {
    pub fn new(threshold: u32, capacity: usize) -> Self {
        Self {
            threshold,
            capacity: capacity.max(1),
            seen: VecDeque::new(),
            decided: VecDeque::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// First seen fingerprint within the threshold, in insertion order
    ///
    /// First match, not best match: a closer entry stored later is not
    /// considered once an earlier one qualifies.
    pub fn find_similar(&self, fp: Fingerprint) -> Option<Fingerprint> {
        self.seen
            .iter()
            .find(|candidate| candidate.is_similar(&fp, self.threshold))
            .copied()
    }

    /// First previously filtered entry within the threshold
    pub fn find_decided(&self, fp: Fingerprint) -> Option<&DecidedEntry> {
        self.decided
            .iter()
            .find(|entry| entry.fingerprint.is_similar(&fp, self.threshold))
    }

    /// Remember `fp` as seen; exact duplicates are stored once
    pub fn store(&mut self, fp: Fingerprint) {
        if self.seen.contains(&fp) {
            return;
        }
        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(fp);
    }

    /// Remember `fp` as filtered for `reason`
    pub fn mark_decided(&mut self, fp: Fingerprint, reason: impl Into<String>) {
        if self.decided.iter().any(|entry| entry.fingerprint == fp) {
            return;
        }
        if self.decided.len() >= self.capacity {
            self.decided.pop_front();
        }
        self.decided.push_back(DecidedEntry {
            fingerprint: fp,
            reason: reason.into(),
        });
    }

    /// Forget a seen fingerprint, e.g. after its classifier request failed
    pub fn remove_seen(&mut self, fp: Fingerprint) -> bool {
        match self.seen.iter().position(|candidate| *candidate == fp) {
            Some(idx) => {
                self.seen.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.seen.clear();
        self.decided.clear();
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn decided_len(&self) -> usize {
        self.decided.len()
    }
}
