//! Matchers direct sorted-index traversal toward a target key.
//!
//! A matcher is invoked with `(previous, next?, has_more)` and answers with
//! one of four results: the target was found, the iteration fell behind and
//! must stop, the caller should fetch the next entry and retry, or the
//! target lies ahead of (or beyond) the entries read so far. The
//! [`match_or_seek`] driver turns that protocol into an explicit loop over
//! `next_index_offset` links, which serves get, higher and lower alike.

use crate::error::Result;
use crate::order::KeyOrder;
use crate::segment::sorted_index::{IndexEntry, SortedIndexReader};

/// The three lookup operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Get,
    Higher,
    Lower,
}

/// Where an entry stands relative to the target for a given operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Standing {
    /// The entry cannot be the answer and the answer is further on.
    Behind,
    /// The entry answers the operation.
    Match,
    /// The entry lies past the target; the answer is not further on.
    Ahead,
}

/// Ranks `entry` against `target` under `op`.
///
/// Ranges stand for every key in `[from, to)`: a Get matches when the target
/// falls inside, a Higher matches any range holding keys above the target,
/// a Lower any range holding keys below it.
pub fn standing(entry: &IndexEntry, target: &[u8], op: Op, key_order: &KeyOrder) -> Standing {
    use std::cmp::Ordering::*;
    match op {
        Op::Get => match &entry.to_key {
            Some(to_key) => {
                if key_order.cmp(target, &entry.key) == Less {
                    Standing::Ahead
                } else if key_order.cmp(target, to_key) == Less {
                    Standing::Match
                } else {
                    Standing::Behind
                }
            }
            None => match key_order.cmp(&entry.key, target) {
                Less => Standing::Behind,
                Equal => Standing::Match,
                Greater => Standing::Ahead,
            },
        },
        Op::Higher => match &entry.to_key {
            Some(to_key) => {
                if key_order.cmp(target, to_key) == Less {
                    Standing::Match
                } else {
                    Standing::Behind
                }
            }
            None => {
                if key_order.cmp(&entry.key, target) == Greater {
                    Standing::Match
                } else {
                    Standing::Behind
                }
            }
        },
        Op::Lower => {
            let start = &entry.key;
            if key_order.cmp(start, target) == Less {
                Standing::Match
            } else {
                Standing::Ahead
            }
        }
    }
}

/// Outcome of one matcher invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum MatchResult {
    Matched(IndexEntry),
    /// Target is further on; the caller must read the next entry and retry.
    BehindFetchNext(IndexEntry),
    /// Target is further on but this matcher does not fetch.
    BehindStopped(IndexEntry),
    /// Target lies before the entries read, or past the end. Carries the
    /// first entry after the target when one was seen.
    AheadOrEnd(Option<IndexEntry>),
}

/// A stateless matcher for one target key and operation.
pub struct Matcher<'a> {
    op: Op,
    target: &'a [u8],
    key_order: &'a KeyOrder,
    match_only: bool,
}

impl<'a> Matcher<'a> {
    pub fn new(op: Op, target: &'a [u8], key_order: &'a KeyOrder) -> Self {
        Self {
            op,
            target,
            key_order,
            match_only: false,
        }
    }

    /// A variant that never requests further fetches, used where the caller
    /// has exactly one candidate (hash slots, binary-search probes).
    pub fn match_only(op: Op, target: &'a [u8], key_order: &'a KeyOrder) -> Self {
        Self {
            op,
            target,
            key_order,
            match_only: true,
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    /// Ranks one entry without driving iteration.
    pub fn stand(&self, entry: &IndexEntry) -> Standing {
        standing(entry, self.target, self.op, self.key_order)
    }

    /// One step of the matcher protocol.
    pub fn apply(
        &self,
        previous: &IndexEntry,
        next: Option<&IndexEntry>,
        has_more: bool,
    ) -> MatchResult {
        match self.op {
            Op::Get | Op::Higher => {
                let candidate = next.unwrap_or(previous);
                match self.stand(candidate) {
                    Standing::Match => MatchResult::Matched(candidate.clone()),
                    Standing::Ahead => MatchResult::AheadOrEnd(Some(candidate.clone())),
                    Standing::Behind => {
                        if self.match_only {
                            MatchResult::BehindStopped(candidate.clone())
                        } else if has_more {
                            MatchResult::BehindFetchNext(candidate.clone())
                        } else {
                            MatchResult::AheadOrEnd(None)
                        }
                    }
                }
            }
            Op::Lower => {
                if self.stand(previous) != Standing::Match {
                    return MatchResult::AheadOrEnd(Some(previous.clone()));
                }
                match next {
                    Some(next) if self.stand(next) == Standing::Match => {
                        if self.match_only {
                            MatchResult::BehindStopped(next.clone())
                        } else if has_more {
                            MatchResult::BehindFetchNext(next.clone())
                        } else {
                            MatchResult::Matched(next.clone())
                        }
                    }
                    // The next entry reached the target: previous answers.
                    Some(_) => MatchResult::Matched(previous.clone()),
                    None => {
                        if has_more && !self.match_only {
                            MatchResult::BehindFetchNext(previous.clone())
                        } else {
                            MatchResult::Matched(previous.clone())
                        }
                    }
                }
            }
        }
    }
}

/// Final outcome of a seek-and-match walk.
#[derive(Clone, Debug, PartialEq)]
pub enum SeekOutcome {
    Matched(IndexEntry),
    /// A match-only matcher stopped short of the target.
    Stopped(IndexEntry),
    /// No match; carries the first entry past the target when one was seen.
    AheadOrEnd(Option<IndexEntry>),
}

/// Drives the matcher from `start`, following successor links until the
/// matcher settles. Recursion in the protocol becomes this explicit loop.
pub fn match_or_seek(
    matcher: &Matcher,
    start: IndexEntry,
    reader: &SortedIndexReader,
) -> Result<SeekOutcome> {
    let mut previous = start;
    let mut next: Option<IndexEntry> = None;
    loop {
        let latest = next.as_ref().unwrap_or(&previous);
        let has_more = latest.next_index_offset >= 0;
        match matcher.apply(&previous, next.as_ref(), has_more) {
            MatchResult::Matched(entry) => return Ok(SeekOutcome::Matched(entry)),
            MatchResult::BehindStopped(entry) => return Ok(SeekOutcome::Stopped(entry)),
            MatchResult::AheadOrEnd(higher) => return Ok(SeekOutcome::AheadOrEnd(higher)),
            MatchResult::BehindFetchNext(entry) => {
                let fetched = reader.read_at(entry.next_index_offset as u64, Some(&entry))?;
                previous = entry;
                next = Some(fetched);
            }
        }
    }
}
