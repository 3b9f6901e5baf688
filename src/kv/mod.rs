//! The key-value entity model.
//!
//! Every entity carries a key, a logical [`Time`], and an optional expiry
//! [`Deadline`]. The five fixed variants are Put, Remove, Update, Function
//! and PendingApply; Range is the interval form used by range-bounded
//! remove/update/expire, applied lazily against lower-level data at read
//! time.

pub mod merge;
pub mod registry;

use crate::error::Result;
use crate::slice::SliceReader;
use crate::varint;

/// Absolute expiry point-in-time with nanosecond resolution.
///
/// Persisted as an unsigned varint where zero means "no deadline", so a zero
/// deadline is not representable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(u64);

impl Deadline {
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn nanos(&self) -> u64 {
        self.0
    }

    /// Whether the deadline lies at or before `now_nanos`. Expiry is always
    /// evaluated at read time, never during a merge.
    pub fn has_passed(&self, now_nanos: u64) -> bool {
        self.0 <= now_nanos
    }
}

/// Encodes an optional deadline as a varuint with zero meaning absent.
pub(crate) fn encode_deadline(deadline: Option<Deadline>, buf: &mut Vec<u8>) {
    varint::encode_unsigned(deadline.map_or(0, |d| d.nanos()), buf);
}

pub(crate) fn decode_deadline(reader: &mut SliceReader) -> Result<Option<Deadline>> {
    let nanos = reader.read_unsigned()?;
    Ok((nanos != 0).then(|| Deadline::from_nanos(nanos)))
}

/// Per-entry logical ordering token. Opaque bytes whose only operation is
/// comparison under a [`crate::order::TimeOrder`]; the empty time sorts
/// before every non-empty time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Time(Vec<u8>);

impl Time {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&[u8]> for Time {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// The apply-shaped subset stored inside a PendingApply chain or as a Range
/// value: Remove, Update and Function, without their key.
#[derive(Clone, Debug, PartialEq)]
pub enum Apply {
    Remove {
        time: Time,
        deadline: Option<Deadline>,
    },
    Update {
        time: Time,
        deadline: Option<Deadline>,
        value: Option<Vec<u8>>,
    },
    Function {
        time: Time,
        deadline: Option<Deadline>,
        id: Vec<u8>,
    },
}

const APPLY_REMOVE: u8 = 0;
const APPLY_UPDATE: u8 = 1;
const APPLY_FUNCTION: u8 = 2;

impl Apply {
    pub fn time(&self) -> &Time {
        match self {
            Apply::Remove { time, .. } => time,
            Apply::Update { time, .. } => time,
            Apply::Function { time, .. } => time,
        }
    }

    pub fn deadline(&self) -> Option<Deadline> {
        match self {
            Apply::Remove { deadline, .. } => *deadline,
            Apply::Update { deadline, .. } => *deadline,
            Apply::Function { deadline, .. } => *deadline,
        }
    }

    /// Rebuilds the keyed form of this apply.
    pub fn into_key_value(self, key: Vec<u8>) -> KeyValue {
        match self {
            Apply::Remove { time, deadline } => KeyValue::Remove {
                key,
                time,
                deadline,
            },
            Apply::Update {
                time,
                deadline,
                value,
            } => KeyValue::Update {
                key,
                time,
                deadline,
                value,
            },
            Apply::Function { time, deadline, id } => KeyValue::Function {
                key,
                time,
                deadline,
                id,
            },
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Apply::Remove { time, deadline } => {
                buf.push(APPLY_REMOVE);
                encode_time(time, buf);
                encode_deadline(*deadline, buf);
            }
            Apply::Update {
                time,
                deadline,
                value,
            } => {
                buf.push(APPLY_UPDATE);
                encode_time(time, buf);
                encode_deadline(*deadline, buf);
                encode_optional_bytes(value.as_deref(), buf);
            }
            Apply::Function { time, deadline, id } => {
                buf.push(APPLY_FUNCTION);
                encode_time(time, buf);
                encode_deadline(*deadline, buf);
                varint::encode_unsigned(id.len() as u64, buf);
                buf.extend_from_slice(id);
            }
        }
    }

    pub fn decode(reader: &mut SliceReader) -> Result<Self> {
        let kind = reader.read_u8()?;
        let time = decode_time(reader)?;
        let deadline = decode_deadline(reader)?;
        match kind {
            APPLY_REMOVE => Ok(Apply::Remove { time, deadline }),
            APPLY_UPDATE => Ok(Apply::Update {
                time,
                deadline,
                value: decode_optional_bytes(reader)?,
            }),
            APPLY_FUNCTION => {
                let len = reader.read_unsigned()? as usize;
                Ok(Apply::Function {
                    time,
                    deadline,
                    id: reader.read_bytes(len)?.to_vec(),
                })
            }
            other => crate::errcorrupt!("unknown apply kind {other}"),
        }
    }
}

/// Serialises an ascending-time apply sequence, count first.
pub fn encode_applies(applies: &[Apply], buf: &mut Vec<u8>) {
    varint::encode_unsigned(applies.len() as u64, buf);
    for apply in applies {
        apply.encode(buf);
    }
}

pub fn decode_applies(reader: &mut SliceReader) -> Result<Vec<Apply>> {
    let count = reader.read_unsigned()? as usize;
    let mut applies = Vec::with_capacity(count);
    for _ in 0..count {
        applies.push(Apply::decode(reader)?);
    }
    Ok(applies)
}

fn encode_time(time: &Time, buf: &mut Vec<u8>) {
    varint::encode_unsigned(time.as_slice().len() as u64, buf);
    buf.extend_from_slice(time.as_slice());
}

fn decode_time(reader: &mut SliceReader) -> Result<Time> {
    let len = reader.read_unsigned()? as usize;
    Ok(Time::new(reader.read_bytes(len)?.to_vec()))
}

fn encode_optional_bytes(value: Option<&[u8]>, buf: &mut Vec<u8>) {
    match value {
        None => varint::encode_unsigned(0, buf),
        Some(bytes) => {
            varint::encode_unsigned(bytes.len() as u64 + 1, buf);
            buf.extend_from_slice(bytes);
        }
    }
}

fn decode_optional_bytes(reader: &mut SliceReader) -> Result<Option<Vec<u8>>> {
    match reader.read_unsigned()? {
        0 => Ok(None),
        tagged => Ok(Some(reader.read_bytes(tagged as usize - 1)?.to_vec())),
    }
}

/// A keyed entity: one of the five fixed variants, or a Range.
#[derive(Clone, Debug, PartialEq)]
pub enum KeyValue {
    /// Committed value, visible to readers.
    Put {
        key: Vec<u8>,
        time: Time,
        deadline: Option<Deadline>,
        value: Option<Vec<u8>>,
    },
    /// Tombstone. With a deadline it is an expiry, without one an immediate
    /// remove.
    Remove {
        key: Vec<u8>,
        time: Time,
        deadline: Option<Deadline>,
    },
    /// Overwrites the current value only where a Put exists underneath.
    Update {
        key: Vec<u8>,
        time: Time,
        deadline: Option<Deadline>,
        value: Option<Vec<u8>>,
    },
    /// Applies a registered pure function to the current resolved value.
    Function {
        key: Vec<u8>,
        time: Time,
        deadline: Option<Deadline>,
        id: Vec<u8>,
    },
    /// A composed mutation chain waiting for a resolvable base.
    ///
    /// The inner sequence is non-empty, apply-shaped only, and in ascending
    /// time order. A single-element chain collapses to its inner value; use
    /// [`KeyValue::pending`] to construct.
    PendingApply { key: Vec<u8>, applies: Vec<Apply> },
    /// An interval `[from_key, to_key)` whose value applies lazily to every
    /// key underneath it.
    Range {
        from_key: Vec<u8>,
        to_key: Vec<u8>,
        value: Apply,
    },
}

impl KeyValue {
    /// Builds a PendingApply, collapsing a single-element chain to its inner
    /// value.
    pub fn pending(key: Vec<u8>, mut applies: Vec<Apply>) -> KeyValue {
        debug_assert!(!applies.is_empty());
        if applies.len() == 1 {
            applies.remove(0).into_key_value(key)
        } else {
            KeyValue::PendingApply { key, applies }
        }
    }

    /// The entity's key; for a Range this is the inclusive start key.
    pub fn key(&self) -> &[u8] {
        match self {
            KeyValue::Put { key, .. }
            | KeyValue::Remove { key, .. }
            | KeyValue::Update { key, .. }
            | KeyValue::Function { key, .. }
            | KeyValue::PendingApply { key, .. } => key,
            KeyValue::Range { from_key, .. } => from_key,
        }
    }

    /// The entity's logical time. A PendingApply carries the time of its
    /// latest apply; a Range the time of its value.
    pub fn time(&self) -> &Time {
        match self {
            KeyValue::Put { time, .. }
            | KeyValue::Remove { time, .. }
            | KeyValue::Update { time, .. }
            | KeyValue::Function { time, .. } => time,
            KeyValue::PendingApply { applies, .. } => {
                applies.last().expect("pending apply chain is non-empty").time()
            }
            KeyValue::Range { value, .. } => value.time(),
        }
    }

    pub fn deadline(&self) -> Option<Deadline> {
        match self {
            KeyValue::Put { deadline, .. }
            | KeyValue::Remove { deadline, .. }
            | KeyValue::Update { deadline, .. }
            | KeyValue::Function { deadline, .. } => *deadline,
            KeyValue::PendingApply { applies, .. } => {
                applies.last().expect("pending apply chain is non-empty").deadline()
            }
            KeyValue::Range { value, .. } => value.deadline(),
        }
    }

    pub fn is_put(&self) -> bool {
        matches!(self, KeyValue::Put { .. })
    }

    pub fn is_range(&self) -> bool {
        matches!(self, KeyValue::Range { .. })
    }

    /// Whether this is a Range whose value is a Remove. Such ranges cannot be
    /// represented by a positive-only bloom filter.
    pub fn is_remove_range(&self) -> bool {
        matches!(
            self,
            KeyValue::Range {
                value: Apply::Remove { .. },
                ..
            }
        )
    }

    /// Converts an apply-shaped entity into its keyless form.
    pub fn into_apply(self) -> Option<Apply> {
        match self {
            KeyValue::Remove { time, deadline, .. } => Some(Apply::Remove { time, deadline }),
            KeyValue::Update {
                time,
                deadline,
                value,
                ..
            } => Some(Apply::Update {
                time,
                deadline,
                value,
            }),
            KeyValue::Function {
                time, deadline, id, ..
            } => Some(Apply::Function { time, deadline, id }),
            _ => None,
        }
    }
}
