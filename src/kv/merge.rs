//! The merge algebra: reconciles a newer key-value with an older one for the
//! same key, producing either a single resolved key-value or a PendingApply
//! chain that waits for a resolvable base.
//!
//! The algebra is linearised by logical time: a merge where the new side is
//! not strictly newer returns the old side unchanged, which also makes the
//! merge idempotent at equal times. A Remove without a deadline absorbs
//! Updates and Functions outright.
//!
//! Ranges never enter the algebra; their values are applied lazily against
//! lower-level data when a read lands inside the range.

use crate::error::Result;
use crate::kv::registry::{FunctionOutput, FunctionRegistry};
use crate::kv::{Apply, KeyValue, Time};
use crate::order::TimeOrder;

/// Merges `new` against `old`, both keyed identically.
pub fn merge(
    new: KeyValue,
    old: KeyValue,
    registry: &FunctionRegistry,
    time_order: &TimeOrder,
) -> Result<KeyValue> {
    if new.is_range() || old.is_range() {
        return crate::errcorrupt!("range key-values merge lazily at read time");
    }
    if !time_order.gt(new.time().as_slice(), old.time().as_slice()) {
        return Ok(old);
    }
    match new {
        KeyValue::Put { .. } => Ok(new),
        KeyValue::Remove { .. } => merge_remove(new, old, registry, time_order),
        KeyValue::Update { .. } => merge_update(new, old),
        KeyValue::Function { .. } => merge_function(new, old, registry, time_order),
        KeyValue::PendingApply { key, applies } => {
            applies_fold(key, applies, old, registry, time_order)
        }
        KeyValue::Range { .. } => unreachable!("ranges rejected above"),
    }
}

/// Left-folds an ascending-time apply sequence over a base.
///
/// The fold stops as soon as the running resolution becomes a PendingApply;
/// the unread applies are appended to that chain unchanged.
pub fn applies_fold(
    key: Vec<u8>,
    applies: Vec<Apply>,
    base: KeyValue,
    registry: &FunctionRegistry,
    time_order: &TimeOrder,
) -> Result<KeyValue> {
    let mut running = base;
    let mut remaining = applies.into_iter();
    while let Some(apply) = remaining.next() {
        running = merge(
            apply.into_key_value(key.clone()),
            running,
            registry,
            time_order,
        )?;
        if let KeyValue::PendingApply { applies: chain, .. } = running {
            let mut chain = chain;
            chain.extend(remaining);
            return Ok(KeyValue::pending(key, chain));
        }
    }
    Ok(running)
}

fn merge_remove(
    new: KeyValue,
    old: KeyValue,
    registry: &FunctionRegistry,
    time_order: &TimeOrder,
) -> Result<KeyValue> {
    let KeyValue::Remove {
        key,
        time,
        deadline,
    } = new
    else {
        unreachable!()
    };

    match old {
        KeyValue::Put { .. } | KeyValue::Update { .. } | KeyValue::Remove { .. } => {
            match (deadline, old.deadline()) {
                // Permanent tombstone.
                (None, _) => Ok(KeyValue::Remove {
                    key,
                    time,
                    deadline: None,
                }),
                // The expiry lands on the older entry.
                (Some(d), None) => Ok(with_deadline_and_time(old, Some(d), time)),
                // The explicit newer expiry wins.
                (Some(d), Some(_)) => Ok(KeyValue::Remove {
                    key,
                    time,
                    deadline: Some(d),
                }),
            }
        }
        KeyValue::Function { .. } => match deadline {
            None => Ok(KeyValue::Remove {
                key,
                time,
                deadline: None,
            }),
            Some(_) => {
                let old_apply = old.into_apply().expect("function is apply-shaped");
                Ok(KeyValue::PendingApply {
                    key: key.clone(),
                    applies: vec![old_apply, Apply::Remove { time, deadline }],
                })
            }
        },
        KeyValue::PendingApply { applies, .. } => match deadline {
            None => Ok(KeyValue::Remove {
                key,
                time,
                deadline: None,
            }),
            Some(_) => {
                // Fold the expiry into the tail of the chain: it may collapse
                // with the last apply, or extend the chain by one.
                let mut applies = applies;
                let last = applies.pop().expect("pending apply chain is non-empty");
                let merged = merge(
                    KeyValue::Remove {
                        key: key.clone(),
                        time,
                        deadline,
                    },
                    last.into_key_value(key.clone()),
                    registry,
                    time_order,
                )?;
                match merged {
                    KeyValue::PendingApply { applies: pair, .. } => applies.extend(pair),
                    fixed => applies.push(fixed.into_apply().expect("remove merges stay apply-shaped")),
                }
                Ok(KeyValue::pending(key, applies))
            }
        },
        KeyValue::Range { .. } => unreachable!("ranges rejected by merge"),
    }
}

fn merge_update(new: KeyValue, old: KeyValue) -> Result<KeyValue> {
    let KeyValue::Update {
        key,
        time,
        deadline,
        value,
    } = new
    else {
        unreachable!()
    };

    match old {
        // An Update landing on a committed Put commits.
        KeyValue::Put { .. } => Ok(KeyValue::Put {
            deadline: deadline.or(old.deadline()),
            key,
            time,
            value,
        }),
        // Against Update and Remove the new Update stands, inheriting the old
        // deadline when it has none of its own.
        KeyValue::Update { .. } | KeyValue::Remove { .. } => Ok(KeyValue::Update {
            deadline: deadline.or(old.deadline()),
            key,
            time,
            value,
        }),
        KeyValue::Function { .. } => {
            let old_apply = old.into_apply().expect("function is apply-shaped");
            Ok(KeyValue::PendingApply {
                key,
                applies: vec![
                    old_apply,
                    Apply::Update {
                        time,
                        deadline,
                        value,
                    },
                ],
            })
        }
        KeyValue::PendingApply { mut applies, .. } => {
            applies.push(Apply::Update {
                time,
                deadline,
                value,
            });
            Ok(KeyValue::PendingApply { key, applies })
        }
        KeyValue::Range { .. } => unreachable!("ranges rejected by merge"),
    }
}

fn merge_function(
    new: KeyValue,
    old: KeyValue,
    registry: &FunctionRegistry,
    time_order: &TimeOrder,
) -> Result<KeyValue> {
    let KeyValue::Function {
        key,
        time,
        deadline,
        id,
    } = new
    else {
        unreachable!()
    };

    match old {
        KeyValue::Put { .. } | KeyValue::Update { .. } => {
            let function = registry.get(&id)?;
            let value = match &old {
                KeyValue::Put { value, .. } | KeyValue::Update { value, .. } => value.as_deref(),
                _ => unreachable!(),
            };
            let outcome = match function.apply(&key, value, old.deadline()) {
                FunctionOutput::Nothing => None,
                FunctionOutput::Remove => Some(KeyValue::Remove {
                    key: key.clone(),
                    time: time.clone(),
                    deadline: None,
                }),
                FunctionOutput::Update(value) => Some(KeyValue::Update {
                    key: key.clone(),
                    time: time.clone(),
                    deadline: None,
                    value,
                }),
                FunctionOutput::Expire(at) => Some(KeyValue::Remove {
                    key: key.clone(),
                    time: time.clone(),
                    deadline: Some(at),
                }),
            };
            match outcome {
                None => Ok(with_time(old, time)),
                Some(result) => merge(result, old, registry, time_order),
            }
        }
        KeyValue::Remove { deadline: None, .. } => {
            // The permanent tombstone absorbs the function.
            Ok(with_time(old, time))
        }
        KeyValue::Remove { .. } | KeyValue::Function { .. } => {
            let old_apply = old.into_apply().expect("remove and function are apply-shaped");
            Ok(KeyValue::PendingApply {
                key,
                applies: vec![old_apply, Apply::Function { time, deadline, id }],
            })
        }
        KeyValue::PendingApply { mut applies, .. } => {
            applies.push(Apply::Function { time, deadline, id });
            Ok(KeyValue::PendingApply { key, applies })
        }
        KeyValue::Range { .. } => unreachable!("ranges rejected by merge"),
    }
}

fn with_time(kv: KeyValue, new_time: Time) -> KeyValue {
    match kv {
        KeyValue::Put {
            key,
            deadline,
            value,
            ..
        } => KeyValue::Put {
            key,
            time: new_time,
            deadline,
            value,
        },
        KeyValue::Remove { key, deadline, .. } => KeyValue::Remove {
            key,
            time: new_time,
            deadline,
        },
        KeyValue::Update {
            key,
            deadline,
            value,
            ..
        } => KeyValue::Update {
            key,
            time: new_time,
            deadline,
            value,
        },
        KeyValue::Function {
            key, deadline, id, ..
        } => KeyValue::Function {
            key,
            time: new_time,
            deadline,
            id,
        },
        other => other,
    }
}

fn with_deadline_and_time(
    kv: KeyValue,
    deadline: Option<crate::kv::Deadline>,
    time: Time,
) -> KeyValue {
    match with_time(kv, time) {
        KeyValue::Put {
            key, time, value, ..
        } => KeyValue::Put {
            key,
            time,
            deadline,
            value,
        },
        KeyValue::Remove { key, time, .. } => KeyValue::Remove {
            key,
            time,
            deadline,
        },
        KeyValue::Update {
            key, time, value, ..
        } => KeyValue::Update {
            key,
            time,
            deadline,
            value,
        },
        KeyValue::Function { key, time, id, .. } => KeyValue::Function {
            key,
            time,
            deadline,
            id,
        },
        other => other,
    }
}
