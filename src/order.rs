//! Caller-supplied total orders over keys and times.
//!
//! All key comparisons in the Segment format go through a [`KeyOrder`], and
//! all per-key linearisation decisions through a [`TimeOrder`]. Both default
//! to lexicographic byte order.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type CompareFn = dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync;

/// Total order on keys.
#[derive(Clone)]
pub struct KeyOrder {
    compare: Arc<CompareFn>,
}

impl KeyOrder {
    pub fn new(compare: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            compare: Arc::new(compare),
        }
    }

    /// The default byte-wise order.
    pub fn lexicographic() -> Self {
        Self::new(|a, b| a.cmp(b))
    }

    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b)
    }

    pub fn eq(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }
}

impl Default for KeyOrder {
    fn default() -> Self {
        Self::lexicographic()
    }
}

impl fmt::Debug for KeyOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyOrder").finish()
    }
}

/// Total order on per-entry logical times.
#[derive(Clone)]
pub struct TimeOrder {
    compare: Arc<CompareFn>,
}

impl TimeOrder {
    pub fn new(compare: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            compare: Arc::new(compare),
        }
    }

    pub fn lexicographic() -> Self {
        Self::new(|a, b| a.cmp(b))
    }

    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b)
    }

    /// Whether `a` is strictly after `b`. Higher time wins on the same key.
    pub fn gt(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) == Ordering::Greater
    }
}

impl Default for TimeOrder {
    fn default() -> Self {
        Self::lexicographic()
    }
}

impl fmt::Debug for TimeOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeOrder").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic_defaults() {
        let keys = KeyOrder::default();
        assert_eq!(keys.cmp(b"a", b"b"), Ordering::Less);
        assert!(keys.eq(b"same", b"same"));

        let times = TimeOrder::default();
        assert!(times.gt(b"\x00\x02", b"\x00\x01"));
        assert!(!times.gt(b"\x00\x01", b"\x00\x01"));
    }

    #[test]
    fn test_custom_order() {
        // Reverse order flips comparisons end to end.
        let reverse = KeyOrder::new(|a, b| b.cmp(a));
        assert_eq!(reverse.cmp(b"a", b"b"), Ordering::Greater);
    }
}
