//! Request batches queued for the background workers.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::table::slot::SlotFlags;

/// Slot indices one batch holds at most.
pub const MAX_REQ_IDX: usize = 2042;

/// Which slots a manual writeback picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritebackMode {
    /// Slots marked idle.
    Idle,
    /// Slots stored raw.
    Huge,
    /// Slots both huge and idle.
    HugeIdle,
    /// Every resident slot.
    All,
    /// One slot.
    Index(u32),
}

impl WritebackMode {
    /// Flags a slot must carry to be picked.
    pub fn required_flags(self) -> SlotFlags {
        match self {
            WritebackMode::Idle => SlotFlags::IDLE,
            WritebackMode::Huge => SlotFlags::HUGE,
            WritebackMode::HugeIdle => SlotFlags::HUGE | SlotFlags::IDLE,
            WritebackMode::All | WritebackMode::Index(_) => SlotFlags::empty(),
        }
    }

    /// Whether pages written back in this mode are marked `EXPIRE`.
    pub fn expires(self) -> bool {
        matches!(self, WritebackMode::Idle | WritebackMode::HugeIdle)
    }
}

impl fmt::Display for WritebackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WritebackMode::Idle => write!(f, "idle"),
            WritebackMode::Huge => write!(f, "huge"),
            WritebackMode::HugeIdle => write!(f, "huge_idle"),
            WritebackMode::All => write!(f, "all"),
            WritebackMode::Index(index) => write!(f, "index={index}"),
        }
    }
}

impl FromStr for WritebackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "idle" => Ok(WritebackMode::Idle),
            "huge" => Ok(WritebackMode::Huge),
            "huge_idle" => Ok(WritebackMode::HugeIdle),
            "all" => Ok(WritebackMode::All),
            other => other
                .strip_prefix("index=")
                .and_then(|n| n.parse().ok())
                .map(WritebackMode::Index)
                .ok_or_else(|| format!("unknown writeback mode: {other}")),
        }
    }
}

/// Why a batch was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Co-located slots of a block a foreground read just fetched.
    ColdRead,
    /// Eviction under memory pressure.
    Lru,
    /// Manual writeback trigger.
    Manual(WritebackMode),
}

impl RequestOrigin {
    /// Flags a slot must carry to be written back for this origin.
    pub fn required_flags(self) -> SlotFlags {
        match self {
            RequestOrigin::Manual(mode) => mode.required_flags(),
            _ => SlotFlags::empty(),
        }
    }

    pub fn expires(self) -> bool {
        matches!(self, RequestOrigin::Manual(mode) if mode.expires())
    }
}

impl fmt::Display for RequestOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOrigin::ColdRead => write!(f, "cold-read"),
            RequestOrigin::Lru => write!(f, "lru"),
            RequestOrigin::Manual(mode) => write!(f, "manual:{mode}"),
        }
    }
}

/// Bounded ring of slot indices.
#[derive(Debug, Clone)]
pub struct RequestBatch {
    origin: RequestOrigin,
    indices: VecDeque<u32>,
}

impl RequestBatch {
    pub fn new(origin: RequestOrigin) -> Self {
        Self {
            origin,
            indices: VecDeque::new(),
        }
    }

    pub fn origin(&self) -> RequestOrigin {
        self.origin
    }

    /// Append an index. Returns false if the batch is full.
    pub fn push(&mut self, index: u32) -> bool {
        if self.is_full() {
            return false;
        }
        self.indices.push_back(index);
        true
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.indices.pop_front()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.indices.len() >= MAX_REQ_IDX
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.indices.iter().copied()
    }

    /// Split a list of indices into as many batches as it takes.
    pub fn split(origin: RequestOrigin, indices: impl IntoIterator<Item = u32>) -> Vec<RequestBatch> {
        let mut batches = Vec::new();
        let mut current = RequestBatch::new(origin);
        for index in indices {
            if !current.push(index) {
                batches.push(std::mem::replace(&mut current, RequestBatch::new(origin)));
                current.push(index);
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

impl IntoIterator for RequestBatch {
    type Item = u32;
    type IntoIter = std::collections::vec_deque::IntoIter<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.indices.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_is_bounded() {
        let mut batch = RequestBatch::new(RequestOrigin::Lru);
        for i in 0..MAX_REQ_IDX as u32 {
            assert!(batch.push(i));
        }
        assert!(batch.is_full());
        assert!(!batch.push(9999));
        assert_eq!(batch.pop(), Some(0));
        assert!(batch.push(9999));
    }

    #[test]
    fn test_writeback_mode_parsing() {
        assert_eq!("idle".parse(), Ok(WritebackMode::Idle));
        assert_eq!("huge_idle".parse(), Ok(WritebackMode::HugeIdle));
        assert_eq!("index=42".parse(), Ok(WritebackMode::Index(42)));
        assert!("index=x".parse::<WritebackMode>().is_err());
        assert!("lru".parse::<WritebackMode>().is_err());
        assert_eq!(WritebackMode::Index(7).to_string(), "index=7");

        let origin = RequestOrigin::Manual(WritebackMode::HugeIdle);
        assert!(origin.expires());
        assert!(origin.required_flags().contains(SlotFlags::HUGE));
        assert!(!RequestOrigin::Lru.expires());
    }

    #[test]
    fn test_split_keeps_order() {
        let batches = RequestBatch::split(RequestOrigin::ColdRead, 0..(MAX_REQ_IDX as u32 + 5));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), MAX_REQ_IDX);
        assert_eq!(batches[1].iter().collect::<Vec<_>>(), vec![2042, 2043, 2044, 2045, 2046]);
        assert!(batches.iter().all(|b| b.origin() == RequestOrigin::ColdRead));
    }
}
