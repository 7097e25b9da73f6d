//! LRU list: recency order of resident slots.
//!
//! The list is linked through two index arrays sized to the slot table, so a
//! slot's linkage costs two `u32`s and moving or unlinking it is O(1).
//! The head is the most recently used end; writeback victims are taken
//! from the tail.

const NIL: u32 = u32::MAX;

/// Index-linked doubly linked list over slot indices.
#[derive(Debug)]
pub struct LruList {
    prev: Vec<u32>,
    next: Vec<u32>,
    linked: Vec<bool>,
    head: u32,
    tail: u32,
    len: usize,
}

impl LruList {
    pub fn new(nr_slots: u32) -> Self {
        let n = nr_slots as usize;
        Self {
            prev: vec![NIL; n],
            next: vec![NIL; n],
            linked: vec![false; n],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, index: u32) -> bool {
        self.linked[index as usize]
    }

    /// Move (or insert) a slot to the most recently used end.
    pub fn touch(&mut self, index: u32) {
        if self.contains(index) {
            if self.head == index {
                return;
            }
            self.unlink(index);
        }
        self.link_head(index);
    }

    /// Insert a slot at the cold end so the next cycle sees it first.
    pub fn push_cold(&mut self, index: u32) {
        if self.contains(index) {
            self.unlink(index);
        }
        let i = index as usize;
        self.next[i] = NIL;
        self.prev[i] = self.tail;
        if self.tail != NIL {
            self.next[self.tail as usize] = index;
        } else {
            self.head = index;
        }
        self.tail = index;
        self.linked[i] = true;
        self.len += 1;
    }

    /// Unlink a slot. Returns false if it was not on the list.
    pub fn remove(&mut self, index: u32) -> bool {
        if !self.contains(index) {
            return false;
        }
        self.unlink(index);
        true
    }

    /// Up to `max` slot indices starting from the least recently used end.
    ///
    /// The list is left untouched; callers unlink the slots they actually take.
    pub fn coldest(&self, max: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(max.min(self.len));
        let mut cursor = self.tail;
        while cursor != NIL && out.len() < max {
            out.push(cursor);
            cursor = self.prev[cursor as usize];
        }
        out
    }

    fn link_head(&mut self, index: u32) {
        let i = index as usize;
        self.prev[i] = NIL;
        self.next[i] = self.head;
        if self.head != NIL {
            self.prev[self.head as usize] = index;
        } else {
            self.tail = index;
        }
        self.head = index;
        self.linked[i] = true;
        self.len += 1;
    }

    fn unlink(&mut self, index: u32) {
        let i = index as usize;
        let (p, n) = (self.prev[i], self.next[i]);
        if p != NIL {
            self.next[p as usize] = n;
        } else {
            self.head = n;
        }
        if n != NIL {
            self.prev[n as usize] = p;
        } else {
            self.tail = p;
        }
        self.prev[i] = NIL;
        self.next[i] = NIL;
        self.linked[i] = false;
        self.len -= 1;
    }
}
