//! Free and working lists over a fixed set of slots.
//!
//! Both lists are doubly linked through one shared array of links indexed
//! by slot, so every slot sits in exactly one list and can be unlinked in
//! O(1) given only its index.

/// Which list a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Free,
    Working,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    owner: Partition,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ends {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// The free and working lists of a pool.
#[derive(Debug)]
pub struct Partitions {
    links: Vec<Link>,
    free: Ends,
    working: Ends,
}

impl Partitions {
    /// Create lists over `capacity` slots, all free, in index order.
    pub fn new(capacity: usize) -> Self {
        let links = (0..capacity)
            .map(|i| Link {
                prev: i.checked_sub(1),
                next: if i + 1 < capacity { Some(i + 1) } else { None },
                owner: Partition::Free,
            })
            .collect();

        let free = Ends {
            head: if capacity > 0 { Some(0) } else { None },
            tail: capacity.checked_sub(1),
            len: capacity,
        };

        Self {
            links,
            free,
            working: Ends::default(),
        }
    }

    fn ends(&self, p: Partition) -> &Ends {
        match p {
            Partition::Free => &self.free,
            Partition::Working => &self.working,
        }
    }

    fn ends_mut(&mut self, p: Partition) -> &mut Ends {
        match p {
            Partition::Free => &mut self.free,
            Partition::Working => &mut self.working,
        }
    }

    pub fn len(&self, p: Partition) -> usize {
        self.ends(p).len
    }

    #[cfg(test)]
    pub fn owner(&self, idx: usize) -> Partition {
        self.links[idx].owner
    }

    pub fn front(&self, p: Partition) -> Option<usize> {
        self.ends(p).head
    }

    /// Slot following `idx` in its list.
    pub fn next(&self, idx: usize) -> Option<usize> {
        self.links[idx].next
    }

    /// Move the first slot of `from` to the back of `to` and return it.
    pub fn take_front(&mut self, from: Partition, to: Partition) -> Option<usize> {
        let idx = self.front(from)?;
        self.move_to_back(idx, to);
        Some(idx)
    }

    /// Move `idx` to the back of `p`, wherever it is now.
    pub fn move_to_back(&mut self, idx: usize, p: Partition) {
        self.unlink(idx);
        self.push_back(idx, p);
    }

    /// Iterate slots of `p` from front to back.
    #[cfg(test)]
    pub fn iter(&self, p: Partition) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.front(p), move |&i| self.next(i))
    }

    /// Detach `idx` from its list. Always followed by `push_back`.
    fn unlink(&mut self, idx: usize) {
        let Link { prev, next, owner } = self.links[idx];

        match prev {
            Some(p) => self.links[p].next = next,
            None => self.ends_mut(owner).head = next,
        }
        match next {
            Some(n) => self.links[n].prev = prev,
            None => self.ends_mut(owner).tail = prev,
        }

        self.links[idx].prev = None;
        self.links[idx].next = None;
        self.ends_mut(owner).len -= 1;
    }

    fn push_back(&mut self, idx: usize, p: Partition) {
        let tail = self.ends(p).tail;
        self.links[idx] = Link {
            prev: tail,
            next: None,
            owner: p,
        };

        match tail {
            Some(t) => self.links[t].next = Some(idx),
            None => self.ends_mut(p).head = Some(idx),
        }
        let ends = self.ends_mut(p);
        ends.tail = Some(idx);
        ends.len += 1;
    }
}
