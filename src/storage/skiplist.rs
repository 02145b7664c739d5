//! Skiplist ordering engine for sorted sets.
//!
//! Nodes are ordered by `(score, member)` and live in an arena (`Vec<Node>`)
//! addressed by index; slot 0 is the header sentinel. Every forward link
//! carries a *span*, the number of level-0 hops it covers, so rank lookups
//! and rank-ranged deletes run in O(log n).
//!
//! ```text
//! level 2: HEAD ─────────────3────────────▶ C
//! level 1: HEAD ────1───▶ A ─────2───────▶ C
//! level 0: HEAD ─1─▶ A ─1─▶ B ─1─▶ C ─1─▶ D
//!                   ◀──── backward links ────
//! ```
//!
//! Ties on score are broken by member bytes, so `(score, member)` pairs are
//! unique. A score change is always remove-then-insert; a live node's score is
//! never mutated in place.

use bytes::Bytes;
use rand::Rng;

/// Maximum number of levels a node can have.
pub const MAX_LEVEL: usize = 16;

const HEAD: usize = 0;

/// A member of a sorted set together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub member: Bytes,
    pub score: f64,
}

impl Element {
    fn precedes(&self, score: f64, member: &[u8]) -> bool {
        self.score < score || (self.score == score && self.member[..] < *member)
    }
}

/// One endpoint of a score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Border {
    NegInf,
    PosInf,
    Finite { value: f64, exclusive: bool },
}

impl Border {
    /// Parses `-inf`, `+inf`, `inf`, `1.5` and the exclusive form `(1.5`.
    /// Returns `None` for anything else, including NaN.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let (exclusive, number) = match text.strip_prefix('(') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        match number.to_ascii_lowercase().as_str() {
            "-inf" => return Some(Border::NegInf),
            "+inf" | "inf" => return Some(Border::PosInf),
            _ => {}
        }
        let value: f64 = number.parse().ok()?;
        if value.is_nan() {
            return None;
        }
        Some(Border::Finite { value, exclusive })
    }

    pub fn inclusive(value: f64) -> Self {
        Border::Finite {
            value,
            exclusive: false,
        }
    }

    /// True when `score` lies on the upper side of this border used as a minimum.
    pub fn allows_min(&self, score: f64) -> bool {
        match *self {
            Border::NegInf => true,
            Border::PosInf => false,
            Border::Finite { value, exclusive } => {
                if exclusive {
                    value < score
                } else {
                    value <= score
                }
            }
        }
    }

    /// True when `score` lies on the lower side of this border used as a maximum.
    pub fn allows_max(&self, score: f64) -> bool {
        match *self {
            Border::PosInf => true,
            Border::NegInf => false,
            Border::Finite { value, exclusive } => {
                if exclusive {
                    value > score
                } else {
                    value >= score
                }
            }
        }
    }

    /// Whether `[min, max]` can contain any score at all.
    pub fn intersects(min: &Border, max: &Border) -> bool {
        match (min, max) {
            (Border::PosInf, _) | (_, Border::NegInf) => false,
            (Border::NegInf, _) | (_, Border::PosInf) => true,
            (
                Border::Finite {
                    value: lo,
                    exclusive: lo_ex,
                },
                Border::Finite {
                    value: hi,
                    exclusive: hi_ex,
                },
            ) => lo < hi || (lo == hi && !lo_ex && !hi_ex),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Level {
    forward: Option<usize>,
    span: usize,
}

#[derive(Debug)]
struct Node {
    element: Element,
    backward: Option<usize>,
    levels: Vec<Level>,
}

impl Node {
    fn new(level: usize, element: Element) -> Self {
        Self {
            element,
            backward: None,
            levels: vec![Level::default(); level],
        }
    }
}

fn random_level() -> usize {
    let mut rng = rand::thread_rng();
    let mut level = 1;
    while level < MAX_LEVEL && rng.gen::<bool>() {
        level += 1;
    }
    level
}

/// An arena-backed skiplist.
#[derive(Debug)]
pub struct Skiplist {
    nodes: Vec<Node>,
    free: Vec<usize>,
    tail: Option<usize>,
    length: usize,
    level: usize,
}

impl Default for Skiplist {
    fn default() -> Self {
        Self::new()
    }
}

impl Skiplist {
    pub fn new() -> Self {
        let header = Node::new(
            MAX_LEVEL,
            Element {
                member: Bytes::new(),
                score: 0.0,
            },
        );
        Self {
            nodes: vec![header],
            free: Vec::new(),
            tail: None,
            length: 0,
            level: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    fn forward(&self, node: usize, level: usize) -> Option<usize> {
        self.nodes[node].levels[level].forward
    }

    #[inline]
    fn span(&self, node: usize, level: usize) -> usize {
        self.nodes[node].levels[level].span
    }

    #[inline]
    fn score(&self, node: usize) -> f64 {
        self.nodes[node].element.score
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Returns the slot to the free list and hands back its element.
    fn release(&mut self, slot: usize) -> Element {
        let node = &mut self.nodes[slot];
        node.levels.clear();
        node.backward = None;
        self.free.push(slot);
        std::mem::replace(
            &mut self.nodes[slot].element,
            Element {
                member: Bytes::new(),
                score: 0.0,
            },
        )
    }

    /// For every level, the last node strictly before `(score, member)`.
    fn predecessors(&self, score: f64, member: &[u8]) -> [usize; MAX_LEVEL] {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.forward(x, i) {
                if !self.nodes[next].element.precedes(score, member) {
                    break;
                }
                x = next;
            }
            update[i] = x;
        }
        update
    }

    /// Inserts a new `(member, score)` pair. The caller guarantees the pair
    /// is not already present.
    pub fn insert(&mut self, member: Bytes, score: f64) -> &Element {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.forward(x, i) {
                if !self.nodes[next].element.precedes(score, &member) {
                    break;
                }
                rank[i] += self.span(x, i);
                x = next;
            }
            update[i] = x;
        }

        let level = random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = HEAD;
                self.nodes[HEAD].levels[i].span = self.length;
            }
            self.level = level;
        }

        let new = self.alloc(Node::new(level, Element { member, score }));
        for i in 0..level {
            let prev = update[i];
            let before = self.nodes[prev].levels[i];
            self.nodes[new].levels[i] = Level {
                forward: before.forward,
                span: before.span - (rank[0] - rank[i]),
            };
            self.nodes[prev].levels[i] = Level {
                forward: Some(new),
                span: rank[0] - rank[i] + 1,
            };
        }
        for (i, &prev) in update.iter().enumerate().take(self.level).skip(level) {
            self.nodes[prev].levels[i].span += 1;
        }

        self.nodes[new].backward = (update[0] != HEAD).then_some(update[0]);
        match self.forward(new, 0) {
            Some(next) => self.nodes[next].backward = Some(new),
            None => self.tail = Some(new),
        }
        self.length += 1;
        &self.nodes[new].element
    }

    fn remove_node(&mut self, x: usize, update: &[usize; MAX_LEVEL]) -> Element {
        for (i, &prev) in update.iter().enumerate().take(self.level) {
            if self.forward(prev, i) == Some(x) {
                let removed = self.nodes[x].levels[i];
                let link = &mut self.nodes[prev].levels[i];
                link.span = link.span + removed.span - 1;
                link.forward = removed.forward;
            } else {
                self.nodes[prev].levels[i].span -= 1;
            }
        }

        let backward = self.nodes[x].backward;
        match self.forward(x, 0) {
            Some(next) => self.nodes[next].backward = backward,
            None => self.tail = backward,
        }
        while self.level > 1 && self.forward(HEAD, self.level - 1).is_none() {
            self.level -= 1;
        }
        self.length -= 1;
        self.release(x)
    }

    /// Removes the exact `(member, score)` pair. Returns false if absent.
    pub fn remove(&mut self, member: &[u8], score: f64) -> bool {
        let update = self.predecessors(score, member);
        match self.forward(update[0], 0) {
            Some(x)
                if self.nodes[x].element.score == score
                    && self.nodes[x].element.member[..] == *member =>
            {
                self.remove_node(x, &update);
                true
            }
            _ => false,
        }
    }

    /// 1-based rank of `(member, score)`, 0 when absent.
    pub fn rank(&self, member: &[u8], score: f64) -> usize {
        let mut rank = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.forward(x, i) {
                let el = &self.nodes[next].element;
                if el.score < score || (el.score == score && el.member[..] <= *member) {
                    rank += self.span(x, i);
                    x = next;
                } else {
                    break;
                }
            }
            let el = &self.nodes[x].element;
            if x != HEAD && el.score == score && el.member[..] == *member {
                return rank;
            }
        }
        0
    }

    fn node_by_rank(&self, rank: usize) -> Option<usize> {
        if rank == 0 || rank > self.length {
            return None;
        }
        let mut traversed = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.forward(x, i) {
                if traversed + self.span(x, i) > rank {
                    break;
                }
                traversed += self.span(x, i);
                x = next;
            }
            if traversed == rank {
                return Some(x);
            }
        }
        None
    }

    /// Element at a 1-based rank.
    pub fn get_by_rank(&self, rank: usize) -> Option<&Element> {
        self.node_by_rank(rank).map(|x| &self.nodes[x].element)
    }

    pub fn first(&self) -> Option<&Element> {
        self.forward(HEAD, 0).map(|x| &self.nodes[x].element)
    }

    pub fn last(&self) -> Option<&Element> {
        self.tail.map(|x| &self.nodes[x].element)
    }

    /// Cheap pre-check: is any element possibly inside `[min, max]`?
    pub fn has_in_range(&self, min: &Border, max: &Border) -> bool {
        if !Border::intersects(min, max) {
            return false;
        }
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => min.allows_min(last.score) && max.allows_max(first.score),
            _ => false,
        }
    }

    fn first_node_in_range(&self, min: &Border, max: &Border) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.forward(x, i) {
                if min.allows_min(self.score(next)) {
                    break;
                }
                x = next;
            }
        }
        self.forward(x, 0)
            .filter(|&candidate| max.allows_max(self.score(candidate)))
    }

    fn last_node_in_range(&self, min: &Border, max: &Border) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.forward(x, i) {
                if !max.allows_max(self.score(next)) {
                    break;
                }
                x = next;
            }
        }
        (x != HEAD && min.allows_min(self.score(x))).then_some(x)
    }

    pub fn first_in_range(&self, min: &Border, max: &Border) -> Option<&Element> {
        self.first_node_in_range(min, max)
            .map(|x| &self.nodes[x].element)
    }

    pub fn last_in_range(&self, min: &Border, max: &Border) -> Option<&Element> {
        self.last_node_in_range(min, max)
            .map(|x| &self.nodes[x].element)
    }

    /// Removes up to `limit` elements with scores inside `[min, max]`,
    /// returned in ascending order.
    pub fn remove_range_by_score(&mut self, min: &Border, max: &Border, limit: usize) -> Vec<Element> {
        let mut removed = Vec::new();
        if !self.has_in_range(min, max) {
            return removed;
        }

        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.forward(x, i) {
                if min.allows_min(self.score(next)) {
                    break;
                }
                x = next;
            }
            update[i] = x;
        }

        let mut cursor = self.forward(x, 0);
        while let Some(node) = cursor {
            if removed.len() >= limit || !max.allows_max(self.score(node)) {
                break;
            }
            cursor = self.forward(node, 0);
            removed.push(self.remove_node(node, &update));
        }
        removed
    }

    /// Removes elements with 1-based ranks `start..=stop`, ascending.
    pub fn remove_range_by_rank(&mut self, start: usize, stop: usize) -> Vec<Element> {
        let mut removed = Vec::new();
        if start == 0 || start > stop {
            return removed;
        }

        let mut update = [HEAD; MAX_LEVEL];
        let mut traversed = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.forward(x, i) {
                if traversed + self.span(x, i) >= start {
                    break;
                }
                traversed += self.span(x, i);
                x = next;
            }
            update[i] = x;
        }

        traversed += 1;
        let mut cursor = self.forward(x, 0);
        while let Some(node) = cursor {
            if traversed > stop {
                break;
            }
            cursor = self.forward(node, 0);
            removed.push(self.remove_node(node, &update));
            traversed += 1;
        }
        removed
    }

    /// Ascending iteration over all elements.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.forward(HEAD, 0),
            reverse: false,
        }
    }

    /// Descending iteration over all elements.
    pub fn iter_rev(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.tail,
            reverse: true,
        }
    }

    /// Iterates from a 1-based rank towards the tail, or towards the head
    /// when `reverse` is set.
    pub fn iter_from_rank(&self, rank: usize, reverse: bool) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.node_by_rank(rank),
            reverse,
        }
    }

    /// Iterates over the elements inside `[min, max]`.
    pub fn iter_in_range<'a>(
        &'a self,
        min: &Border,
        max: &Border,
        reverse: bool,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        let (min, max) = (*min, *max);
        let start = if reverse {
            self.last_node_in_range(&min, &max)
        } else {
            self.first_node_in_range(&min, &max)
        };
        Iter {
            list: self,
            cursor: start,
            reverse,
        }
        .take_while(move |el| {
            if reverse {
                min.allows_min(el.score)
            } else {
                max.allows_max(el.score)
            }
        })
    }
}

/// Walks the level-0 list in either direction.
pub struct Iter<'a> {
    list: &'a Skiplist,
    cursor: Option<usize>,
    reverse: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.list.nodes[self.cursor?];
        self.cursor = if self.reverse {
            node.backward
        } else {
            node.levels[0].forward
        };
        Some(&node.element)
    }
}
