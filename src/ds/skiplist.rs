//! Skiplist
//!
//! Ordered index of (score, member) pairs backing large sorted sets.
//! Nodes live in an arena and link forward by index, so the structure is
//! plain safe Rust; the probabilistic level assignment gives the usual
//! O(log n) expected search and insert.
//!
//! Ordering is by score first, then lexicographically by member, which
//! makes (score, member) pairs unique and totally ordered.

use bytes::Bytes;

const MAX_LEVEL: usize = 32;
/// Each level is kept with probability 1/4.
const BRANCH: u64 = 4;

#[derive(Debug, Clone)]
struct Node {
    member: Bytes,
    score: f64,
    forward: Vec<Option<usize>>,
}

/// Skip list keyed by (score, member).
#[derive(Debug, Clone)]
pub struct SkipList {
    head: Vec<Option<usize>>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    len: usize,
    rng: u64,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    pub fn new() -> Self {
        Self {
            head: vec![None],
            nodes: Vec::new(),
            free: Vec::new(),
            len: 0,
            rng: 0x2545f4914f6cdd1d,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn next_rand(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while self.next_rand() % BRANCH == 0 && level < MAX_LEVEL {
            level += 1;
        }
        level
    }

    /// Forward pointer at `level` of `node`, where `None` means the head.
    fn forward(&self, node: Option<usize>, level: usize) -> Option<usize> {
        match node {
            Some(idx) => self.nodes[idx].forward.get(level).copied().flatten(),
            None => self.head.get(level).copied().flatten(),
        }
    }

    fn set_forward(&mut self, node: Option<usize>, level: usize, target: Option<usize>) {
        match node {
            Some(idx) => self.nodes[idx].forward[level] = target,
            None => self.head[level] = target,
        }
    }

    fn precedes(node: &Node, score: f64, member: &[u8]) -> bool {
        node.score < score || (node.score == score && node.member.as_ref() < member)
    }

    /// Finds the rightmost node before (score, member) on every level.
    fn find_previous(&self, score: f64, member: &[u8]) -> Vec<Option<usize>> {
        let mut prev = vec![None; self.head.len()];
        let mut at: Option<usize> = None;
        for level in (0..self.head.len()).rev() {
            while let Some(next) = self.forward(at, level) {
                if Self::precedes(&self.nodes[next], score, member) {
                    at = Some(next);
                } else {
                    break;
                }
            }
            prev[level] = at;
        }
        prev
    }

    /// Inserts a (score, member) pair. The caller guarantees the member is
    /// not already present with this score.
    pub fn insert(&mut self, score: f64, member: Bytes) {
        let level = self.random_level();
        while self.head.len() < level {
            self.head.push(None);
        }
        let prev = self.find_previous(score, &member);

        let node = Node {
            member,
            score,
            forward: vec![None; level],
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        for l in 0..level {
            let next = self.forward(prev.get(l).copied().flatten(), l);
            self.nodes[idx].forward[l] = next;
            self.set_forward(prev.get(l).copied().flatten(), l, Some(idx));
        }
        self.len += 1;
    }

    /// Removes the exact (score, member) pair. Returns false when absent.
    pub fn remove(&mut self, score: f64, member: &[u8]) -> bool {
        let prev = self.find_previous(score, member);
        let target = match self.forward(prev[0], 0) {
            Some(idx)
                if self.nodes[idx].score == score && self.nodes[idx].member.as_ref() == member =>
            {
                idx
            }
            _ => return false,
        };

        for l in 0..self.head.len() {
            if self.forward(prev[l], l) == Some(target) {
                let next = self.nodes[target].forward.get(l).copied().flatten();
                self.set_forward(prev[l], l, next);
            }
        }
        self.nodes[target].member = Bytes::new();
        self.nodes[target].forward.clear();
        self.free.push(target);
        self.len -= 1;
        true
    }

    /// Walks pairs in (score, member) order.
    pub fn iter(&self) -> SkipListIter<'_> {
        SkipListIter {
            list: self,
            at: self.head[0],
        }
    }

    /// Allocator-level footprint of one node: the node record plus its
    /// forward-pointer array. The member string is accounted separately.
    pub fn node_alloc_size(&self) -> usize {
        std::mem::size_of::<Node>() + MAX_LEVEL / 2 * std::mem::size_of::<Option<usize>>()
    }
}

pub struct SkipListIter<'a> {
    list: &'a SkipList,
    at: Option<usize>,
}

impl<'a> Iterator for SkipListIter<'a> {
    type Item = (f64, &'a Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.at?;
        let node = &self.list.nodes[idx];
        self.at = node.forward.first().copied().flatten();
        Some((node.score, &node.member))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(sl: &SkipList) -> Vec<(f64, String)> {
        sl.iter()
            .map(|(s, m)| (s, String::from_utf8_lossy(m).into_owned()))
            .collect()
    }

    #[test]
    fn test_insert_orders_by_score() {
        let mut sl = SkipList::new();
        sl.insert(3.0, Bytes::from("c"));
        sl.insert(1.0, Bytes::from("a"));
        sl.insert(2.0, Bytes::from("b"));
        assert_eq!(
            members(&sl),
            vec![
                (1.0, "a".to_string()),
                (2.0, "b".to_string()),
                (3.0, "c".to_string())
            ]
        );
    }

    #[test]
    fn test_equal_scores_order_by_member() {
        let mut sl = SkipList::new();
        sl.insert(1.0, Bytes::from("zebra"));
        sl.insert(1.0, Bytes::from("apple"));
        let names: Vec<String> = members(&sl).into_iter().map(|(_, m)| m).collect();
        assert_eq!(names, vec!["apple", "zebra"]);
    }

    #[test]
    fn test_remove() {
        let mut sl = SkipList::new();
        sl.insert(1.0, Bytes::from("a"));
        sl.insert(2.0, Bytes::from("b"));
        assert!(sl.remove(1.0, b"a"));
        assert!(!sl.remove(1.0, b"a"));
        assert_eq!(sl.len(), 1);
        assert_eq!(members(&sl), vec![(2.0, "b".to_string())]);
    }

    #[test]
    fn test_remove_requires_exact_score() {
        let mut sl = SkipList::new();
        sl.insert(1.0, Bytes::from("a"));
        assert!(!sl.remove(2.0, b"a"));
        assert_eq!(sl.len(), 1);
    }

    #[test]
    fn test_large_insert_stays_sorted() {
        let mut sl = SkipList::new();
        for i in (0..500).rev() {
            sl.insert(i as f64, Bytes::from(format!("m{}", i)));
        }
        assert_eq!(sl.len(), 500);
        let scores: Vec<f64> = sl.iter().map(|(s, _)| s).collect();
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(scores, sorted);
    }

    #[test]
    fn test_arena_reuse_after_remove() {
        let mut sl = SkipList::new();
        sl.insert(1.0, Bytes::from("a"));
        sl.remove(1.0, b"a");
        sl.insert(2.0, Bytes::from("b"));
        assert_eq!(sl.len(), 1);
        assert_eq!(members(&sl), vec![(2.0, "b".to_string())]);
    }
}
