//! Per-Value Memory Estimation
//!
//! Computes the bytes a value consumes. Simple encodings report exactly;
//! hash tables, quicklists and skip lists are estimated by sampling a
//! bounded number of elements and extrapolating the average, because this
//! path runs inside request handling where walking a million-element
//! aggregate is not an option.

use std::mem::size_of;

use bytes::Bytes;

use crate::alloc;
use crate::ds::quicklist::QuickListNode;
use crate::ds::{Dict, IntSet, QuickList};

use super::{Object, Payload, ZSetPair};

/// Elements sampled per aggregate when the caller does not say otherwise.
pub const DEFAULT_SIZE_SAMPLES: usize = 5;

/// Estimated bytes consumed by `o`.
///
/// `samples` bounds how many elements of an aggregate are visited;
/// `0` means visit everything. Results are exact for strings, intsets and
/// ziplist-encoded aggregates, approximate for the sampled encodings.
pub fn compute_size(o: &Object, samples: usize) -> usize {
    let budget = if samples == 0 { usize::MAX } else { samples };
    let header = size_of::<Object>();

    match o.payload() {
        Payload::Int(_) => header,
        Payload::Raw(s) => header + s.alloc_size(),
        Payload::Emb(e) => header + e.len() + 2,
        Payload::ListZip(zl) | Payload::HashZip(zl) | Payload::ZSetZip(zl) => {
            header + zl.blob_len()
        }
        Payload::ListQuick(ql) => {
            let mut asize = header + size_of::<QuickList>();
            let mut sampled = 0usize;
            let mut visited = 0usize;
            for node in ql.nodes().take(budget) {
                sampled += size_of::<QuickListNode>() + node.blob_len();
                visited += 1;
            }
            if visited > 0 {
                asize += average_scaled(sampled, visited, ql.node_count());
            }
            asize
        }
        Payload::SetInt(is) => {
            header + size_of::<IntSet>() + is.element_width() * is.len()
        }
        Payload::SetTable(d) => {
            let mut asize = header + size_of::<Dict<Bytes, ()>>() + d.bucket_bytes();
            let mut sampled = 0usize;
            let mut visited = 0usize;
            for (member, _) in d.iter().take(budget) {
                sampled += Dict::<Bytes, ()>::entry_overhead() + alloc::alloc_size(member.len());
                visited += 1;
            }
            if visited > 0 {
                asize += average_scaled(sampled, visited, d.len());
            }
            asize
        }
        Payload::HashTable(d) => {
            let mut asize = header + size_of::<Dict<Bytes, Bytes>>() + d.bucket_bytes();
            let mut sampled = 0usize;
            let mut visited = 0usize;
            for (field, value) in d.iter().take(budget) {
                sampled += Dict::<Bytes, Bytes>::entry_overhead()
                    + alloc::alloc_size(field.len())
                    + alloc::alloc_size(value.len());
                visited += 1;
            }
            if visited > 0 {
                asize += average_scaled(sampled, visited, d.len());
            }
            asize
        }
        Payload::ZSetSkip(zs) => {
            let mut asize = header + size_of::<ZSetPair>() + zs.index.bucket_bytes();
            let mut sampled = 0usize;
            let mut visited = 0usize;
            for (_, member) in zs.skip.iter().take(budget) {
                sampled += alloc::alloc_size(member.len())
                    + Dict::<Bytes, f64>::entry_overhead()
                    + zs.skip.node_alloc_size();
                visited += 1;
            }
            if visited > 0 {
                asize += average_scaled(sampled, visited, zs.index.len());
            }
            asize
        }
        Payload::Module(m) => m.mem_usage(),
    }
}

/// Extrapolates the sampled byte total to the full element count.
fn average_scaled(sampled: usize, visited: usize, total: usize) -> usize {
    (sampled as f64 / visited as f64 * total as f64) as usize
}
