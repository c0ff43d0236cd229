//! The ordered set of carfiles waiting to be cached.
//!
//! Entries are FIFO by first arrival. A request for a carfile already in
//! the set extends that entry; the worker drains the set head to tail and
//! never leaves an entry while it still has pending placements.

use courier_core::rpc::CacheBlocksRequest;
use std::collections::VecDeque;

/// One block placement waiting to be fetched, with its retry budget spent
/// so far.
#[derive(Clone, Debug)]
pub struct DelayedPlacement {
    pub cid: String,
    pub fid: i64,
    pub retries: u32,
    pub download_url: String,
    pub download_token: String,
    pub carfile_hash: String,
    pub cache_id: String,
}

#[derive(Debug)]
struct CarfileEntry {
    carfile_hash: String,
    pending: VecDeque<DelayedPlacement>,
}

/// FIFO queue of carfile entries.
#[derive(Debug, Default)]
pub struct CarfileQueue {
    entries: VecDeque<CarfileEntry>,
}

impl CarfileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request's placements: to the existing entry for its
    /// carfile, or as a new tail entry.
    pub fn append(&mut self, req: &CacheBlocksRequest) {
        let placements = req.block_infos.iter().filter(|b| !b.cid.is_empty()).map(|b| {
            DelayedPlacement {
                cid: b.cid.clone(),
                fid: b.fid,
                retries: 0,
                download_url: req.download_url.clone(),
                download_token: req.download_token.clone(),
                carfile_hash: req.carfile_hash.clone(),
                cache_id: req.cache_id.clone(),
            }
        });

        match self
            .entries
            .iter_mut()
            .find(|e| e.carfile_hash == req.carfile_hash)
        {
            Some(entry) => entry.pending.extend(placements),
            None => self.entries.push_back(CarfileEntry {
                carfile_hash: req.carfile_hash.clone(),
                pending: placements.collect(),
            }),
        }
    }

    /// Pull up to `n` placements from the head entry. Entries drained to
    /// empty are dropped, so the next call reads the following carfile.
    pub fn take_batch(&mut self, n: usize) -> Vec<DelayedPlacement> {
        while let Some(front) = self.entries.front_mut() {
            if front.pending.is_empty() {
                self.entries.pop_front();
                continue;
            }
            let take = front.pending.len().min(n);
            return front.pending.drain(..take).collect();
        }
        Vec::new()
    }

    /// Drop the entry for a carfile, returning how many queued placements
    /// disappeared with it.
    pub fn remove(&mut self, carfile_hash: &str) -> usize {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.carfile_hash == carfile_hash)
        {
            let entry = self.entries.remove(pos).expect("position is in bounds");
            return entry.pending.len();
        }
        0
    }

    /// Total queued placements across all entries.
    pub fn waiting_total(&self) -> usize {
        self.entries.iter().map(|e| e.pending.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::rpc::BlockPlacement;

    fn request(hash: &str, cids: &[&str]) -> CacheBlocksRequest {
        CacheBlocksRequest {
            block_infos: cids
                .iter()
                .enumerate()
                .map(|(i, cid)| BlockPlacement {
                    cid: cid.to_string(),
                    fid: i as i64 + 1,
                })
                .collect(),
            download_url: String::new(),
            download_token: String::new(),
            carfile_hash: hash.to_string(),
            cache_id: format!("{hash}_1"),
        }
    }

    #[test]
    fn test_fifo_by_first_arrival() {
        let mut queue = CarfileQueue::new();
        queue.append(&request("aa", &["a1", "a2"]));
        queue.append(&request("bb", &["b1"]));
        // extending "aa" must not move it behind "bb"
        queue.append(&request("aa", &["a3"]));

        let batch = queue.take_batch(10);
        assert_eq!(
            batch.iter().map(|p| p.cid.as_str()).collect::<Vec<_>>(),
            vec!["a1", "a2", "a3"]
        );
        let batch = queue.take_batch(10);
        assert_eq!(batch[0].cid, "b1");
    }

    #[test]
    fn test_take_batch_respects_limit() {
        let mut queue = CarfileQueue::new();
        queue.append(&request("aa", &["a1", "a2", "a3"]));

        assert_eq!(queue.take_batch(2).len(), 2);
        assert_eq!(queue.waiting_total(), 1);
        assert_eq!(queue.take_batch(2).len(), 1);
        assert!(queue.take_batch(2).is_empty());
    }

    #[test]
    fn test_remove_drops_only_matching_entry() {
        let mut queue = CarfileQueue::new();
        queue.append(&request("aa", &["a1", "a2"]));
        queue.append(&request("bb", &["b1"]));

        assert_eq!(queue.remove("aa"), 2);
        assert_eq!(queue.remove("aa"), 0);
        assert_eq!(queue.waiting_total(), 1);
    }

    #[test]
    fn test_empty_cids_are_skipped() {
        let mut queue = CarfileQueue::new();
        queue.append(&request("aa", &["", "a1"]));
        assert_eq!(queue.waiting_total(), 1);
    }
}
