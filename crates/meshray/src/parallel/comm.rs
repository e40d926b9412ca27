//! In-process inter-rank communicator.
//!
//! One rank = one thread. Packed-ray transfers ride dedicated data
//! channels; collectives ride separate channels with sequence numbers so
//! a fast rank's next collective cannot be mistaken for the current one.
//! Global quiescence is tracked with a shared live-ray count: a ray
//! enters the count when it is moved into any work buffer and leaves it
//! on completion, so handoffs keep the count stable and zero means no
//! work exists anywhere, including in flight.

use std::any::Any;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Counters shared by all ranks of one execution.
#[derive(Debug, Default)]
pub struct CommShared {
    live_rays: AtomicI64,
    sent: AtomicU64,
    received: AtomicU64,
    aborted: std::sync::atomic::AtomicBool,
}

struct DataMsg {
    words: Vec<f64>,
    count: usize,
}

struct CollMsg {
    from: u32,
    seq: u64,
    payload: Box<dyn Any + Send>,
}

pub struct RankComm {
    rank: u32,
    n_ranks: u32,
    data_senders: Vec<Sender<DataMsg>>,
    data_receiver: Receiver<DataMsg>,
    coll_senders: Vec<Sender<CollMsg>>,
    coll_receiver: Receiver<CollMsg>,
    coll_seq: u64,
    stash: Vec<CollMsg>,
    shared: Arc<CommShared>,
}

/// Builds the communicators for an `n_ranks`-way execution.
pub fn make_comms(n_ranks: u32) -> Vec<RankComm> {
    let n = n_ranks as usize;
    let shared = Arc::new(CommShared::default());

    let mut data_senders = Vec::with_capacity(n);
    let mut data_receivers = Vec::with_capacity(n);
    let mut coll_senders = Vec::with_capacity(n);
    let mut coll_receivers = Vec::with_capacity(n);
    for _ in 0..n {
        let (ds, dr) = unbounded();
        data_senders.push(ds);
        data_receivers.push(dr);
        let (cs, cr) = unbounded();
        coll_senders.push(cs);
        coll_receivers.push(cr);
    }

    data_receivers
        .into_iter()
        .zip(coll_receivers)
        .enumerate()
        .map(|(rank, (data_receiver, coll_receiver))| RankComm {
            rank: rank as u32,
            n_ranks,
            data_senders: data_senders.clone(),
            data_receiver,
            coll_senders: coll_senders.clone(),
            coll_receiver,
            coll_seq: 0,
            stash: Vec::new(),
            shared: shared.clone(),
        })
        .collect()
}

/// A single-rank communicator for serial execution.
pub fn solo_comm() -> RankComm {
    make_comms(1).pop().expect("one communicator")
}

impl RankComm {
    #[inline]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    #[inline]
    pub fn n_ranks(&self) -> u32 {
        self.n_ranks
    }

    /// Sends a buffer of `count` packed rays to `dest`.
    pub(crate) fn send_packed(&self, dest: u32, words: Vec<f64>, count: usize) {
        self.shared.sent.fetch_add(count as u64, Ordering::SeqCst);
        // A send can only fail when the receiving rank already exited,
        // which means the run is tearing down
        let _ = self.data_senders[dest as usize].send(DataMsg { words, count });
    }

    /// Non-blocking receive of one packed buffer.
    pub(crate) fn try_recv_packed(&self) -> Option<(Vec<f64>, usize)> {
        let msg = self.data_receiver.try_recv().ok()?;
        self.shared
            .received
            .fetch_add(msg.count as u64, Ordering::SeqCst);
        Some((msg.words, msg.count))
    }

    /// Gathers one value from every rank, ordered by rank. All ranks
    /// must call collectives in the same order.
    pub fn allgather<T: Clone + Send + 'static>(&mut self, value: T) -> Vec<T> {
        let seq = self.coll_seq;
        self.coll_seq += 1;

        for dest in 0..self.n_ranks {
            if dest != self.rank {
                let msg = CollMsg {
                    from: self.rank,
                    seq,
                    payload: Box::new(value.clone()),
                };
                let _ = self.coll_senders[dest as usize].send(msg);
            }
        }

        let mut out: Vec<Option<T>> = (0..self.n_ranks).map(|_| None).collect();
        out[self.rank as usize] = Some(value);
        let mut remaining = self.n_ranks - 1;

        while remaining > 0 {
            // Messages from a prior poll round may be stashed
            if let Some(pos) = self.stash.iter().position(|m| m.seq == seq) {
                let msg = self.stash.swap_remove(pos);
                out[msg.from as usize] =
                    Some(*msg.payload.downcast::<T>().expect("collective type mismatch"));
                remaining -= 1;
                continue;
            }
            let msg = self
                .coll_receiver
                .recv()
                .expect("a peer rank exited during a collective");
            if msg.seq == seq {
                out[msg.from as usize] =
                    Some(*msg.payload.downcast::<T>().expect("collective type mismatch"));
                remaining -= 1;
            } else {
                self.stash.push(msg);
            }
        }

        out.into_iter()
            .map(|v| v.expect("collective slot unfilled"))
            .collect()
    }

    pub fn barrier(&mut self) {
        let _ = self.allgather(0u8);
    }

    // Live-ray accounting for termination detection

    pub(crate) fn add_live_rays(&self, n: usize) {
        self.shared.live_rays.fetch_add(n as i64, Ordering::SeqCst);
    }

    pub(crate) fn ray_completed(&self) {
        self.shared.live_rays.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn live_rays(&self) -> i64 {
        self.shared.live_rays.load(Ordering::SeqCst)
    }

    /// Marks the execution as failed so peers stop waiting for
    /// quiescence.
    pub(crate) fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Total rays handed off and received, over all ranks.
    pub fn transfer_counts(&self) -> (u64, u64) {
        (
            self.shared.sent.load(Ordering::SeqCst),
            self.shared.received.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allgather_is_ordered_by_rank() {
        let comms = make_comms(3);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|mut comm| {
                std::thread::spawn(move || {
                    let first = comm.allgather(comm.rank() * 10);
                    let second = comm.allgather(format!("r{}", comm.rank()));
                    (first, second)
                })
            })
            .collect();
        for handle in handles {
            let (first, second) = handle.join().expect("rank thread panicked");
            assert_eq!(first, vec![0, 10, 20]);
            assert_eq!(second, vec!["r0", "r1", "r2"]);
        }
    }

    #[test]
    fn packed_transfer_counts() {
        let comms = make_comms(2);
        let mut iter = comms.into_iter();
        let a = iter.next().expect("rank 0");
        let b = iter.next().expect("rank 1");

        a.send_packed(1, vec![1.0, 2.0], 1);
        assert_eq!(a.transfer_counts(), (1, 0));
        let (words, count) = b.try_recv_packed().expect("message pending");
        assert_eq!(words, vec![1.0, 2.0]);
        assert_eq!(count, 1);
        assert_eq!(b.transfer_counts(), (1, 1));
        assert!(b.try_recv_packed().is_none());
    }
}
