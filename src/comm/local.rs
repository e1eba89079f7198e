/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-process full-mesh implementation of [`Cluster`], used by tests and
//! by single-process deployments. Machines are connected by unbounded
//! mailboxes serviced by per-machine handler threads; the collectives
//! rendezvous through shared condvar-guarded state.

use std::sync::Arc;
use std::sync::Barrier;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::COORDINATOR;
use super::Cluster;
use super::MachineId;
use super::PeerMessage;
use crate::data::Snapshot;

struct GatherState {
    slots: Vec<Option<Snapshot>>,
    deposited: usize,
}

struct BroadcastState {
    payload: Option<Vec<u8>>,
    round: u64,
    taken: usize,
}

struct Shared {
    barrier: Barrier,
    gather: Mutex<GatherState>,
    gather_cv: Condvar,
    bcast: Mutex<BroadcastState>,
    bcast_cv: Condvar,
    mailboxes: Vec<mpsc::Sender<PeerMessage>>,
}

/// Create a full mesh of `n` machines. Each returned handle implements
/// [`Cluster`] for one machine; hand them to one driver thread each.
pub fn mesh(n: usize) -> Vec<LocalMachine> {
    assert!(n > 0, "a mesh needs at least one machine");
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| mpsc::channel()).unzip();
    let shared = Arc::new(Shared {
        barrier: Barrier::new(n),
        gather: Mutex::new(GatherState {
            slots: vec![None; n],
            deposited: 0,
        }),
        gather_cv: Condvar::new(),
        bcast: Mutex::new(BroadcastState {
            payload: None,
            round: 0,
            taken: 0,
        }),
        bcast_cv: Condvar::new(),
        mailboxes: senders,
    });
    receivers
        .into_iter()
        .enumerate()
        .map(|(id, incoming)| LocalMachine {
            id,
            shared: Arc::clone(&shared),
            incoming: Mutex::new(Some(incoming)),
            bcast_round: AtomicU64::new(0),
        })
        .collect()
}

/// One machine's handle into an in-process mesh.
pub struct LocalMachine {
    id: MachineId,
    shared: Arc<Shared>,
    incoming: Mutex<Option<mpsc::Receiver<PeerMessage>>>,
    bcast_round: AtomicU64,
}

impl LocalMachine {
    /// Start servicing this machine's mailbox, handing each delivered
    /// message to `handler` on a dedicated thread. The thread exits when
    /// the mesh is dropped.
    pub fn serve<H>(&self, handler: H)
    where
        H: Fn(PeerMessage) + Send + 'static,
    {
        let incoming = self
            .incoming
            .lock()
            .unwrap()
            .take()
            .expect("machine is already serving");
        thread::spawn(move || {
            while let Ok(message) = incoming.recv() {
                handler(message);
            }
        });
    }
}

impl Cluster for LocalMachine {
    fn machine(&self) -> MachineId {
        self.id
    }

    fn num_machines(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn gather(&self, snapshot: Snapshot) -> Option<Vec<Snapshot>> {
        let n = self.num_machines();
        {
            let mut state = self.shared.gather.lock().unwrap();
            // Wait for the previous round's slot to be collected.
            while state.slots[self.id].is_some() {
                state = self.shared.gather_cv.wait(state).unwrap();
            }
            state.slots[self.id] = Some(snapshot);
            state.deposited += 1;
            self.shared.gather_cv.notify_all();
        }
        if self.id != COORDINATOR {
            return None;
        }
        let mut state = self.shared.gather.lock().unwrap();
        while state.deposited < n {
            state = self.shared.gather_cv.wait(state).unwrap();
        }
        let collected = state
            .slots
            .iter_mut()
            .map(|slot| slot.take().expect("deposited slot"))
            .collect();
        state.deposited = 0;
        self.shared.gather_cv.notify_all();
        Some(collected)
    }

    fn broadcast<T: Serialize + DeserializeOwned>(&self, value: Option<T>) -> T {
        let n = self.num_machines();
        let round = self.bcast_round.fetch_add(1, Ordering::SeqCst);
        if self.id == COORDINATOR {
            let value = value.expect("the coordinator must supply the broadcast value");
            let encoded = bincode::serialize(&value).expect("encode broadcast payload");
            let mut state = self.shared.bcast.lock().unwrap();
            // Wait for the previous round to be fully consumed.
            while state.payload.is_some() {
                state = self.shared.bcast_cv.wait(state).unwrap();
            }
            state.payload = Some(encoded);
            state.round = round;
            state.taken = 1;
            if state.taken == n {
                state.payload = None;
            }
            self.shared.bcast_cv.notify_all();
            value
        } else {
            let mut state = self.shared.bcast.lock().unwrap();
            while state.payload.is_none() || state.round != round {
                state = self.shared.bcast_cv.wait(state).unwrap();
            }
            let decoded = bincode::deserialize(state.payload.as_ref().expect("checked above"))
                .expect("decode broadcast payload");
            state.taken += 1;
            if state.taken == n {
                state.payload = None;
            }
            self.shared.bcast_cv.notify_all();
            decoded
        }
    }

    fn remote_call(&self, target: MachineId, message: PeerMessage) {
        self.shared.mailboxes[target]
            .send(message)
            .expect("target machine is gone");
    }
}
