//! Bounded-wait rendezvous between the sender and receiver roles.
//!
//! The receiver advances its counter and signals before it blocks on the
//! socket; the sender only proceeds once `receive > send`, so sends and
//! receives alternate strictly and the sender is never more than one
//! iteration ahead of the receiver's bookkeeping.

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousTimeout {
    pub send_iteration: u64,
    pub receive_iteration: u64,
}

impl fmt::Display for RendezvousTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timed out waiting for receiver to be ready (send iteration {}, receive iteration {})",
            self.send_iteration, self.receive_iteration
        )
    }
}

impl std::error::Error for RendezvousTimeout {}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    send: u64,
    receive: u64,
}

#[derive(Default)]
pub struct IterationGate {
    counters: Mutex<Counters>,
    receiver_ready: Condvar,
}

impl IterationGate {
    pub fn new() -> Self {
        IterationGate::default()
    }

    /// Sender side: block until the receiver has advanced past the sender's
    /// iteration, up to `timeout`. A timeout means the two roles have
    /// desynchronized and the run cannot be reconciled.
    pub fn wait_for_receiver(&self, timeout: Duration) -> Result<(), RendezvousTimeout> {
        let counters = self.counters.lock().unwrap();
        let (counters, wait_result) = self
            .receiver_ready
            .wait_timeout_while(counters, timeout, |counters| {
                counters.receive <= counters.send
            })
            .unwrap();
        if wait_result.timed_out() && counters.receive <= counters.send {
            return Err(RendezvousTimeout {
                send_iteration: counters.send,
                receive_iteration: counters.receive,
            });
        }
        Ok(())
    }

    /// Sender side: record a completed transmit.
    pub fn advance_sender(&self) {
        self.counters.lock().unwrap().send += 1;
    }

    /// Receiver side: advance and wake a waiting sender. Called before the
    /// receiver blocks on its own I/O so both roles block concurrently.
    /// Returns the new receive iteration.
    pub fn advance_receiver(&self) -> u64 {
        let iteration = {
            let mut counters = self.counters.lock().unwrap();
            counters.receive += 1;
            counters.receive
        };
        self.receiver_ready.notify_all();
        iteration
    }
}
