
use core::fmt::Debug;

use crate::Delta;
use crate::util::utick;


//// post traits ////

/// Post trait, the callable side of an event
pub trait Post {
    fn post(&mut self);
}

impl<F: FnMut()> Post for F {
    fn post(&mut self) {
        self()
    }
}


//// system level traits ////

/// Some way to get the time, a monotonic millisecond counter that
/// wraps at 2^32
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> utick;
}

/// Locking primitive, mutual exclusion against every context that
/// touches the queue, reentrant use not required
pub trait Lock: Send + Sync + Debug {
    type Guard;
    fn lock(&self) -> Self::Guard;
}

/// Common signal trait, split out so producers only need the
/// non-blocking half of the semaphore
pub trait Signal: Send + Sync + Debug {
    fn signal(&self);
}

/// Binary semaphore, aka a waiting/signalling primitive
///
/// wait returns on signal, on timeout, or immediately if a signal is
/// already pending, consuming it; None waits indefinitely
pub trait Sema: Signal {
    fn wait(&self, timeout: Option<Delta>);
}
