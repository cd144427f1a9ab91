
// sys.rs provides the host implementations of the platform primitives,
// std where available, with a spinlock fallback for no_std builds
//

use core::mem::transmute;

use cfg_if::cfg_if;

#[cfg(feature="std")] use std::time::Instant;
#[cfg(feature="std")] use std::time::Duration;
#[cfg(feature="std")] use std::sync::Mutex;
#[cfg(feature="std")] use std::sync::MutexGuard;
#[cfg(feature="std")] use std::sync::Condvar;

use crate::traits::*;
use crate::Delta;
use crate::util::utick;


// Memory allocation, only used by the owned-buffer constructor
#[cfg(feature="std")] pub(crate) use std::alloc::alloc;
#[cfg(feature="std")] pub(crate) use std::alloc::dealloc;
#[cfg(feature="std")] pub(crate) use std::alloc::handle_alloc_error;


// Locking primitive
cfg_if! {
    if #[cfg(feature="std")] {
        #[derive(Debug)]
        pub struct SysLock(Mutex<()>);

        impl SysLock {
            pub(crate) fn new() -> Self {
                SysLock(Mutex::new(()))
            }
        }

        impl Lock for SysLock {
            // unfortunately we can't define types with lifetimes
            // in traits, the best we can do is unsafely strip the
            // lifetime and leave it up to the caller to drop the
            // types in the correct order
            type Guard = MutexGuard<'static, ()>;

            fn lock(&self) -> Self::Guard {
                // strip lifetime
                let guard = self.0.lock().unwrap();
                unsafe { transmute::<MutexGuard<'_, ()>, _>(guard) }
            }
        }
    } else {
        // spinlock implementation, which is _terrible_ for multi-core,
        // but at least compiles in no-std and is acceptable for
        // single-thread use cases (no contention, and really no need
        // for synchronization)
        use core::sync::atomic::AtomicBool;
        use core::sync::atomic::Ordering;

        #[derive(Debug)]
        pub struct SysLock(AtomicBool);

        impl SysLock {
            pub(crate) fn new() -> Self {
                SysLock(AtomicBool::new(false))
            }
        }

        #[derive(Debug)]
        pub struct SysLockGuard<'a>(&'a SysLock);

        impl Drop for SysLockGuard<'_> {
            fn drop(&mut self) {
                (self.0).0.store(false, Ordering::Release);
            }
        }

        impl Lock for SysLock {
            // unfortunately we can't define types with lifetimes
            // in traits, the best we can do is unsafely strip the
            // lifetime and leave it up to the caller to drop the
            // types in the correct order
            type Guard = SysLockGuard<'static>;

            fn lock(&self) -> Self::Guard {
                while self.0.compare_exchange(
                    false, true,
                    Ordering::Acquire, Ordering::Relaxed
                ).is_err() {}

                // strip lifetime
                let guard = SysLockGuard(self);
                unsafe { transmute::<SysLockGuard<'_>, _>(guard) }
            }
        }
    }
}


// Time/semaphore primitive
#[cfg(feature="std")]
#[derive(Debug)]
pub struct SysClock {
    instant: Instant,

    flag: Mutex<bool>,
    cond: Condvar,
}

#[cfg(feature="std")]
impl SysClock {
    pub fn new() -> Self {
        Self {
            instant: Instant::now(),

            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

#[cfg(feature="std")]
impl Default for SysClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature="std")]
impl Clock for SysClock {
    fn now(&self) -> utick {
        // truncating to u32 gives us exactly the mod-2^32 tick we want
        self.instant
            .elapsed()
            .as_millis()
            as utick
    }
}

#[cfg(feature="std")]
impl Signal for SysClock {
    fn signal(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        drop(flag);

        self.cond.notify_one();
    }
}

#[cfg(feature="std")]
impl Sema for SysClock {
    fn wait(&self, timeout: Option<Delta>) {
        let mut flag = self.flag.lock().unwrap();
        if !*flag {
            // a single wait is enough, spurious wakeups are allowed
            // by the contract and the dispatcher recomputes its
            // horizon anyway
            flag = match timeout {
                Some(delta) => {
                    self.cond
                        .wait_timeout(
                            flag,
                            Duration::from_millis(delta.uticks() as u64)
                        )
                        .unwrap()
                        .0
                }
                None => self.cond.wait(flag).unwrap(),
            };
        }

        // consume the signal
        *flag = false;
    }
}
