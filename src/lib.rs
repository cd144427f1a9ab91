#![cfg_attr(not(feature="std"), no_std)]

#![deny(missing_debug_implementations)]

use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::cmp::Ordering as Cmp;
use core::fmt;
use core::marker::PhantomData;
use core::mem::align_of;
use core::mem::forget;
use core::mem::size_of;
use core::num::NonZeroU32;
use core::ops::Deref;
use core::ops::DerefMut;
use core::ptr;
use core::ptr::drop_in_place;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering;

mod util;
use util::*;
pub use util::utick;
pub use util::itick;
pub use util::Delta;

pub mod traits;
use traits::*;

pub mod sys;
use sys::SysLock;
#[cfg(feature="std")]
use sys::SysClock;


/// Event queue errors
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    NoMem,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMem => write!(f, "Out of memory"),
        }
    }
}

/// Why dispatch returned
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Timeout,
    Break,
}

/// Opaque handle to a posted event, valid until the event is cancelled
/// or finishes its last execution
///
/// Internally this packs the record's generation and its offset in the
/// queue's buffer, so a successful post never returns the raw id 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Id(NonZeroU32);

impl Id {
    pub fn from_raw(raw: u32) -> Option<Id> {
        NonZeroU32::new(raw).map(Id)
    }

    pub fn into_raw(self) -> u32 {
        self.0.get()
    }
}


/// In-buffer pointer, a byte offset into the queue's slab, 0 is null
///
/// While a record is pending these link the deadline-sorted queue,
/// while it is free they link the bucket free lists.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
struct Eptr(u32);

impl fmt::Debug for Eptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // these really need to be in hex to be readable
        write!(f, "Eptr(0x{:x})", self.0)
    }
}

impl Eptr {
    // maximum alignment of internal allocations, this must cover both
    // the record header and whatever pointers the payload may hold
    const ALIGN: usize = {
        let a = align_of::<Erec>();
        let b = align_of::<*const u8>();
        if a > b { a } else { b }
    };

    const fn null() -> Eptr {
        Eptr(0)
    }

    const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Internal event record, prepended to the payload in its chunk
///
/// Most fields are only touched under queuelock once the record is
/// posted, gen/state are atomic so stale-id lookups can probe them
/// from any context.
struct Erec {
    npw2: u8,
    state: AtomicU8,
    gen: AtomicU32,

    target: utick,
    period: itick,

    cb: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,

    next: Eptr,
    sibling: Eptr,
}

impl Erec {
    const FREE: u8 = 0;
    const ALLOCED: u8 = 1;
    const PENDING: u8 = 2;
    const EXECUTING: u8 = 3;

    unsafe fn payload_ptr<T>(&self) -> *const T {
        (self as *const Erec).add(1) as *const T
    }

    unsafe fn payload_mut_ptr<T>(&mut self) -> *mut T {
        (self as *mut Erec).add(1) as *mut T
    }

    fn payload_ref<T>(&self) -> &T {
        unsafe { &*self.payload_ptr() }
    }

    fn payload_mut<T>(&mut self) -> &mut T {
        unsafe { &mut *self.payload_mut_ptr() }
    }

    unsafe fn from_payload_mut<'a, T>(p: *mut T) -> Option<&'a mut Erec> {
        if !p.is_null() {
            Some(&mut *(p as *mut Erec).sub(1))
        } else {
            None
        }
    }
}

// allocator state, guarded by memlock
struct Mem {
    // bucket array bytes at the front of the slab
    front: usize,
    // start of the carved region at the back, [front, back) is virgin
    back: usize,
    // chunks carved or split into existence, they never merge back
    chunks: usize,
    chunk_bytes: usize,
}

// scheduler state, guarded by queuelock
struct Pending {
    head: Eptr,
    #[cfg(feature="std")]
    background: Option<Box<dyn FnMut(Option<Delta>) + Send>>,
}


/// A fixed-buffer event queue
///
/// Events are allocated out of the queue's own buffer, posted with a
/// deadline, and dispatched in deadline order by whatever context calls
/// dispatch. Posting and cancelling never block and may happen
/// concurrently with dispatch from any thread.
pub struct Evq<C: Clock + Sema> {
    slab: &'static [u8],
    npw2: u8,
    #[cfg(feature="std")]
    allocated: Option<(*mut u8, Layout)>,

    memlock: SysLock,
    mem: UnsafeCell<Mem>,

    queuelock: SysLock,
    pending: UnsafeCell<Pending>,

    brk: AtomicBool,

    clock: C,
}

unsafe impl<C: Clock + Sema> Send for Evq<C> {}
unsafe impl<C: Clock + Sema> Sync for Evq<C> {}

impl<C: Clock + Sema> fmt::Debug for Evq<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evq")
            .field("slab", &self.slab.len())
            .field("npw2", &self.npw2)
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(feature="std")]
impl Evq<SysClock> {
    /// Create a queue with a heap-allocated buffer of the given size
    pub fn with_size(size: usize) -> Evq<SysClock> {
        Self::with_clock(size, SysClock::new())
    }

    /// Create a queue backed by a caller-supplied buffer
    pub fn with_buffer(buffer: &'static mut [u8]) -> Result<Evq<SysClock>, Error> {
        Self::with_buffer_and_clock(buffer, SysClock::new())
    }
}

impl<C: Clock + Sema> Evq<C> {
    /// Create a heap-backed queue driven by a custom time source
    #[cfg(feature="std")]
    pub fn with_clock(size: usize, clock: C) -> Evq<C> {
        debug_assert!(size > 0);
        let layout = Layout::from_size_align(size, Eptr::ALIGN).unwrap();
        let buffer = unsafe {
            let p = sys::alloc(layout);
            if p.is_null() {
                sys::handle_alloc_error(layout);
            }
            ptr::write_bytes(p, 0, size);
            core::slice::from_raw_parts(p, size)
        };

        let mut q = Self::from_slab(buffer, clock);
        q.allocated = Some((buffer.as_ptr() as *mut u8, layout));
        q
    }

    /// Create a queue in a caller-supplied buffer with a custom time
    /// source, the buffer is borrowed for the queue's lifetime
    pub fn with_buffer_and_clock(
        buffer: &'static mut [u8],
        clock: C
    ) -> Result<Evq<C>, Error> {
        // align buffer
        let align = alignup(buffer.as_ptr() as usize, Eptr::ALIGN)
            - buffer.as_ptr() as usize;
        let buffer = match buffer.get_mut(align..) {
            // already overflow?
            Some(buffer) => buffer,
            None => return Err(Error::NoMem),
        };

        // zero the buffer, bucket heads and freshly exposed bucket
        // entries rely on virgin memory reading as null
        buffer.fill(0);

        Ok(Self::from_slab(buffer, clock))
    }

    fn from_slab(slab: &'static [u8], clock: C) -> Evq<C> {
        Evq {
            slab,
            npw2: npw2(slab.len()),
            #[cfg(feature="std")]
            allocated: None,

            memlock: SysLock::new(),
            mem: UnsafeCell::new(Mem {
                front: 0,
                back: slab.len(),
                chunks: 0,
                chunk_bytes: 0,
            }),

            queuelock: SysLock::new(),
            pending: UnsafeCell::new(Pending {
                head: Eptr::null(),
                #[cfg(feature="std")]
                background: None,
            }),

            brk: AtomicBool::new(false),

            clock,
        }
    }

    /// The queue's current tick in milliseconds, wraps at 2^32
    pub fn tick(&self) -> utick {
        self.clock.now()
    }

    //// slab internals ////

    // resolve an in-buffer offset, these are only meaningful while the
    // matching lock is held
    unsafe fn erec_mut<'a>(&'a self, ep: Eptr) -> Option<&'a mut Erec> {
        if !ep.is_null() {
            Some(&mut *(self.slab.as_ptr().add(ep.0 as usize) as *mut Erec))
        } else {
            None
        }
    }

    fn eptr_of(&self, e: &Erec) -> Eptr {
        unsafe {
            Eptr(
                (e as *const Erec as *const u8)
                    .offset_from(self.slab.as_ptr())
                    as u32
            )
        }
    }

    fn contains_erec(&self, e: &Erec) -> bool {
        self.slab.as_ptr_range()
            .contains(&(e as *const _ as *const u8))
    }

    // requires memlock
    unsafe fn buckets_ptr(&self) -> *mut Eptr {
        self.slab.as_ptr() as *mut Eptr
    }

    // requires memlock
    unsafe fn bucket_pop<'a>(&'a self, mem: &mut Mem, bucket: u8) -> Option<&'a mut Erec> {
        if (bucket as usize) < mem.front / size_of::<Eptr>() {
            let slot = self.buckets_ptr().add(bucket as usize);
            if let Some(e) = self.erec_mut(*slot) {
                *slot = e.sibling;
                e.sibling = Eptr::null();
                return Some(e);
            }
        }
        None
    }

    // requires memlock, the bucket array always covers the chunk's
    // bucket because front is grown before a chunk of that size can
    // exist
    unsafe fn bucket_push(&self, mem: &mut Mem, e: &mut Erec) {
        debug_assert!((e.npw2 as usize) < mem.front / size_of::<Eptr>());
        let slot = self.buckets_ptr().add(e.npw2 as usize);
        e.sibling = *slot;
        *slot = self.eptr_of(e);
    }

    fn alloc_erec<'a>(&'a self, layout: Layout) -> Result<&'a mut Erec, Error> {
        assert!(layout.align() <= Eptr::ALIGN);

        // smallest power-of-two chunk that fits header + payload
        let bucket = npw2(size_of::<Erec>() + layout.size());

        let _guard = self.memlock.lock();
        let mem = unsafe { &mut *self.mem.get() };

        // first, check the matching bucket, note we don't check larger
        // buckets here, the virgin region is cheaper than fragmenting
        // a big chunk
        if let Some(e) = unsafe { self.bucket_pop(mem, bucket) } {
            debug_assert_eq!(e.npw2, bucket);
            return Ok(self.retarget_erec(e));
        }

        // second, carve a fresh chunk off the back of the virgin
        // region, growing the bucket array at the front as needed
        let new_front = max(
            (bucket as usize + 1)*size_of::<Eptr>(),
            mem.front
        );
        let new_back = aligndown(
            mem.back.saturating_sub(1 << bucket),
            Eptr::ALIGN
        );

        if new_front <= new_back {
            mem.front = new_front;
            mem.back = new_back;
            mem.chunks += 1;
            mem.chunk_bytes += 1 << bucket;

            let e = unsafe {
                let e = self.slab.as_ptr().add(new_back) as *mut Erec;
                e.write(Erec {
                    npw2: bucket,
                    state: AtomicU8::new(Erec::ALLOCED),
                    gen: AtomicU32::new(1),

                    target: 0,
                    period: -1,

                    cb: None,
                    dtor: None,

                    next: Eptr::null(),
                    sibling: Eptr::null(),
                });
                &mut *e
            };
            return Ok(e);
        }

        // third, peel a chunk off a larger bucket, splitting it down
        // and keeping the unused halves on their free lists
        let nbuckets = mem.front / size_of::<Eptr>();
        for larger in bucket as usize + 1 .. nbuckets {
            if let Some(e) = unsafe { self.bucket_pop(mem, larger as u8) } {
                let mut size = e.npw2;
                while size > bucket {
                    size -= 1;
                    let half = unsafe {
                        let off = self.eptr_of(e).0 as usize + (1 << size);
                        let half = self.slab.as_ptr().add(off) as *mut Erec;
                        half.write(Erec {
                            npw2: size,
                            state: AtomicU8::new(Erec::FREE),
                            gen: AtomicU32::new(1),

                            target: 0,
                            period: -1,

                            cb: None,
                            dtor: None,

                            next: Eptr::null(),
                            sibling: Eptr::null(),
                        });
                        &mut *half
                    };
                    unsafe { self.bucket_push(mem, half) };
                    mem.chunks += 1;
                    e.npw2 = size;
                }
                return Ok(self.retarget_erec(e));
            }
        }

        Err(Error::NoMem)
    }

    // reset a chunk's scheduling fields for a new occupancy, the
    // generation is deliberately kept, it was bumped when the chunk
    // was last released
    fn retarget_erec<'a>(&self, e: &'a mut Erec) -> &'a mut Erec {
        e.state.store(Erec::ALLOCED, Ordering::SeqCst);
        e.target = 0;
        e.period = -1;
        e.cb = None;
        e.dtor = None;
        e.next = Eptr::null();
        e.sibling = Eptr::null();
        e
    }

    // requires queuelock or exclusive access, retires the record's id
    // so stale handles stop matching
    fn invalidate_erec(&self, e: &Erec) {
        let gen_bits = 32 - self.npw2 as u32;
        let gen = e.gen.load(Ordering::SeqCst) + 1;
        // generation 0 is reserved, wrap around it
        let gen = if (gen as u64) >= (1u64 << gen_bits) { 1 } else { gen };
        e.gen.store(gen, Ordering::SeqCst);
    }

    // dtor runs exactly once per occupancy, then the chunk goes back
    // to its bucket, the caller must have already invalidated the id
    fn release_erec(&self, e: &mut Erec) {
        if e.state.load(Ordering::SeqCst) == Erec::FREE {
            debug_assert!(false, "double free of event chunk");
            return;
        }

        if let Some(dtor) = e.dtor.take() {
            dtor(unsafe { e.payload_mut_ptr() });
        }
        e.cb = None;

        let _guard = self.memlock.lock();
        let mem = unsafe { &mut *self.mem.get() };
        e.state.store(Erec::FREE, Ordering::SeqCst);
        unsafe { self.bucket_push(mem, e) };
    }

    // invalidate + release for records the scheduler never saw or no
    // longer owns
    fn discard_erec(&self, e: &mut Erec) {
        {
            let _guard = self.queuelock.lock();
            self.invalidate_erec(e);
        }
        self.release_erec(e);
    }

    //// pending-list internals ////

    fn id_of(&self, e: &Erec) -> Id {
        let raw = (e.gen.load(Ordering::SeqCst) << self.npw2) | self.eptr_of(e).0;
        debug_assert!(raw != 0);
        Id(unsafe { NonZeroU32::new_unchecked(raw) })
    }

    // requires queuelock, returns true if e became the new earliest
    // deadline
    unsafe fn enqueue_erec(&self, pending: &mut Pending, e: &mut Erec) -> bool {
        e.state.store(Erec::PENDING, Ordering::SeqCst);
        e.next = Eptr::null();
        e.sibling = Eptr::null();
        let ep = self.eptr_of(e);

        // find our slot, walking the deadline-ordered group heads
        let mut p: *mut Eptr = &mut pending.head;
        while let Some(g) = self.erec_mut(*p) {
            match sdiff(g.target, e.target).cmp(&0) {
                Cmp::Less => {
                    p = &mut g.next;
                }
                Cmp::Equal => {
                    // same deadline, append to the sibling chain so
                    // post order is preserved
                    let mut s: *mut Eptr = &mut g.sibling;
                    while let Some(sib) = self.erec_mut(*s) {
                        s = &mut sib.sibling;
                    }
                    *s = ep;
                    return false;
                }
                Cmp::Greater => break,
            }
        }

        e.next = *p;
        let new_head = core::ptr::eq(p, &pending.head);
        *p = ep;
        new_head
    }

    // requires queuelock, unlinks a pending record, returns true if it
    // was the earliest deadline
    unsafe fn unqueue_erec(&self, pending: &mut Pending, e: &mut Erec) -> bool {
        let ep = self.eptr_of(e);
        let was_head = pending.head == ep;

        let mut p: *mut Eptr = &mut pending.head;
        while let Some(g) = self.erec_mut(*p) {
            if *p == ep {
                // group head, promote the first sibling if any
                if let Some(sib) = self.erec_mut(g.sibling) {
                    sib.next = g.next;
                    *p = g.sibling;
                } else {
                    *p = g.next;
                }
                e.next = Eptr::null();
                e.sibling = Eptr::null();
                return was_head;
            }

            if g.target == e.target {
                // same deadline, it must be in this sibling chain
                let mut s: *mut Eptr = &mut g.sibling;
                while let Some(sib) = self.erec_mut(*s) {
                    if *s == ep {
                        *s = sib.sibling;
                        e.sibling = Eptr::null();
                        return false;
                    }
                    s = &mut sib.sibling;
                }
                debug_assert!(false, "pending event missing from its deadline group");
                return false;
            }

            if sdiff(g.target, e.target) > 0 {
                break;
            }
            p = &mut g.next;
        }

        debug_assert!(false, "pending event missing from pending list");
        false
    }

    // requires queuelock, detaches every record ready at now and
    // returns them as a FIFO chain through next, groups in deadline
    // order, siblings in post order
    unsafe fn dequeue_ready(&self, pending: &mut Pending, now: utick) -> Eptr {
        let mut ready = Eptr::null();
        let mut tail: *mut Eptr = &mut ready;

        while let Some(g) = self.erec_mut(pending.head) {
            if sdiff(g.target, now) > 0 {
                break;
            }
            pending.head = g.next;

            // flatten the group, head first then siblings
            let mut ep = self.eptr_of(g);
            while let Some(e) = self.erec_mut(ep) {
                let sib = e.sibling;
                e.sibling = Eptr::null();
                e.state.store(Erec::EXECUTING, Ordering::SeqCst);

                *tail = ep;
                tail = &mut e.next;
                e.next = Eptr::null();

                ep = sib;
            }
        }

        ready
    }

    // requires queuelock, tells the background hook where the earliest
    // deadline moved, None means the queue went idle
    #[cfg(feature="std")]
    unsafe fn notify_background(&self, pending: &mut Pending, now: utick) {
        if pending.background.is_some() {
            let delta = self.erec_mut(pending.head).map(|g| {
                Delta::new(max(sdiff(g.target, now), 0))
                    .unwrap_or(Delta::zero())
            });
            if let Some(update) = pending.background.as_mut() {
                update(delta);
            }
        }
    }

    #[cfg(not(feature="std"))]
    unsafe fn notify_background(&self, _pending: &mut Pending, _now: utick) {}

    //// posting ////

    // the record must have come from this queue's allocator and not
    // have been posted since
    unsafe fn post_erec(
        &self,
        e: &mut Erec,
        cb: fn(*mut u8),
        delay: utick,
        period: itick,
        dtor: Option<fn(*mut u8)>
    ) -> Id {
        debug_assert!(self.contains_erec(e));
        debug_assert_eq!(
            e.state.load(Ordering::SeqCst), Erec::ALLOCED,
            "event posted twice"
        );

        e.cb = Some(cb);
        e.dtor = dtor;
        e.period = period;

        let guard = self.queuelock.lock();
        let now = self.clock.now();
        e.target = now.wrapping_add(delay);

        let id = self.id_of(e);
        let pending = &mut *self.pending.get();
        let new_head = self.enqueue_erec(pending, e);
        if new_head {
            self.notify_background(pending, now);
        }
        drop(guard);

        if new_head {
            // only a new earliest deadline can move the dispatcher's
            // wakeup
            self.clock.signal();
        }

        id
    }

    //// raw allocation API ////

    /// Allocate an event payload with at least the layout's size, null
    /// if the buffer can't satisfy the request
    ///
    /// The payload is owned by the caller until it is posted or
    /// deallocated.
    pub unsafe fn alloc_raw(&self, layout: Layout) -> *mut u8 {
        match self.alloc_erec(layout) {
            Ok(e) => e.payload_mut_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Release an unposted payload, running its dtor if one was set
    pub unsafe fn dealloc_raw(&self, e: *mut u8) {
        let e = match Erec::from_payload_mut(e) {
            Some(e) => e,
            None => return, // do nothing
        };
        debug_assert!(self.contains_erec(e));
        debug_assert_eq!(
            e.state.load(Ordering::SeqCst), Erec::ALLOCED,
            "dealloc of a posted event"
        );

        self.discard_erec(e);
    }

    /// Does this pointer come from this queue's buffer?
    pub fn contains_raw(&self, e: *mut u8) -> bool {
        match unsafe { Erec::from_payload_mut(e) } {
            Some(e) => self.contains_erec(e),
            None => false,
        }
    }

    /// Post an allocated payload, scheduling cb after delay ms, and
    /// every period ms after that if period is non-negative
    ///
    /// The queue takes ownership of the payload, the dtor (if any)
    /// runs exactly once when the event is released. The raw id is
    /// 0 only if e is null.
    pub unsafe fn post_raw(
        &self,
        e: *mut u8,
        cb: fn(*mut u8),
        delay: utick,
        period: itick,
        dtor: Option<fn(*mut u8)>
    ) -> u32 {
        match Erec::from_payload_mut(e) {
            Some(e) => self.post_erec(e, cb, delay, period, dtor).into_raw(),
            None => 0,
        }
    }

    //// cancellation ////

    /// Cancel a posted event
    ///
    /// Returns true if the event was unqueued before execution, its
    /// dtor has run and its id no longer matches anything. Unknown,
    /// stale, and already-dispatched ids are a no-op. An event already
    /// detached for execution can't be unqueued, but cancelling it
    /// keeps a periodic event from being rescheduled.
    pub fn cancel(&self, id: Id) -> bool {
        let raw = id.into_raw();
        let mask = (1u32 << self.npw2) - 1;
        let off = raw & mask;
        let gen = raw >> self.npw2;

        // ids are opaque, a garbage one must not fault
        if off == 0
            || off as usize % Eptr::ALIGN != 0
            || off as usize + size_of::<Erec>() > self.slab.len()
        {
            return false;
        }

        let guard = self.queuelock.lock();
        let e = match unsafe { self.erec_mut(Eptr(off)) } {
            Some(e) => e,
            None => return false,
        };
        if e.gen.load(Ordering::SeqCst) != gen {
            return false;
        }

        match e.state.load(Ordering::SeqCst) {
            Erec::PENDING => {
                let pending = unsafe { &mut *self.pending.get() };
                let was_head = unsafe { self.unqueue_erec(pending, e) };
                self.invalidate_erec(e);
                e.cb = None;
                e.period = -1;
                if was_head {
                    let now = self.clock.now();
                    unsafe { self.notify_background(pending, now) };
                }
                drop(guard);

                if was_head {
                    // the dispatcher may be sleeping on this deadline
                    self.clock.signal();
                }

                self.release_erec(e);
                true
            }
            Erec::EXECUTING => {
                // too late to unqueue, but clearing cb/period skips a
                // batched callback that hasn't run yet and keeps a
                // periodic event from rearming
                e.cb = None;
                e.period = -1;
                false
            }
            _ => false,
        }
    }

    //// dispatch ////

    /// Dispatch events for ms milliseconds
    ///
    /// A negative timeout dispatches until break_ is called, a zero
    /// timeout runs the currently ready events without blocking.
    /// Callbacks run in the calling context, outside the queue's
    /// critical sections, and may freely post, cancel, or break.
    pub fn dispatch(&self, ms: itick) -> Dispatch {
        let timeout = if ms >= 0 {
            Some(self.clock.now().wrapping_add(ms as utick))
        } else {
            None
        };

        loop {
            // detach everything that's ready, events posted by the
            // callbacks below wait for the next pass
            let now = self.clock.now();
            let mut ready = {
                let _guard = self.queuelock.lock();
                let pending = unsafe { &mut *self.pending.get() };
                let ready = unsafe { self.dequeue_ready(pending, now) };
                if !ready.is_null() {
                    unsafe { self.notify_background(pending, now) };
                }
                ready
            };

            while let Some(e) = unsafe { self.erec_mut(ready) } {
                ready = e.next;
                e.next = Eptr::null();

                // a cancel may have beaten us to this record, re-read
                // the callback under the lock
                let cb = {
                    let _guard = self.queuelock.lock();
                    e.cb
                };
                if let Some(cb) = cb {
                    cb(unsafe { e.payload_mut_ptr() });
                }

                // reschedule periodic events, retire the rest
                let retire = {
                    let _guard = self.queuelock.lock();
                    if e.period >= 0 && e.cb.is_some() {
                        // advance from the scheduled deadline, not from
                        // now, so the cadence stays exact, the id stays
                        // live
                        e.target = e.target.wrapping_add(e.period as utick);
                        let pending = unsafe { &mut *self.pending.get() };
                        let new_head = unsafe { self.enqueue_erec(pending, e) };
                        if new_head {
                            unsafe { self.notify_background(pending, now) };
                        }
                        false
                    } else {
                        self.invalidate_erec(e);
                        true
                    }
                };
                if retire {
                    self.release_erec(e);
                }
            }

            // the break flag is consumed by the dispatch it stops
            if self.brk.swap(false, Ordering::SeqCst) {
                return Dispatch::Break;
            }

            // how long can we sleep?
            let now = self.clock.now();
            let mut horizon = match timeout {
                Some(timeout) => {
                    let remaining = sdiff(timeout, now);
                    if remaining <= 0 {
                        // hand the queue back to the background timer
                        // before leaving, anything still pending needs
                        // a fresh wakeup
                        let _guard = self.queuelock.lock();
                        let pending = unsafe { &mut *self.pending.get() };
                        unsafe { self.notify_background(pending, now) };
                        return Dispatch::Timeout;
                    }
                    Delta::new(remaining)
                }
                None => None,
            };

            {
                let _guard = self.queuelock.lock();
                let pending = unsafe { &mut *self.pending.get() };
                if let Some(g) = unsafe { self.erec_mut(pending.head) } {
                    let until = Delta::new(max(sdiff(g.target, now), 0))
                        .unwrap_or(Delta::zero());
                    horizon = Some(match horizon {
                        Some(horizon) => min(horizon, until),
                        None => until,
                    });
                }
            }

            self.clock.wait(horizon);
        }
    }

    /// Dispatch the currently ready events without blocking
    ///
    /// Equivalent to dispatch(0), and safe to call from restricted
    /// contexts, nothing here waits.
    pub fn dispatch_ready(&self) -> Dispatch {
        self.dispatch(0)
    }

    /// Stop a running dispatch
    ///
    /// If no dispatch is running, the next one returns immediately.
    /// The flag never outlives the dispatch it stops.
    pub fn break_(&self) {
        self.brk.store(true, Ordering::SeqCst);
        self.clock.signal();
    }

    //// background timers and chaining ////

    /// Install or clear the background update hook
    ///
    /// The hook is called with the delta to the earliest deadline
    /// whenever that deadline may have moved, or None when the queue
    /// goes idle, so an external timer can drive dispatch_ready. A
    /// replaced hook is first told None. The hook runs inside the
    /// queue's critical section and must not call back into this
    /// queue.
    #[cfg(feature="std")]
    pub fn background(
        &self,
        update: Option<Box<dyn FnMut(Option<Delta>) + Send>>
    ) {
        let _guard = self.queuelock.lock();
        let pending = unsafe { &mut *self.pending.get() };

        // let the old hook tear down whatever timer it armed
        if let Some(old) = pending.background.as_mut() {
            old(None);
        }
        pending.background = update;

        let now = self.clock.now();
        unsafe { self.notify_background(pending, now) };
    }

    /// Multiplex this queue's wakeups onto another queue
    ///
    /// Whenever this queue needs dispatching at some deadline, a wake
    /// event is posted on target at that deadline whose body runs
    /// dispatch_ready on this queue. None unchains. Chains must be
    /// acyclic, and both queues must outlive the chain, hence the
    /// static lifetimes.
    #[cfg(feature="std")]
    pub fn chain(&'static self, target: Option<&'static Evq<C>>) {
        match target {
            Some(target) => {
                // one outstanding wake event at a time
                let mut wake: Option<Id> = None;
                self.background(Some(Box::new(move |delta| {
                    if let Some(id) = wake.take() {
                        target.cancel(id);
                    }
                    if let Some(delta) = delta {
                        wake = target.call_in(delta.uticks(), move || {
                            self.dispatch_ready();
                        }).ok();
                    }
                })));
            }
            None => {
                self.background(None);
            }
        }
    }
}

impl<C: Clock + Sema> Drop for Evq<C> {
    fn drop(&mut self) {
        // release every record still pending, dtors run exactly once
        let mut head = self.pending.get_mut().head;
        while let Some(g) = unsafe { self.erec_mut(head) } {
            head = g.next;

            let mut ep = self.eptr_of(g);
            while let Some(e) = unsafe { self.erec_mut(ep) } {
                ep = e.sibling;
                self.invalidate_erec(e);
                self.release_erec(e);
            }
        }

        #[cfg(feature="std")]
        if let Some((p, layout)) = self.allocated.take() {
            unsafe { sys::dealloc(p, layout) };
        }
    }
}


/// Handle to an allocated but not yet posted event
///
/// Derefs to the stored callback so its captures can be tweaked in
/// place, cleans up the payload and chunk if dropped unposted.
pub struct Event<'a, T, C: Clock + Sema> {
    q: &'a Evq<C>,
    e: &'a mut Erec,
    _phantom: PhantomData<T>,
}

impl<T, C: Clock + Sema> fmt::Debug for Event<'_, T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("eptr", &self.q.eptr_of(self.e))
            .finish()
    }
}

impl<C: Clock + Sema> Evq<C> {
    /// Allocate an event around a callback, to be configured and
    /// posted
    pub fn alloc<'a, F: Post + Send>(
        &'a self,
        cb: F
    ) -> Result<Event<'a, F, C>, Error> {
        let e = self.alloc_erec(Layout::new::<F>())?;
        unsafe { e.payload_mut_ptr::<F>().write(cb); }
        Ok(Event {
            q: self,
            e,
            _phantom: PhantomData,
        })
    }

    /// Post a callback for immediate dispatch
    pub fn call<F: Post + Send>(&self, cb: F) -> Result<Id, Error> {
        Ok(self.alloc(cb)?.post())
    }

    /// Post a callback to run after delay ms
    pub fn call_in<F: Post + Send>(
        &self,
        delay: utick,
        cb: F
    ) -> Result<Id, Error> {
        Ok(self.alloc(cb)?.delay(delay).post())
    }

    /// Post a callback to run every period ms
    pub fn call_every<F: Post + Send>(
        &self,
        period: utick,
        cb: F
    ) -> Result<Id, Error> {
        Ok(self.alloc(cb)?.delay(period).period(period).post())
    }
}

impl<'a, T, C: Clock + Sema> Event<'a, T, C> {
    /// Delay before the event first runs, in ms
    pub fn delay(mut self, delay: utick) -> Self {
        // staged relative until post stamps the absolute deadline
        self.e.target = delay;
        self
    }

    /// Rerun the event every period ms after its deadline
    pub fn period(mut self, period: utick) -> Self {
        self.e.period = period as itick;
        self
    }
}

impl<'a, T: Post + Send, C: Clock + Sema> Event<'a, T, C> {
    /// Hand the event to the queue, scheduling it
    pub fn post(mut self) -> Id {
        // cb/drop thunks
        fn cb_thunk<T: Post>(e: *mut u8) {
            unsafe { &mut *(e as *mut T) }.post();
        }

        fn drop_thunk<T>(e: *mut u8) {
            unsafe { drop_in_place(e as *mut T) };
        }

        let q = self.q;
        let e: *mut Erec = &mut *self.e;
        // the queue owns the record from here on
        forget(self);

        unsafe {
            let delay = (*e).target;
            let period = (*e).period;
            q.post_erec(
                &mut *e,
                cb_thunk::<T>,
                delay,
                period,
                Some(drop_thunk::<T>)
            )
        }
    }
}

impl<T, C: Clock + Sema> Drop for Event<'_, T, C> {
    fn drop(&mut self) {
        // make sure we clean up if the event isn't dispatched
        unsafe { drop_in_place(self.e.payload_mut_ptr::<T>()) };
        self.q.discard_erec(self.e);
    }
}

impl<T, C: Clock + Sema> Deref for Event<'_, T, C> {
    type Target = T;
    fn deref(&self) -> &T {
        self.e.payload_ref()
    }
}

impl<T, C: Clock + Sema> DerefMut for Event<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        self.e.payload_mut()
    }
}

impl<T, C: Clock + Sema> AsRef<T> for Event<'_, T, C> {
    fn as_ref(&self) -> &T {
        self.e.payload_ref()
    }
}

impl<T, C: Clock + Sema> AsMut<T> for Event<'_, T, C> {
    fn as_mut(&mut self) -> &mut T {
        self.e.payload_mut()
    }
}


/// A snapshot of the queue's memory state
#[derive(Debug, Copy, Clone)]
pub struct Usage {
    pub pending: usize,
    pub pending_bytes: usize,
    pub alloced: usize,
    pub alloced_bytes: usize,
    pub free: usize,
    pub free_bytes: usize,
    pub slab_total: usize,
    pub slab_unused: usize,
    pub buckets: usize,
}

impl<C: Clock + Sema> Evq<C> {
    pub fn usage(&self) -> Usage {
        let (pending, pending_bytes) = {
            let _guard = self.queuelock.lock();
            let state = unsafe { &mut *self.pending.get() };

            let mut count = 0;
            let mut bytes = 0;
            let mut head = state.head;
            while let Some(g) = unsafe { self.erec_mut(head) } {
                head = g.next;
                let mut ep = self.eptr_of(g);
                while let Some(e) = unsafe { self.erec_mut(ep) } {
                    ep = e.sibling;
                    count += 1;
                    bytes += 1 << e.npw2;
                }
            }
            (count, bytes)
        };

        let _guard = self.memlock.lock();
        let mem = unsafe { &mut *self.mem.get() };

        let mut free = 0;
        let mut free_bytes = 0;
        for bucket in 0..mem.front / size_of::<Eptr>() {
            let mut ep = unsafe { *self.buckets_ptr().add(bucket) };
            while let Some(e) = unsafe { self.erec_mut(ep) } {
                ep = e.sibling;
                free += 1;
                free_bytes += 1 << e.npw2;
            }
        }

        Usage {
            pending,
            pending_bytes,
            alloced: mem.chunks.saturating_sub(free + pending),
            alloced_bytes: mem.chunk_bytes.saturating_sub(free_bytes + pending_bytes),
            free,
            free_bytes,
            slab_total: self.slab.len(),
            slab_unused: mem.back - mem.front,
            buckets: mem.front / size_of::<Eptr>(),
        }
    }

    /// Fill in the number of free chunks in each bucket
    pub fn bucket_usage(&self, buckets: &mut [usize]) {
        let _guard = self.memlock.lock();
        let mem = unsafe { &mut *self.mem.get() };

        let nbuckets = mem.front / size_of::<Eptr>();
        for (bucket, count) in buckets.iter_mut().enumerate().take(nbuckets) {
            let mut n = 0;
            let mut ep = unsafe { *self.buckets_ptr().add(bucket) };
            while let Some(e) = unsafe { self.erec_mut(ep) } {
                ep = e.sibling;
                n += 1;
            }
            *count = n;
        }
    }
}
