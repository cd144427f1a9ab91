
use evq::Evq;

use std::alloc::Layout;
use std::mem::transmute;
use std::ops::Deref;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

#[test]
fn test_post() {
    let mut buffer = vec![0; 1024*1024];
    let q = Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let count = Mutex::new(0);
    q.call(|| {
        *count.lock().unwrap() += 1
    }).unwrap();
    q.dispatch_ready();

    assert_eq!(*count.lock().unwrap(), 1);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_post_many() {
    let q = Evq::with_size(1024*1024);

    let count = Mutex::new(0);
    for _ in 0..1000 {
        q.call(|| {
            *count.lock().unwrap() += 1
        }).unwrap();
    }
    q.dispatch_ready();

    assert_eq!(*count.lock().unwrap(), 1000);
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_post_order() {
    let q = Evq::with_size(1024*1024);

    let count = Mutex::new(Vec::new());
    for i in 0..1000 {
        let count = &count;
        q.call(move || {
            count.lock().unwrap().push(i)
        }).unwrap();
    }
    q.dispatch_ready();

    assert_eq!(
        count.lock().unwrap().deref(),
        &(0..1000).collect::<Vec<_>>()
    );
    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_post_ids_unique() {
    let q = Evq::with_size(1024*1024);

    let mut ids = std::collections::HashSet::new();
    for _ in 0..1000 {
        let id = q.call(|| {}).unwrap();
        assert!(ids.insert(id));
    }
    q.dispatch_ready();

    // a recycled chunk gets a new generation, never a live id again
    for _ in 0..1000 {
        let id = q.call(|| {}).unwrap();
        assert!(ids.insert(id));
    }
    q.dispatch_ready();

    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_post_raw() {
    static COUNT: AtomicU32 = AtomicU32::new(0);
    fn cb(_: *mut u8) {
        COUNT.fetch_add(1, Ordering::SeqCst);
    }
    fn dtor(_: *mut u8) {
        COUNT.fetch_add(100, Ordering::SeqCst);
    }

    let q = Evq::with_size(4096);

    let layout = Layout::from_size_align(16, 1).unwrap();
    let e = unsafe { q.alloc_raw(layout) };
    assert!(!e.is_null());
    assert!(q.contains_raw(e));

    let id = unsafe { q.post_raw(e, cb, 0, -1, Some(dtor)) };
    assert_ne!(id, 0);

    q.dispatch_ready();
    assert_eq!(COUNT.load(Ordering::SeqCst), 101);

    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_post_null_raw() {
    let q = Evq::with_size(4096);

    fn cb(_: *mut u8) {}
    // posting a failed allocation reports failure as id 0
    let id = unsafe { q.post_raw(std::ptr::null_mut(), cb, 0, -1, None) };
    assert_eq!(id, 0);
}

#[test]
fn test_post_exhaustion() {
    let q = Evq::with_size(1024);

    // an empty closure still costs a record, a small queue fills up
    let mut posted = 0;
    let err = loop {
        match q.call_in(1000, || {}) {
            Ok(_) => posted += 1,
            Err(err) => break err,
        }
        assert!(posted <= 1024/32);
    };
    assert_eq!(err, evq::Error::NoMem);
    assert!(posted > 0);

    // dispatching the backlog frees the records for reposting
    q.dispatch(1100);
    q.call(|| {}).unwrap();
    q.dispatch_ready();

    println!("usage: {:#?}", q.usage());
}

struct DropCounter(Arc<AtomicU32>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_post_dtor_on_dispatch() {
    let drops = Arc::new(AtomicU32::new(0));
    let count = Arc::new(AtomicU32::new(0));

    let q = Evq::with_size(4096);

    let counter = DropCounter(drops.clone());
    let count_ = count.clone();
    q.call(move || {
        let _ = &counter;
        count_.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    q.dispatch_ready();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_post_dtor_on_destroy() {
    let drops = Arc::new(AtomicU32::new(0));
    let count = Arc::new(AtomicU32::new(0));

    let q = Evq::with_size(4096);
    for _ in 0..10 {
        let counter = DropCounter(drops.clone());
        let count_ = count.clone();
        q.call_in(10_000, move || {
            let _ = &counter;
            count_.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
    }

    // never dispatched, the queue still owes every event its dtor
    drop(q);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 10);
}

#[test]
fn test_post_unposted_cleanup() {
    let drops = Arc::new(AtomicU32::new(0));

    let q = Evq::with_size(4096);

    let counter = DropCounter(drops.clone());
    let e = q.alloc(move || {
        let _ = &counter;
    }).unwrap();

    // never posted, dropping the handle reclaims everything
    drop(e);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    println!("usage: {:#?}", q.usage());
}
