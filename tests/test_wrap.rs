
use evq::traits::Clock;
use evq::traits::Sema;
use evq::traits::Signal;
use evq::Delta;
use evq::Dispatch;
use evq::Evq;

use std::ops::Deref;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// A real clock with an offset base, so tests can start the tick
/// anywhere, including just short of the 2^32 wrap
#[derive(Debug)]
struct WrapClock {
    base: u32,
    instant: Instant,

    flag: Mutex<bool>,
    cond: Condvar,
}

impl WrapClock {
    fn new(base: u32) -> Self {
        Self {
            base,
            instant: Instant::now(),

            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

impl Clock for WrapClock {
    fn now(&self) -> u32 {
        self.base.wrapping_add(self.instant.elapsed().as_millis() as u32)
    }
}

impl Signal for WrapClock {
    fn signal(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        drop(flag);

        self.cond.notify_one();
    }
}

impl Sema for WrapClock {
    fn wait(&self, timeout: Option<Delta>) {
        let mut flag = self.flag.lock().unwrap();
        if !*flag {
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
        *flag = false;
    }
}

#[test]
fn test_wrap_around() {
    // the tick wraps 50ms into the test
    let q = Evq::with_clock(4096, WrapClock::new(u32::MAX - 50));

    let count = AtomicU32::new(0);
    q.call_in(100, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    // not ready on the near side of the wrap
    assert_eq!(q.dispatch(50), Dispatch::Timeout);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // fires about 100ms after the post, on the far side
    assert_eq!(q.dispatch(100), Dispatch::Timeout);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    println!("usage: {:#?}", q.usage());
}

#[test]
fn test_wrap_ordering() {
    let q = Evq::with_clock(4096, WrapClock::new(u32::MAX - 50));

    // both deadlines straddle the wrap, order must still hold
    let order = Mutex::new(Vec::new());
    let order_ = &order;
    q.call_in(100, move || order_.lock().unwrap().push('b')).unwrap();
    q.call_in(10, move || order_.lock().unwrap().push('a')).unwrap();
    q.call_in(150, move || order_.lock().unwrap().push('c')).unwrap();

    q.dispatch(250);
    assert_eq!(order.lock().unwrap().deref(), &vec!['a', 'b', 'c']);
}

#[test]
fn test_wrap_cancel() {
    let q = Evq::with_clock(4096, WrapClock::new(u32::MAX - 20));

    let count = AtomicU32::new(0);
    let id = q.call_in(100, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    // cancelling across the wrap boundary still matches the id
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(q.cancel(id), true);

    q.dispatch(150);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wrap_periodic() {
    let q = Evq::with_clock(4096, WrapClock::new(u32::MAX - 100));

    let count = AtomicU32::new(0);
    q.call_every(50, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    // cadence holds while the deadline arithmetic wraps
    q.dispatch(330);
    let fired = count.load(Ordering::SeqCst);
    assert!(fired >= 5 && fired <= 7, "fired {} times", fired);
}
