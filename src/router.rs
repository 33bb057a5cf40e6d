// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The per-type publish/subscribe broker.
//!
//! One `Router` exists per message type, created lazily on first
//! [`broker_for`] and kept for the rest of the process, in a static map keyed
//! by type id.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crate::message::Message;

/// Something that wants to see every message published on a router.
///
/// `on_message` returns `true` once it has consumed the message, `false` to
/// be retried after every other currently-pending listener has had a turn.
/// Implementors must not block on anything the router itself could be
/// holding: listeners run with no router lock held, but a slow listener
/// still delays every other message behind it in the queue.
pub trait Listener: Send + Sync {
    fn on_message(&self, msg: &Message) -> bool;
}

struct Inner {
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    exclusive: Mutex<Option<Arc<dyn Listener>>>,
    queue: Mutex<VecDeque<Message>>,
    queue_not_empty: Condvar,
    synchronous: AtomicBool,
    continuous: AtomicBool,
    delivery_running: AtomicBool,
}

/// The broker for one message type.
pub struct Router {
    inner: Arc<Inner>,
}

fn registry() -> &'static Mutex<HashMap<u16, Router>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u16, Router>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the router for `type_id`, creating it on first use.
pub fn broker_for(type_id: u16) -> Router {
    let mut map = registry().lock().unwrap();
    map.entry(type_id).or_insert_with(Router::new).clone()
}

impl Clone for Router {
    fn clone(&self) -> Router {
        Router { inner: self.inner.clone() }
    }
}

impl Router {
    fn new() -> Router {
        Router {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Vec::new()),
                exclusive: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                queue_not_empty: Condvar::new(),
                synchronous: AtomicBool::new(false),
                continuous: AtomicBool::new(false),
                delivery_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.inner.listeners.lock().unwrap().push(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn Listener>) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Grants `listener` exclusive delivery; fails if another listener
    /// already holds it.
    pub fn request_exclusive(&self, listener: Arc<dyn Listener>) -> bool {
        let mut exclusive = self.inner.exclusive.lock().unwrap();
        if exclusive.is_some() {
            return false;
        }
        *exclusive = Some(listener);
        true
    }

    pub fn discard_exclusive(&self, listener: &Arc<dyn Listener>) -> bool {
        let mut exclusive = self.inner.exclusive.lock().unwrap();
        match exclusive.as_ref() {
            Some(current) if Arc::ptr_eq(current, listener) => {
                *exclusive = None;
                true
            }
            _ => false,
        }
    }

    pub fn enable_continuous(&self) {
        self.inner.continuous.store(true, Ordering::SeqCst);
    }

    pub fn disable_continuous(&self) {
        self.inner.continuous.store(false, Ordering::SeqCst);
    }

    pub fn enable_synchronous(&self) {
        self.inner.synchronous.store(true, Ordering::SeqCst);
    }

    pub fn disable_synchronous(&self) {
        self.inner.synchronous.store(false, Ordering::SeqCst);
    }

    /// Publishes `message`. Synchronous routers deliver inline before this
    /// call returns; asynchronous routers enqueue and (if needed) start the
    /// delivery thread.
    pub fn publish(&self, message: Message) {
        if self.inner.synchronous.load(Ordering::SeqCst) {
            deliver_one(&self.inner, message);
            return;
        }

        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push_back(message);
            self.inner.queue_not_empty.notify_one();
        }

        self.ensure_delivery_thread();
    }

    fn ensure_delivery_thread(&self) {
        if self
            .inner
            .delivery_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = self.inner.clone();
        thread::spawn(move || run_delivery_loop(inner));
    }
}

/// Runs until the queue drains, unless continuous mode keeps it alive to
/// wait for more work.
fn run_delivery_loop(inner: Arc<Inner>) {
    loop {
        let message = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(msg) = queue.pop_front() {
                    break Some(msg);
                }

                if !inner.continuous.load(Ordering::SeqCst) {
                    break None;
                }

                // Continuous mode: the thread survives an empty queue and
                // waits to be woken by the next publish instead of exiting.
                let (guard, timeout) = inner
                    .queue_not_empty
                    .wait_timeout(queue, std::time::Duration::from_millis(200))
                    .unwrap();
                queue = guard;
                let _ = timeout;
            }
        };

        match message {
            Some(msg) => deliver_one(&inner, msg),
            None => break,
        }
    }

    inner.delivery_running.store(false, Ordering::SeqCst);

    // A publish may have raced the exit check above and found the thread
    // still marked running; make sure its message doesn't get stranded.
    let has_pending = !inner.queue.lock().unwrap().is_empty();
    if has_pending
        && inner
            .delivery_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    {
        run_delivery_loop(inner);
    }
}

fn deliver_one(inner: &Inner, message: Message) {
    if let Some(exclusive) = inner.exclusive.lock().unwrap().clone() {
        loop {
            match invoke(&exclusive, &message) {
                Ok(true) => break,
                Ok(false) => continue,
                Err(()) => {
                    warn!("listener panicked while exclusively handling message, dropping it");
                    break;
                }
            }
        }
        return;
    }

    let mut pending: Vec<Arc<dyn Listener>> = inner.listeners.lock().unwrap().clone();

    while !pending.is_empty() {
        let mut deferred = Vec::new();

        for listener in pending.drain(..) {
            match invoke(&listener, &message) {
                Ok(true) => {}
                Ok(false) => deferred.push(listener),
                Err(()) => {
                    warn!("listener panicked while handling message type {}, dropping message", message.type_id());
                    return;
                }
            }
        }

        pending = deferred;
    }
}

fn invoke(listener: &Arc<dyn Listener>, message: &Message) -> Result<bool, ()> {
    panic::catch_unwind(AssertUnwindSafe(|| listener.on_message(message))).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Transport;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingListener {
        hits: AtomicUsize,
    }

    impl Listener for CountingListener {
        fn on_message(&self, _msg: &Message) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn sample_message(type_id: u16) -> Message {
        Message::new(type_id, vec![1, 2, 3], Transport::LocalOnly)
    }

    #[test]
    fn fan_out_to_all_listeners_exactly_once() {
        let router = broker_for(100);
        router.enable_synchronous();

        let l1 = Arc::new(CountingListener { hits: AtomicUsize::new(0) });
        let l2 = Arc::new(CountingListener { hits: AtomicUsize::new(0) });

        router.register_listener(l1.clone());
        router.register_listener(l2.clone());

        router.publish(sample_message(100));

        assert_eq!(1, l1.hits.load(Ordering::SeqCst));
        assert_eq!(1, l2.hits.load(Ordering::SeqCst));
    }

    struct DeferTwice {
        remaining: Mutex<u32>,
        hits: AtomicUsize,
    }

    impl Listener for DeferTwice {
        fn on_message(&self, _msg: &Message) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining == 0 {
                true
            } else {
                *remaining -= 1;
                false
            }
        }
    }

    #[test]
    fn deferral_does_not_cause_other_listeners_to_see_the_message_twice() {
        let router = broker_for(101);
        router.enable_synchronous();

        let deferring = Arc::new(DeferTwice { remaining: Mutex::new(1), hits: AtomicUsize::new(0) });
        let plain = Arc::new(CountingListener { hits: AtomicUsize::new(0) });

        router.register_listener(deferring.clone());
        router.register_listener(plain.clone());

        router.publish(sample_message(101));

        assert_eq!(2, deferring.hits.load(Ordering::SeqCst));
        assert_eq!(1, plain.hits.load(Ordering::SeqCst));
    }

    #[test]
    fn exclusive_listener_blocks_everyone_else() {
        let router = broker_for(102);
        router.enable_synchronous();

        let exclusive = Arc::new(DeferTwice { remaining: Mutex::new(3), hits: AtomicUsize::new(0) });
        let other = Arc::new(CountingListener { hits: AtomicUsize::new(0) });

        router.register_listener(other.clone());
        assert!(router.request_exclusive(exclusive.clone() as Arc<dyn Listener>));
        assert!(!router.request_exclusive(other.clone() as Arc<dyn Listener>));

        router.publish(sample_message(102));

        assert_eq!(4, exclusive.hits.load(Ordering::SeqCst));
        assert_eq!(0, other.hits.load(Ordering::SeqCst));
    }

    #[test]
    fn asynchronous_publish_eventually_delivers() {
        let router = broker_for(103);

        let listener = Arc::new(CountingListener { hits: AtomicUsize::new(0) });
        router.register_listener(listener.clone());

        router.publish(sample_message(103));

        let mut waited = Duration::from_millis(0);
        while listener.hits.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }

        assert_eq!(1, listener.hits.load(Ordering::SeqCst));
    }
}
