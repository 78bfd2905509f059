#[cfg(test)]
mod tests {
    use deferred_promise::{
        BlockingIter, Cancellable, Cause, Demand, Error, Publisher, Runtime, Subscriber,
        Subscription,
    };
    use futures::executor::ThreadPool;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};
    use std::{thread, time::Duration};

    /// Emits `0..total` on a single worker thread, never beyond granted demand.
    struct CountingProducer {
        total: u32,
        fail_at: Option<u32>,
        pool: ThreadPool,
        cancels: Arc<AtomicUsize>,
        emitted: Arc<AtomicU32>,
    }

    impl CountingProducer {
        fn new(total: u32) -> Self {
            CountingProducer {
                total,
                fail_at: None,
                pool: ThreadPool::builder().pool_size(1).create().unwrap(),
                cancels: Arc::default(),
                emitted: Arc::default(),
            }
        }
    }

    struct Emission {
        me: Weak<Emission>,
        subscriber: Arc<dyn Subscriber<u32>>,
        demand: Demand,
        next: AtomicU32,
        total: u32,
        fail_at: Option<u32>,
        finished: AtomicBool,
        cancelled: AtomicBool,
        pool: ThreadPool,
        cancels: Arc<AtomicUsize>,
        emitted: Arc<AtomicU32>,
    }

    impl Emission {
        fn emit(&self) {
            loop {
                if self.cancelled.load(Ordering::SeqCst) || self.finished.load(Ordering::SeqCst) {
                    return;
                }
                let i = self.next.load(Ordering::SeqCst);
                if Some(i) == self.fail_at {
                    self.finished.store(true, Ordering::SeqCst);
                    self.subscriber.on_error(Cause::msg(format!("failed at {i}")));
                    return;
                }
                if i == self.total {
                    self.finished.store(true, Ordering::SeqCst);
                    self.subscriber.on_complete();
                    return;
                }
                if !self.demand.try_consume() {
                    return;
                }
                self.next.store(i + 1, Ordering::SeqCst);
                self.emitted.fetch_add(1, Ordering::SeqCst);
                self.subscriber.on_next(i);
            }
        }
    }

    impl Subscription for Emission {
        fn request(&self, n: u64) {
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            self.demand.grant(n);
            if let Some(me) = self.me.upgrade() {
                self.pool.spawn_ok(async move { me.emit() });
            }
        }

        fn cancel(&self) {
            if !self.cancelled.swap(true, Ordering::SeqCst) {
                self.cancels.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl Publisher<u32> for CountingProducer {
        fn subscribe(&self, subscriber: Arc<dyn Subscriber<u32>>) {
            let emission = Arc::new_cyclic(|me| Emission {
                me: me.clone(),
                subscriber: subscriber.clone(),
                demand: Demand::new(),
                next: AtomicU32::new(0),
                total: self.total,
                fail_at: self.fail_at,
                finished: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                pool: self.pool.clone(),
                cancels: self.cancels.clone(),
                emitted: self.emitted.clone(),
            });
            subscriber.on_subscribe(emission);
        }
    }

    /// Hands out a subscription and then never emits anything.
    struct SilentProducer;

    struct Ignored;

    impl Subscription for Ignored {
        fn request(&self, _: u64) {}
        fn cancel(&self) {}
    }

    impl Publisher<u32> for SilentProducer {
        fn subscribe(&self, subscriber: Arc<dyn Subscriber<u32>>) {
            subscriber.on_subscribe(Arc::new(Ignored));
        }
    }

    #[test]
    fn test_pulls_all_fifty_in_order() {
        let producer = CountingProducer::new(50);
        let iter = BlockingIter::new(&producer);
        let items: Vec<u32> = iter.map(Result::unwrap).collect();
        assert_eq!(items, (0..50).collect::<Vec<_>>());
        assert_eq!(producer.emitted.load(Ordering::SeqCst), 50);
        assert_eq!(producer.cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_after_twenty_five_cancels_once() {
        let producer = CountingProducer::new(50);
        let iter = BlockingIter::new(&producer);
        for expected in 0..25 {
            assert_eq!(iter.next_element().unwrap(), expected);
        }
        iter.close();
        iter.close();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(producer.cancels.load(Ordering::SeqCst), 1);
        assert!(producer.emitted.load(Ordering::SeqCst) <= 25);
        assert!(!iter.has_next().unwrap());
        assert!(matches!(iter.next_element(), Err(Error::Closed)));
        drop(iter);
        assert_eq!(producer.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_one_request_per_fetch() {
        let producer = CountingProducer::new(50);
        let iter = BlockingIter::new(&producer);
        assert_eq!(iter.next_element().unwrap(), 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(producer.emitted.load(Ordering::SeqCst), 1);
        assert!(iter.has_next().unwrap());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(producer.emitted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_preload_requests_a_batch() {
        let producer = CountingProducer::new(50);
        let iter = BlockingIter::new(&producer);
        iter.preload(10);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while producer.emitted.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        for expected in 0..10 {
            assert_eq!(iter.next_element().unwrap(), expected);
        }
        assert_eq!(producer.emitted.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_producer_error_is_sticky() {
        let mut producer = CountingProducer::new(50);
        producer.fail_at = Some(3);
        let iter = BlockingIter::new(&producer);
        for expected in 0..3 {
            assert_eq!(iter.next_element().unwrap(), expected);
        }
        for _ in 0..3 {
            match iter.has_next() {
                Err(Error::Rejected(cause)) => assert_eq!(cause.to_string(), "failed at 3"),
                other => panic!("expected rejection, got {other:?}"),
            }
        }
        assert!(Cancellable::cancel(&iter));
        assert!(!iter.has_next().unwrap());
    }

    #[test]
    fn test_close_from_another_thread_releases_fetch() {
        let iter = Arc::new(BlockingIter::new(&SilentProducer));
        let fetcher = {
            let iter = iter.clone();
            thread::spawn(move || iter.next_element())
        };
        thread::sleep(Duration::from_millis(50));
        iter.close();
        assert!(matches!(fetcher.join().unwrap(), Err(Error::Closed)));
    }

    #[test]
    fn test_bridge_over_sequence_produced_elsewhere() {
        let runtime = Runtime::new();
        let seq = runtime.spawn_seq(|seq| {
            for i in 0..20 {
                thread::sleep(Duration::from_millis(1));
                seq.next(i)?;
            }
            Ok(())
        });
        let collected: Result<Vec<_>, _> = seq.iter().collect();
        assert_eq!(collected.unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(seq.count().unwrap(), 20);
    }
}
