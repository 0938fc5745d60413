//! Contracts of the atomic slot types, on both the lock-free word path
//! (`AtomicStrong`) and the mutex-table fallback (`AtomicWide`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tether_mem::{AtomicStrong, AtomicWide, Shared, Strong};

struct SyncProbe(Arc<AtomicUsize>);

impl Drop for SyncProbe {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn probe() -> (Strong<SyncProbe, Shared>, Arc<AtomicUsize>) {
    let destroyed = Arc::new(AtomicUsize::new(0));
    (Strong::new(SyncProbe(destroyed.clone())), destroyed)
}

// =============================================================================
// Store vs exchange release discipline
// =============================================================================

mod release_discipline {
    use super::*;

    /// `store(None)` releases the previous occupant (destructor observed);
    /// `exchange(None)` instead hands it back alive.
    #[test]
    fn store_releases_exchange_transfers() {
        let (handle, destroyed) = probe();
        let slot = AtomicStrong::new(Some(handle));

        let survivor = slot.exchange(None, Ordering::SeqCst).unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(Strong::strong_count(&survivor), 1);

        slot.store(Some(survivor), Ordering::SeqCst);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        slot.store(None, Ordering::SeqCst);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(slot.load(Ordering::SeqCst).is_none());
    }

    #[test]
    fn wide_store_releases_exchange_transfers() {
        let (handle, destroyed) = probe();
        let slot = AtomicWide::new(Some(handle));

        let survivor = slot.exchange(None, Ordering::SeqCst).unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        slot.store(Some(survivor), Ordering::SeqCst);
        slot.store(None, Ordering::SeqCst);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_slot_releases_the_occupant() {
        let (handle, destroyed) = probe();
        let slot = AtomicStrong::new(Some(handle));
        drop(slot);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}

// =============================================================================
// Compare-exchange semantics
// =============================================================================

mod compare_exchange {
    use super::*;

    /// With `a` and `b` both owning X and `c` owning Y: a matching CAS
    /// moves the slot to Y and leaves `b` untouched at X; a stale CAS
    /// leaves the slot alone and rewrites `expected` to the observed value.
    #[test]
    fn word_slot_follows_the_contract() {
        let x: Strong<u8, Shared> = Strong::new(1);
        let y: Strong<u8, Shared> = Strong::new(2);

        let a = AtomicStrong::new(Some(x.clone()));
        let mut b = Some(x.clone());
        let c = Some(y.clone());

        assert!(a.compare_exchange_strong(&mut b, &c, Ordering::SeqCst, Ordering::SeqCst));
        assert!(Strong::ptr_eq(b.as_ref().unwrap(), &x));
        assert!(Strong::ptr_eq(&a.load(Ordering::SeqCst).unwrap(), &y));

        let mut stale = Some(x.clone());
        assert!(!a.compare_exchange_strong(&mut stale, &None, Ordering::SeqCst, Ordering::SeqCst));
        assert!(Strong::ptr_eq(stale.as_ref().unwrap(), &y));
        assert!(Strong::ptr_eq(&a.load(Ordering::SeqCst).unwrap(), &y));
    }

    #[test]
    fn weak_variant_retried_in_a_loop_converges() {
        let x: Strong<u32, Shared> = Strong::new(10);
        let slot = AtomicStrong::new(Some(x.clone()));
        let desired = Some(Strong::<u32, Shared>::new(11));

        let mut expected = None;
        while !slot.compare_exchange_weak(
            &mut expected,
            &desired,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {}
        assert!(Strong::ptr_eq(
            &slot.load(Ordering::SeqCst).unwrap(),
            desired.as_ref().unwrap()
        ));
    }

    #[test]
    fn wide_slot_follows_the_contract() {
        let x: Strong<[u8], Shared> = Strong::from_slice(&[1]);
        let y: Strong<[u8], Shared> = Strong::from_slice(&[2]);

        let a = AtomicWide::new(Some(x.clone()));
        let mut b = Some(x.clone());

        assert!(a.compare_exchange_strong(
            &mut b,
            &Some(y.clone()),
            Ordering::SeqCst,
            Ordering::SeqCst
        ));
        assert!(Strong::ptr_eq(b.as_ref().unwrap(), &x));

        let mut stale = Some(x.clone());
        assert!(!a.compare_exchange_strong(&mut stale, &None, Ordering::SeqCst, Ordering::SeqCst));
        assert!(Strong::ptr_eq(stale.as_ref().unwrap(), &y));
    }

    #[test]
    fn empty_and_occupied_do_not_match() {
        let slot: AtomicStrong<u8> = AtomicStrong::new(Some(Strong::new(1)));
        let mut expected = None;
        assert!(!slot.compare_exchange_strong(
            &mut expected,
            &None,
            Ordering::SeqCst,
            Ordering::SeqCst
        ));
        assert!(expected.is_some());
    }
}

// =============================================================================
// Concurrent slot traffic
// =============================================================================

mod slot_stress {
    use super::*;

    /// Writers keep replacing the occupant while readers keep loading;
    /// every loaded handle stays valid while held, and in the end exactly
    /// the displaced objects were destroyed.
    #[test]
    fn word_slot_load_store_stress() {
        let _ = env_logger::builder().is_test(true).try_init();

        const WRITERS: usize = 4;
        const READERS: usize = 4;
        const ROUNDS: usize = 2_000;

        let destroyed = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(AtomicStrong::new(Some(Strong::new(SyncProbe(
            destroyed.clone(),
        )))));

        let mut workers = Vec::new();
        for _ in 0..WRITERS {
            let slot = slot.clone();
            let destroyed = destroyed.clone();
            workers.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    slot.store(
                        Some(Strong::new(SyncProbe(destroyed.clone()))),
                        Ordering::SeqCst,
                    );
                }
            }));
        }
        for _ in 0..READERS {
            let slot = slot.clone();
            workers.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    if let Some(handle) = slot.load(Ordering::SeqCst) {
                        // The load's increment keeps the object alive for us.
                        assert!(Strong::strong_count(&handle) >= 1);
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        // One occupant left, all displaced objects destroyed.
        assert_eq!(destroyed.load(Ordering::SeqCst), WRITERS * ROUNDS);
        drop(
            Arc::try_unwrap(slot)
                .ok()
                .expect("all workers joined"),
        );
        assert_eq!(destroyed.load(Ordering::SeqCst), WRITERS * ROUNDS + 1);
    }

    #[test]
    fn wide_slot_load_store_stress() {
        const WRITERS: usize = 4;
        const ROUNDS: usize = 2_000;

        let destroyed = Arc::new(AtomicUsize::new(0));
        let slot: Arc<AtomicWide<SyncProbe>> = Arc::new(AtomicWide::empty());

        let mut workers = Vec::new();
        for _ in 0..WRITERS {
            let slot = slot.clone();
            let destroyed = destroyed.clone();
            workers.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let handle: Strong<SyncProbe, Shared> =
                        Strong::new(SyncProbe(destroyed.clone()));
                    let prev = slot.exchange(Some(handle), Ordering::SeqCst);
                    drop(prev);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(destroyed.load(Ordering::SeqCst), WRITERS * ROUNDS - 1);
        slot.store(None, Ordering::SeqCst);
        assert_eq!(destroyed.load(Ordering::SeqCst), WRITERS * ROUNDS);
    }

    /// CAS contention: many threads each try to install their own object
    /// over the same expected occupant; exactly one wins per round.
    #[test]
    fn cas_contention_single_winner() {
        const CONTENDERS: usize = 8;

        let base: Strong<u32, Shared> = Strong::new(0);
        let slot = Arc::new(AtomicStrong::new(Some(base.clone())));

        let winners = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..CONTENDERS)
            .map(|_| {
                let slot = slot.clone();
                let base = Some(base.clone());
                let winners = winners.clone();
                std::thread::spawn(move || {
                    let mut expected = base;
                    let desired = Some(Strong::<u32, Shared>::new(1));
                    if slot.compare_exchange_strong(
                        &mut expected,
                        &desired,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        let occupant = slot.load(Ordering::SeqCst).unwrap();
        assert_eq!(*occupant, 1);
    }
}
