mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use traffic_inspector::api::FanoutGroupId;
use traffic_inspector::classifier::{Classifier, WorkerId};
use traffic_inspector::errors::{CaptureError, InitError};
use traffic_inspector::queue;
use traffic_inspector::synthetic::{Hub, Sock, SyntheticFlags};
use traffic_inspector::worker::WorkerPool;

use common::Tracked;

const WORKERS: usize = 5;

#[test]
fn failed_channel_open_releases_earlier_workers() {
    for k in 0..WORKERS {
        let hub = Hub::new("syn0");
        hub.fail_joins_after(k);
        let flags = SyntheticFlags { hub: hub.clone() };
        let live = Arc::new(AtomicUsize::new(0));
        let factory = {
            let live = live.clone();
            move |_: WorkerId| -> Result<Box<dyn Classifier>, InitError> { Ok(Box::new(Tracked::new(&live))) }
        };
        let (tx, _rx) = queue::channel();

        let err = WorkerPool::<Sock>::init(WORKERS, "syn0", FanoutGroupId::from(9), &flags, &factory, &tx)
            .err()
            .unwrap();
        match err {
            InitError::Capture {
                worker,
                source: CaptureError::FanoutJoinFailed { group: 9, .. },
            } => assert_eq!(worker, k),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hub.members(), 0, "channels leaked when worker {k} failed");
        assert_eq!(live.load(Ordering::SeqCst), 0, "classifiers leaked when worker {k} failed");
    }
}

#[test]
fn failed_classifier_init_releases_everything() {
    for k in 0..WORKERS {
        let hub = Hub::new("syn0");
        let flags = SyntheticFlags { hub: hub.clone() };
        let live = Arc::new(AtomicUsize::new(0));
        let factory = {
            let live = live.clone();
            move |id: WorkerId| -> Result<Box<dyn Classifier>, InitError> {
                if id.index == k {
                    return Err(InitError::Classifier {
                        worker: id.index,
                        reason: "database unavailable".into(),
                    });
                }
                Ok(Box::new(Tracked::new(&live)))
            }
        };
        let (tx, _rx) = queue::channel();

        let err = WorkerPool::<Sock>::init(WORKERS, "syn0", FanoutGroupId::from(9), &flags, &factory, &tx)
            .err()
            .unwrap();
        assert!(matches!(err, InitError::Classifier { worker, .. } if worker == k));
        assert_eq!(hub.members(), 0);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn successful_init_holds_every_resource_until_release() {
    let hub = Hub::new("syn0");
    let flags = SyntheticFlags { hub: hub.clone() };
    let live = Arc::new(AtomicUsize::new(0));
    let factory = {
        let live = live.clone();
        move |_: WorkerId| -> Result<Box<dyn Classifier>, InitError> { Ok(Box::new(Tracked::new(&live))) }
    };
    let (tx, _rx) = queue::channel();
    let pool = WorkerPool::<Sock>::init(WORKERS, "syn0", FanoutGroupId::from(9), &flags, &factory, &tx).unwrap();
    assert_eq!(pool.len(), WORKERS);
    assert_eq!(hub.members(), WORKERS);
    assert_eq!(live.load(Ordering::SeqCst), WORKERS);

    pool.release();
    assert_eq!(hub.members(), 0);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}
