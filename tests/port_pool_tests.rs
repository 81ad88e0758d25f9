use std::collections::HashSet;
use std::sync::Arc;

use podbridge::ports::PortPool;
use podbridge::WorkerError;

#[tokio::test]
async fn concurrent_takes_never_duplicate() {
    let pool = Arc::new(PortPool::new(9200..9216));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.take().unwrap() }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let port = handle.await.unwrap();
        assert!(seen.insert(port), "port {port} handed out twice");
    }
    assert_eq!(pool.available(), 0);
}

#[tokio::test]
async fn take_past_capacity_fails_with_exhausted() {
    let pool = Arc::new(PortPool::new(9220..9224));
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.take().unwrap());
    }
    assert!(matches!(pool.take(), Err(WorkerError::PortsExhausted)));

    // A release makes the next take succeed again.
    pool.release(held.pop().unwrap()).unwrap();
    assert!(pool.take().is_ok());
}

#[test]
fn released_ports_are_reusable_in_fifo_order() {
    let pool = PortPool::new([9230, 9231]);
    let a = pool.take().unwrap();
    let b = pool.take().unwrap();
    pool.release(b).unwrap();
    pool.release(a).unwrap();
    assert_eq!(pool.take().unwrap(), b);
    assert_eq!(pool.take().unwrap(), a);
}
