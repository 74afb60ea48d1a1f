//! Command channel behaviour across independent producer/consumer threads

use cell_store::prelude::*;
use std::thread;
use std::time::{Duration, Instant};

const KEY: &str = "command/device";

#[test]
fn threaded_exchange_completes_every_request_once() -> StoreResult<()> {
    let store = SharedStore::new();
    let consumer = CommandConsumer::new(store.clone(), KEY);

    let worker = thread::spawn(move || -> StoreResult<u64> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut served = 0;
        while served < 50 && Instant::now() < deadline {
            if let Some(record) = consumer.pending()? {
                let n = record.param_i64("n").unwrap_or(-1);
                consumer.complete(record.id, Some(json!({ "echo": n })))?;
                served += 1;
            } else {
                thread::sleep(Duration::from_micros(200));
            }
        }
        Ok(served)
    });

    let mut producer = CommandProducer::new(store.clone(), KEY);
    let mut ids = Vec::new();
    for n in 0..50 {
        let mut params = Params::new();
        params.insert("n".into(), json!(n));
        let id = producer.issue("MEASURE_THICKNESS", params)?;
        ids.push(id);

        let deadline = Instant::now() + Duration::from_secs(5);
        let done = loop {
            let since = store.version();
            if let Some(done) = producer.poll_completion()? {
                break done;
            }
            assert!(Instant::now() < deadline, "request {n} never completed");
            store.wait_for_change(since, Duration::from_millis(50));
        };
        assert_eq!(done.id, id);
        assert_eq!(done.result, Some(json!({ "echo": n })));
        assert!(store.is_empty_at(KEY), "key must read empty after completion");
    }

    assert_eq!(worker.join().expect("worker panicked")?, 50);
    ids.dedup();
    assert_eq!(ids.len(), 50, "correlation ids must be unique");
    Ok(())
}

#[test]
fn second_request_waits_for_clear() -> StoreResult<()> {
    let store = SharedStore::new();
    let mut producer = CommandProducer::new(store.clone(), KEY);
    let consumer = CommandConsumer::new(store.clone(), KEY);

    let first = producer.issue("READ_QR", Params::new())?;
    consumer.complete(first, Some(json!({ "code": "SP-001" })))?;
    assert!(producer.issue("READ_QR", Params::new()).is_err());

    let done = producer.poll_completion()?.expect("first request finished");
    assert_eq!(done.reason(), None);
    let second = producer.issue("READ_QR", Params::new())?;
    assert!(second > first);
    Ok(())
}
