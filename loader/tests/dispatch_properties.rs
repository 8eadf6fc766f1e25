//! Dispatcher behavior under failure, batching, and backpressure

mod support;

use std::sync::Arc;
use std::time::Duration;

use loader_common::error::{EXIT_ENGINE_FATAL, EXIT_SINK};
use loader_common::Error;
use stream_loader::dispatch::Dispatcher;
use stream_loader::sink::{Sink, WireSink};
use stream_loader::transport::memory::MemoryPublish;

use support::{test_codec, test_config, EngineScript, ScriptedEngine, ScriptedSource};

fn failure_sink() -> Arc<WireSink<Arc<MemoryPublish>>> {
    Arc::new(WireSink::new(Arc::new(MemoryPublish::new()), "failure"))
}

#[tokio::test]
async fn transient_failure_is_retried_exactly_retry_limit_times() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"r1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    engine.script(
        "r1",
        vec![
            EngineScript::Transient("store busy"),
            EngineScript::Transient("store busy"),
            EngineScript::Transient("store busy"),
            EngineScript::Transient("store busy"),
        ],
    );
    let sink = failure_sink();

    let mut config = test_config(4, 1);
    config.retry_limit = 3;
    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), config)
            .with_failure_sink(sink.clone() as Arc<dyn Sink>),
    );
    dispatcher.run().await.unwrap();

    // One initial call plus exactly retry_limit retries.
    assert_eq!(engine.call_count("r1"), 4);

    // Exhaustion converts to non-retryable and lands in the failure sink;
    // the message is still acknowledged.
    let failures = sink.wire().published_json();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["errorKind"], "engine_transient");
    assert_eq!(source.acked().len(), 1);
}

#[tokio::test]
async fn batch_message_is_acked_only_after_every_record_finishes() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"[{"RECORD_ID":"slow"},{"RECORD_ID":"fast"}]"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    engine.script("slow", vec![EngineScript::Block]);

    let dispatcher = Arc::new(Dispatcher::new(
        source.clone(),
        engine.clone(),
        test_codec(),
        test_config(4, 2),
    ));
    let run = tokio::spawn(Arc::clone(&dispatcher).run());

    // Wait until both records reached the engine, then give the fast one
    // time to finish. The parent message must still be unacknowledged.
    while engine.calls().len() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(source.acked().is_empty());

    engine.release(1);
    run.await.unwrap().unwrap();
    assert_eq!(source.acked().len(), 1);
    assert!(source.nacked().is_empty());
}

#[tokio::test]
async fn fatal_engine_error_exits_without_acknowledging() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"r1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    engine.script("r1", vec![EngineScript::Fatal("license expired")]);

    let dispatcher = Arc::new(Dispatcher::new(
        source.clone(),
        engine.clone(),
        test_codec(),
        test_config(4, 1),
    ));
    let err = dispatcher.run().await.unwrap_err();

    assert!(matches!(err, Error::EngineFatal(_)));
    assert_eq!(err.exit_code(), EXIT_ENGINE_FATAL);

    // Never acknowledged: the message is abandoned for redelivery.
    assert!(source.acked().is_empty());
    assert_eq!(source.nacked().len(), 1);
}

#[tokio::test]
async fn full_queue_blocks_further_receives() {
    let bodies: Vec<String> = (0..5)
        .map(|i| format!(r#"{{"DATA_SOURCE":"TEST","RECORD_ID":"{i}"}}"#))
        .collect();
    let body_refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
    let source = Arc::new(ScriptedSource::new(&body_refs));
    let engine = Arc::new(ScriptedEngine::new());
    engine.script("0", vec![EngineScript::Block]);

    // Queue depth 1, one worker, first record stuck in the engine: the
    // worker holds record 0, the queue holds record 1, and the intake loop
    // blocks sending record 2. No further receive happens until the engine
    // lets go.
    let dispatcher = Arc::new(Dispatcher::new(
        source.clone(),
        engine.clone(),
        test_codec(),
        test_config(1, 1),
    ));
    let run = tokio::spawn(Arc::clone(&dispatcher).run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.receives(), 3);

    engine.release(1);
    run.await.unwrap().unwrap();

    // All five records processed and acknowledged once unblocked.
    assert_eq!(source.acked().len(), 5);
    assert_eq!(engine.calls().len(), 5);
}

#[tokio::test]
async fn malformed_array_element_fails_alone() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"[{"RECORD_ID":"good-1"}, 42, {"RECORD_ID":"good-2"}]"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    let sink = failure_sink();

    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), test_config(4, 2))
            .with_failure_sink(sink.clone() as Arc<dyn Sink>),
    );
    dispatcher.run().await.unwrap();

    // Siblings of the malformed element still reach the engine.
    assert_eq!(engine.calls().len(), 2);

    let failures = sink.wire().published_json();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["errorKind"], "malformed_record");

    // One acknowledgment for the whole batch, after all three outcomes.
    assert_eq!(source.acked().len(), 1);
}

#[tokio::test]
async fn failure_sink_exhaustion_is_fatal() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"r1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    engine.script("r1", vec![EngineScript::Rejected("bad shape")]);
    let sink = failure_sink();
    sink.wire().fail_next(100);

    let mut config = test_config(4, 1);
    config.retry_limit = 2;
    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), config)
            .with_failure_sink(sink.clone() as Arc<dyn Sink>),
    );
    let err = dispatcher.run().await.unwrap_err();

    assert!(matches!(err, Error::SinkPublish(_)));
    assert_eq!(err.exit_code(), EXIT_SINK);
    assert!(source.acked().is_empty());
}

#[tokio::test]
async fn dropped_record_without_failure_sink_still_acks() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"r1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    engine.script("r1", vec![EngineScript::Rejected("bad shape")]);

    let dispatcher = Arc::new(Dispatcher::new(
        source.clone(),
        engine.clone(),
        test_codec(),
        test_config(4, 1),
    ));
    dispatcher.run().await.unwrap();

    // Documented data-loss point: no sink, so the record is dropped with a
    // warning and the message completes.
    assert_eq!(source.acked().len(), 1);
}
