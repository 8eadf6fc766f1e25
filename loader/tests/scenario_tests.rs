//! End-to-end scenarios: directives, info routing, governor policy

mod support;

use std::sync::Arc;
use std::time::Duration;

use loader_common::error::EXIT_GOVERNOR;
use loader_common::{Action, Error};
use stream_loader::dispatch::Dispatcher;
use stream_loader::governor::GovernorDecision;
use stream_loader::sink::{Sink, WireSink};
use stream_loader::transport::memory::MemoryPublish;

use support::{test_codec, test_config, EngineScript, ScriptedEngine, ScriptedGovernor, ScriptedSource};

fn memory_sink(label: &'static str) -> Arc<WireSink<Arc<MemoryPublish>>> {
    Arc::new(WireSink::new(Arc::new(MemoryPublish::new()), label))
}

#[tokio::test]
async fn delete_withinfo_directive_overrides_the_subcommand_default() {
    let source = Arc::new(ScriptedSource::new(&[concat!(
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"42","#,
        r#""senzingStreamLoader":{"action":"deleteRecordWithInfo"}}"#
    )]));
    let engine = Arc::new(ScriptedEngine::new());
    engine.script(
        "42",
        vec![EngineScript::OkInfo(serde_json::json!({
            "AFFECTED_ENTITIES": [{"ENTITY_ID": 7}]
        }))],
    );
    let info_sink = memory_sink("info");

    // Subcommand default is ADD; the directive must win.
    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), test_config(4, 1))
            .with_info_sink(info_sink.clone() as Arc<dyn Sink>),
    );
    dispatcher.run().await.unwrap();

    let calls = engine.calls();
    assert_eq!(calls.len(), 1);
    let (action, record) = &calls[0];
    assert_eq!(*action, Action::DeleteWithInfo);
    assert_eq!(record["RECORD_ID"], "42");

    // The directive envelope never reaches the engine.
    assert!(record.get("senzingStreamLoader").is_none());

    // The info payload carries the record identity and the resolved action.
    let published = info_sink.wire().published_json();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0]["RECORD_ID"], "42");
    assert_eq!(published[0]["DATA_SOURCE"], "TEST");
    assert_eq!(published[0]["ACTION"], "deleteRecordWithInfo");
    assert_eq!(published[0]["AFFECTED_ENTITIES"][0]["ENTITY_ID"], 7);

    assert_eq!(source.acked().len(), 1);
}

#[tokio::test]
async fn subcommand_default_applies_without_a_directive() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());

    let mut config = test_config(4, 1);
    config.default_action = Action::AddWithInfo;
    let info_sink = memory_sink("info");
    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), config)
            .with_info_sink(info_sink.clone() as Arc<dyn Sink>),
    );
    dispatcher.run().await.unwrap();

    assert_eq!(engine.calls()[0].0, Action::AddWithInfo);
    assert_eq!(info_sink.wire().published_json().len(), 1);
}

#[tokio::test]
async fn governor_veto_configured_fatal_exits_without_ack() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    let governor = Arc::new(ScriptedGovernor::new(vec![GovernorDecision::Veto(
        "transaction id headroom exhausted".to_string(),
    )]));

    let mut config = test_config(4, 1);
    config.governor_fatal = true;
    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), config)
            .with_governor(governor),
    );
    let err = dispatcher.run().await.unwrap_err();

    assert!(matches!(err, Error::GovernorVeto(_)));
    assert_eq!(err.exit_code(), EXIT_GOVERNOR);
    assert!(source.acked().is_empty());

    // The engine was never consulted for the vetoed record.
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn governor_veto_configured_skip_routes_to_failure_sink() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"1"}"#,
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"2"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    let governor = Arc::new(ScriptedGovernor::new(vec![GovernorDecision::Veto(
        "headroom exhausted".to_string(),
    )]));
    let failure_sink = memory_sink("failure");

    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), test_config(4, 1))
            .with_governor(governor)
            .with_failure_sink(failure_sink.clone() as Arc<dyn Sink>),
    );
    dispatcher.run().await.unwrap();

    // First record vetoed and routed; second passes once the script is
    // exhausted. Both messages end acknowledged.
    let failures = failure_sink.wire().published_json();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["errorKind"], "governor_veto");
    assert_eq!(engine.calls().len(), 1);
    assert_eq!(source.acked().len(), 2);
}

#[tokio::test]
async fn governor_delay_pauses_then_proceeds() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    let governor = Arc::new(ScriptedGovernor::new(vec![
        GovernorDecision::Delay(Duration::from_millis(5)),
        GovernorDecision::Delay(Duration::from_millis(5)),
    ]));

    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), test_config(4, 1))
            .with_governor(governor),
    );
    dispatcher.run().await.unwrap();

    assert_eq!(engine.calls().len(), 1);
    assert_eq!(source.acked().len(), 1);
}

#[tokio::test]
async fn info_publish_retries_transient_sink_failures() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());
    let info_sink = memory_sink("info");
    info_sink.wire().fail_next(2);

    let mut config = test_config(4, 1);
    config.default_action = Action::AddWithInfo;
    config.retry_limit = 3;
    let dispatcher = Arc::new(
        Dispatcher::new(source.clone(), engine.clone(), test_codec(), config)
            .with_info_sink(info_sink.clone() as Arc<dyn Sink>),
    );
    dispatcher.run().await.unwrap();

    // The record is not done until the info payload lands.
    assert_eq!(info_sink.wire().published_json().len(), 1);
    assert_eq!(source.acked().len(), 1);
}

#[tokio::test]
async fn info_payload_discarded_when_sink_disabled() {
    let source = Arc::new(ScriptedSource::new(&[
        r#"{"DATA_SOURCE":"TEST","RECORD_ID":"1"}"#,
    ]));
    let engine = Arc::new(ScriptedEngine::new());

    let mut config = test_config(4, 1);
    config.default_action = Action::AddWithInfo;
    let dispatcher = Arc::new(Dispatcher::new(
        source.clone(),
        engine.clone(),
        test_codec(),
        config,
    ));
    dispatcher.run().await.unwrap();

    // Explicitly disabled sink: success without publication.
    assert_eq!(source.acked().len(), 1);
}
