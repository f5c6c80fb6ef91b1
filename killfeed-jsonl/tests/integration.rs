use killfeed_core::{event_to_json, FeedEvent, PipelineEvent};
use killfeed_jsonl::JsonlSink;
use tower_service::Service;

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.jsonl");
    let mut sink = JsonlSink::new(path.to_string_lossy().to_string());

    let event = PipelineEvent::Feed(FeedEvent::KillReceived { killmail_id: 1, system_id: 30000142 });
    sink.call(event.clone()).await.expect("write ok");

    let contents = tokio::fs::read_to_string(&path).await.expect("file");
    let line = contents.lines().next().expect("one line");
    let parsed: serde_json::Value = serde_json::from_str(line).expect("valid json");
    assert_eq!(parsed, event_to_json(&event));
}
