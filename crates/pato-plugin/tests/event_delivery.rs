mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pato_plugin::{ComponentFault, ErrorKind, HostCall, PluginState, Subscriber};
use serde_json::{json, Value};

const LISTENS_TO_CHAT: &str = r#"
[capabilities]
subscribe = ["chat.*"]

[events]
subscribe = ["chat.*"]
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matching_events_arrive_once_in_publish_order() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let (plugin, inbox) = recording_plugin();
    host.lifecycle()
        .load_and_start(manifest("listener", LISTENS_TO_CHAT), plugin.source())
        .await
        .unwrap();

    let mut sequences = Vec::new();
    for n in 0..10 {
        let report = host.publish_external("chat.message", json!({ "n": n }));
        assert_eq!(report.delivered, 1);
        sequences.push(report.event.sequence);
    }
    let unrelated = host.publish_external("follow.new", json!({}));
    assert_eq!(unrelated.delivered, 0);

    wait_until("ten deliveries", || inbox.len() >= 10).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = inbox.events();
    assert_eq!(events.len(), 10);
    let ns: Vec<i64> = events
        .iter()
        .map(|e| e["payload"]["n"].as_i64().unwrap())
        .collect();
    assert_eq!(ns, (0..10).collect::<Vec<_>>());
    let seen: Vec<u64> = events
        .iter()
        .map(|e| e["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(seen, sequences);
    assert!(events.iter().all(|e| e["source"]["kind"] == "host"));

    host.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shut_down_plugin_receives_nothing_more() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let (plugin, inbox) = recording_plugin();
    let id = host
        .lifecycle()
        .load_and_start(manifest("listener", LISTENS_TO_CHAT), plugin.source())
        .await
        .unwrap();

    host.publish_external("chat.message", json!({ "n": 1 }));
    wait_until("first delivery", || inbox.len() == 1).await;

    host.lifecycle().shutdown(&id).await.unwrap();
    assert_eq!(host.lifecycle().state(&id).await, Some(PluginState::ShutDown));

    let report = host.publish_external("chat.message", json!({ "n": 2 }));
    assert_eq!(report.delivered, 0);
    assert!(host
        .bus()
        .subscriptions_of(&Subscriber::Plugin(id.clone()))
        .is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(inbox.len(), 1);

    // Shutting down again is a no-op.
    host.lifecycle().shutdown(&id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_plugin_receives_nothing_more() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let inbox = Inbox::default();
    let sink = inbox.clone();
    let plugin = TestPlugin::new(move |_, export, input| {
        if export == "handle_event" {
            let event: Value = serde_json::from_slice(input).unwrap();
            if event["payload"]["boom"] == true {
                return Err(ComponentFault::Trap("unreachable executed".into()));
            }
            sink.push(event);
        }
        Ok(Vec::new())
    });
    let id = host
        .lifecycle()
        .load_and_start(manifest("fragile", LISTENS_TO_CHAT), plugin.source())
        .await
        .unwrap();

    host.publish_external("chat.message", json!({ "boom": true }));
    wait_for_state(&host, &id, PluginState::Failed).await;

    let failure = host.lifecycle().failure(&id).await.unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeTrap);
    assert!(failure.reason.contains("unreachable executed"));

    let report = host.publish_external("chat.message", json!({ "n": 1 }));
    assert_eq!(report.delivered, 0);
    assert!(!host.bus().is_attached(&Subscriber::Plugin(id.clone())));
    assert_eq!(inbox.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_subscriber_keeps_newest_events_and_one_drop_notice() {
    let mut config = test_config();
    config.queue_capacity = 4;
    let host = test_host_with(config, Arc::new(RecordingConnectionManager::new()));
    let (plugin, inbox) = recording_plugin();
    let id = host
        .lifecycle()
        .load_and_start(
            manifest(
                "ticker",
                r#"
[capabilities]
subscribe = ["stream.tick"]

[events]
subscribe = ["stream.tick"]
"#,
            ),
            plugin.source(),
        )
        .await
        .unwrap();

    host.lifecycle().suspend(&id).await.unwrap();
    let sequences: Vec<u64> = (1..=6)
        .map(|n| {
            host.publish_external("stream.tick", json!({ "n": n }))
                .event
                .sequence
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(inbox.len(), 0);

    host.lifecycle().resume(&id).await.unwrap();
    wait_until("five deliveries", || inbox.len() >= 5).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = inbox.events();
    assert_eq!(events.len(), 5);
    let notices: Vec<&Value> = events
        .iter()
        .filter(|e| e["type"] == "bus.dropped")
        .collect();
    assert_eq!(notices.len(), 1);
    let notice = notices[0];
    assert_eq!(notice["payload"]["dropped"]["sequence"], sequences[0]);
    assert_eq!(notice["payload"]["dropped"]["type"], "stream.tick");
    assert_eq!(notice["payload"]["count"], 2);
    let ns: Vec<i64> = events
        .iter()
        .filter(|e| e["type"] == "stream.tick")
        .map(|e| e["payload"]["n"].as_i64().unwrap())
        .collect();
    assert_eq!(ns, vec![3, 4, 5, 6]);

    host.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runtime_subscriptions_are_not_retroactive() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let inbox = Inbox::default();
    let sink = inbox.clone();
    let plugin = TestPlugin::new(move |host, export, input| {
        if export == "handle_event" {
            let event: Value = serde_json::from_slice(input).unwrap();
            if event["type"] == "chat.join" {
                host.invoke(HostCall::SubscribeToEvent {
                    event_type: "raid.*".into(),
                })
                .unwrap();
            }
            sink.push(event);
        }
        Ok(Vec::new())
    });
    host.lifecycle()
        .load_and_start(
            manifest(
                "raid-watch",
                r#"
[capabilities]
subscribe = ["chat.*", "raid.*"]

[events]
subscribe = ["chat.*"]
"#,
            ),
            plugin.source(),
        )
        .await
        .unwrap();

    assert_eq!(host.publish_external("raid.incoming", json!({ "n": 0 })).delivered, 0);
    host.publish_external("chat.join", json!({}));
    wait_until("join handled", || inbox.len() == 1).await;

    assert_eq!(host.publish_external("raid.incoming", json!({ "n": 1 })).delivered, 1);
    wait_until("raid delivered", || inbox.len() == 2).await;
    let raids = inbox.of_type("raid.incoming");
    assert_eq!(raids.len(), 1);
    assert_eq!(raids[0]["payload"]["n"], 1);

    host.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plugin_events_carry_plugin_source() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let (listener, inbox) = recording_plugin();
    host.lifecycle()
        .load_and_start(
            manifest(
                "listener",
                r#"
[capabilities]
subscribe = ["alerts.*"]

[events]
subscribe = ["alerts.*"]
"#,
            ),
            listener.source(),
        )
        .await
        .unwrap();

    let (emitter, results) = acting_plugin(vec![
        HostCall::EmitEvent {
            event_type: "alerts.first".into(),
            data: json!({ "n": 1 }),
        },
        HostCall::EmitEvent {
            event_type: "alerts.second".into(),
            data: json!({ "n": 2 }),
        },
    ]);
    host.lifecycle()
        .load_and_start(
            manifest(
                "alerter",
                r#"
[capabilities]
subscribe = ["chat.*"]
emit = ["alerts.*"]

[events]
subscribe = ["chat.*"]
"#,
            ),
            emitter.source(),
        )
        .await
        .unwrap();

    host.publish_external("chat.command", json!({}));
    wait_until("two alerts", || inbox.len() == 2).await;

    let events = inbox.events();
    assert_eq!(events[0]["type"], "alerts.first");
    assert_eq!(events[1]["type"], "alerts.second");
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event["source"]["kind"], "plugin");
        assert_eq!(event["source"]["id"], "alerter");
        assert_eq!(event["sequence"], i as u64 + 1);
    }
    let emitted = results.all();
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].as_ref().unwrap()["delivered"], 1);

    host.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ui_sees_lifecycle_transitions() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let ui = host.ui_bridge().unwrap();
    let id = host
        .lifecycle()
        .load_and_start(manifest("quiet", ""), TestPlugin::inert().source())
        .await
        .unwrap();

    let mut transitions = Vec::new();
    while let Some(event) = ui.try_next_event() {
        if event.event_type == "plugin.state_changed" {
            assert_eq!(event.payload["plugin"], "quiet");
            transitions.push(event.payload["to"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(transitions, vec!["loaded", "initialized", "running"]);

    let states = ui.plugin_states().await;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].id, id);
    assert_eq!(states[0].state, PluginState::Running);

    host.teardown().await;
}
