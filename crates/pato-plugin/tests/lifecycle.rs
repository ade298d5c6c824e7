mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use pato_plugin::{ComponentFault, ErrorKind, HostCall, LogLevel, PluginError, PluginState};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn explicit_steps_walk_the_state_machine() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let lifecycle = host.lifecycle();
    let id = lifecycle
        .load(manifest("stepper", ""), TestPlugin::inert().source())
        .await
        .unwrap();
    assert_eq!(lifecycle.state(&id).await, Some(PluginState::Loaded));

    let err = lifecycle.suspend(&id).await.unwrap_err();
    assert!(matches!(err, PluginError::InvalidTransition { .. }));
    let err = lifecycle.start(&id).await.unwrap_err();
    assert!(matches!(err, PluginError::InvalidTransition { .. }));

    lifecycle.initialize(&id).await.unwrap();
    assert_eq!(lifecycle.state(&id).await, Some(PluginState::Initialized));
    lifecycle.start(&id).await.unwrap();
    assert_eq!(lifecycle.state(&id).await, Some(PluginState::Running));
    lifecycle.suspend(&id).await.unwrap();
    assert_eq!(lifecycle.state(&id).await, Some(PluginState::Suspended));
    lifecycle.resume(&id).await.unwrap();
    assert_eq!(lifecycle.state(&id).await, Some(PluginState::Running));
    lifecycle.shutdown(&id).await.unwrap();
    assert_eq!(lifecycle.state(&id).await, Some(PluginState::ShutDown));

    let err = lifecycle.resume(&id).await.unwrap_err();
    assert!(matches!(err, PluginError::InvalidTransition { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn init_error_fails_plugin_and_allows_reload() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let failing = TestPlugin::new(|_, export, _| {
        if export == "init" {
            return Ok(format!(r#"{{"error": "bad config near {TWITCH_TOKEN}"}}"#).into_bytes());
        }
        Ok(Vec::new())
    });

    let err = host
        .lifecycle()
        .load_and_start(manifest("picky", ""), failing.source())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InitFailure);

    let id = "picky".into();
    assert_eq!(host.lifecycle().state(&id).await, Some(PluginState::Failed));
    let failure = host.lifecycle().failure(&id).await.unwrap();
    assert_eq!(failure.kind, ErrorKind::InitFailure);
    assert!(failure.reason.contains("bad config near [redacted]"));
    assert!(!failure.reason.contains(TWITCH_TOKEN));

    host.lifecycle()
        .load_and_start(manifest("picky", ""), TestPlugin::inert().source())
        .await
        .unwrap();
    assert_eq!(host.lifecycle().state(&id).await, Some(PluginState::Running));
    assert!(host.lifecycle().failure(&id).await.is_none());

    host.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn init_trap_and_timeout_are_init_failures() {
    let mut config = test_config();
    config.lifecycle.init_timeout = Duration::from_millis(50);
    let host = test_host_with(config, Arc::new(RecordingConnectionManager::new()));

    let trapping = TestPlugin::new(|_, export, _| match export {
        "init" => Err(ComponentFault::FuelExhausted),
        _ => Ok(Vec::new()),
    });
    let err = host
        .lifecycle()
        .load_and_start(manifest("hungry", ""), trapping.source())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InitFailure);
    assert!(err.to_string().contains("fuel exhausted"));

    let sleepy = TestPlugin::new(|_, export, _| {
        if export == "init" {
            std::thread::sleep(Duration::from_millis(300));
        }
        Ok(Vec::new())
    });
    let err = host
        .lifecycle()
        .load_and_start(manifest("sleepy", ""), sleepy.source())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InitFailure);
    assert!(err.to_string().contains("timed out after 50 ms"));
    assert_eq!(
        host.lifecycle().state(&"sleepy".into()).await,
        Some(PluginState::Failed)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_load_is_rejected() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    host.lifecycle()
        .load_and_start(manifest("solo", ""), TestPlugin::inert().source())
        .await
        .unwrap();
    let err = host
        .lifecycle()
        .load(manifest("solo", ""), TestPlugin::inert().source())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    host.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn newer_host_requirement_is_rejected() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let manifest = manifest("future", "min_host_version = \"99.0.0\"");
    let err = host
        .lifecycle()
        .load(manifest, TestPlugin::inert().source())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidManifest);
    assert!(host.lifecycle().plugins().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_calls_during_init_are_not_running() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let results = Results::default();
    let sink = results.clone();
    let plugin = TestPlugin::new(move |host, export, _| {
        if export == "init" {
            sink.push(host.invoke(HostCall::Log {
                level: LogLevel::Info,
                message: "starting".into(),
            }));
        }
        Ok(Vec::new())
    });
    host.lifecycle()
        .load_and_start(manifest("eager", ""), plugin.source())
        .await
        .unwrap();
    assert_eq!(results.all(), vec![Err(ErrorKind::NotRunning)]);

    host.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ui_config_is_stored_and_announced() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let ui = host.ui_bridge().unwrap();
    let plugin = TestPlugin::new(|_, export, _| {
        if export == "get_ui_config" {
            return reply_ok(json!({ "panel": "Chat stats", "token": TWITCH_TOKEN }));
        }
        Ok(Vec::new())
    })
    .export("get_ui_config");
    let id = host
        .lifecycle()
        .load_and_start(manifest("stats", ""), plugin.source())
        .await
        .unwrap();

    let mut announced = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while announced.is_none() {
        let event = tokio::time::timeout_at(deadline, ui.next_event())
            .await
            .expect("ui.config announced")
            .unwrap();
        if event.event_type == "ui.config" {
            announced = Some(event);
        }
    }
    let event = announced.unwrap();
    assert_eq!(event.payload["plugin"], "stats");
    assert_eq!(event.payload["config"]["panel"], "Chat stats");
    assert_eq!(event.payload["config"]["token"], "[redacted]");

    let stored = ui.ui_config(&id).await.unwrap();
    assert_eq!(stored["panel"], "Chat stats");

    host.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_event_handler_is_treated_as_trap() {
    let mut config = test_config();
    config.lifecycle.event_timeout = Duration::from_millis(50);
    let host = test_host_with(config, Arc::new(RecordingConnectionManager::new()));
    let ui = host.ui_bridge().unwrap();
    let plugin = TestPlugin::new(|_, export, _| {
        if export == "handle_event" {
            std::thread::sleep(Duration::from_millis(300));
        }
        Ok(Vec::new())
    });
    let id = host
        .lifecycle()
        .load_and_start(
            manifest(
                "slowpoke",
                r#"
[capabilities]
subscribe = ["chat.*"]

[events]
subscribe = ["chat.*"]
"#,
            ),
            plugin.source(),
        )
        .await
        .unwrap();

    host.publish_external("chat.message", json!({}));
    wait_for_state(&host, &id, PluginState::Failed).await;

    let failure = host.lifecycle().failure(&id).await.unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeTrap);
    assert!(failure.reason.contains("timed out"));

    let mut failed_reported = false;
    while let Some(event) = ui.try_next_event() {
        if event.event_type == "plugin.failed" {
            assert_eq!(event.payload["plugin"], "slowpoke");
            assert_eq!(event.payload["kind"], "runtime_trap");
            failed_reported = true;
        }
    }
    assert!(failed_reported);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_export_runs_once_and_teardown_stops_everything() {
    let host = test_host(Arc::new(RecordingConnectionManager::new()));
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["beta", "alpha"] {
        let counter = shutdowns.clone();
        let order = order.clone();
        let plugin = TestPlugin::new(move |host, export, _| {
            if export == "shutdown" {
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push(host.plugin().to_string());
            }
            Ok(Vec::new())
        })
        .export("shutdown");
        host.lifecycle()
            .load_and_start(manifest(name, ""), plugin.source())
            .await
            .unwrap();
    }

    let names: Vec<String> = host
        .lifecycle()
        .plugins()
        .await
        .into_iter()
        .map(|p| p.id.to_string())
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    let beta = "beta".into();
    host.lifecycle().shutdown(&beta).await.unwrap();
    host.lifecycle().shutdown(&beta).await.unwrap();
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

    host.teardown().await;
    assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
    assert_eq!(*order.lock().unwrap(), vec!["beta", "alpha"]);
    for summary in host.lifecycle().plugins().await {
        assert_eq!(summary.state, PluginState::ShutDown);
    }
    assert!(host.vault().is_empty());
}
