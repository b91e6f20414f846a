mod common;

use serde_json::json;
use statesync_net::{LocalNetwork, SyncState};

const HOST: u64 = 2;
const WEBVIEW: u64 = 20;

#[test]
fn webview_bootstraps_through_its_host() {
    let net = LocalNetwork::new();
    let mut worker = common::worker(&net);
    worker
        .coordinator_mut()
        .commit("counter/increment", json!({"by": 4}))
        .unwrap();
    common::settle(&mut [&mut worker]);

    let mut host = common::hosting_renderer(&net, HOST, WEBVIEW);
    let mut webview = common::webview(&net, WEBVIEW, HOST);
    webview.start();
    common::settle(&mut [&mut worker, &mut host, &mut webview]);

    assert!(webview.coordinator().is_ready());
    assert_eq!(common::counter(&webview), 4);
    // The host only relayed the snapshot; it has not synced itself.
    assert_eq!(host.coordinator().sync_state(), SyncState::AwaitingSnapshot);
    assert_eq!(common::counter(&host), 0);
    assert_eq!(worker.coordinator().peers().count(), 0);
}

#[test]
fn webview_sees_worker_and_host_commits() {
    let net = LocalNetwork::new();
    let mut worker = common::worker(&net);
    let mut host = common::hosting_renderer(&net, HOST, WEBVIEW);
    let mut webview = common::webview(&net, WEBVIEW, HOST);
    host.start();
    webview.start();
    common::settle(&mut [&mut worker, &mut host, &mut webview]);
    assert!(host.coordinator().is_ready());
    assert!(webview.coordinator().is_ready());

    worker
        .coordinator_mut()
        .commit("counter/increment", json!({"by": 1}))
        .unwrap();
    common::settle(&mut [&mut worker, &mut host, &mut webview]);
    assert_eq!(common::counter(&webview), 1);

    host.coordinator_mut()
        .commit("counter/increment", json!({"by": 10}))
        .unwrap();
    common::settle(&mut [&mut worker, &mut host, &mut webview]);

    assert_eq!(common::counter(&worker), 11);
    assert_eq!(common::counter(&host), 11);
    assert_eq!(common::counter(&webview), 11);
}

#[test]
fn webview_commit_is_applied_once_everywhere() {
    let net = LocalNetwork::new();
    let mut worker = common::worker(&net);
    let mut host = common::hosting_renderer(&net, HOST, WEBVIEW);
    let mut webview = common::webview(&net, WEBVIEW, HOST);
    let mut other = common::renderer(&net, 3);
    host.start();
    webview.start();
    other.start();
    common::settle(&mut [&mut worker, &mut host, &mut webview, &mut other]);

    webview
        .coordinator_mut()
        .commit("todos/add", json!({"text": "from webview"}))
        .unwrap();
    common::settle(&mut [&mut worker, &mut host, &mut webview, &mut other]);

    for process in [&worker, &host, &webview, &other] {
        assert_eq!(
            process.coordinator().replica().state().module("todos"),
            Some(&json!(["from webview"])),
            "{} diverged",
            process.coordinator().id()
        );
    }
}

#[test]
fn webview_without_host_reports_not_yet_synced() {
    let net = LocalNetwork::new();
    let mut worker = common::worker(&net);
    let mut webview = common::webview(&net, WEBVIEW, HOST);
    webview.start();

    common::drive_until(
        &mut [&mut worker, &mut webview],
        std::time::Duration::from_secs(2),
        |processes| {
            processes[1].coordinator().status() == statesync_net::SyncStatus::NotYetSynced
        },
    );
    assert_eq!(webview.coordinator().sync_state(), SyncState::AwaitingSnapshot);
}

#[test]
fn host_and_webview_commits_race_to_one_order() {
    let net = LocalNetwork::new();
    let mut worker = common::worker(&net);
    let mut host = common::hosting_renderer(&net, HOST, WEBVIEW);
    let mut webview = common::webview(&net, WEBVIEW, HOST);
    let mut other = common::renderer(&net, 3);
    host.start();
    webview.start();
    other.start();
    common::settle(&mut [&mut worker, &mut host, &mut webview, &mut other]);

    host.coordinator_mut()
        .commit("todos/add", json!({"text": "host"}))
        .unwrap();
    webview
        .coordinator_mut()
        .commit("todos/add", json!({"text": "webview"}))
        .unwrap();
    common::settle(&mut [&mut worker, &mut host, &mut webview, &mut other]);

    let canonical = common::todos(&worker);
    assert_eq!(canonical.as_array().map(Vec::len), Some(2));
    for process in [&host, &webview, &other] {
        assert_eq!(
            common::todos(process),
            canonical,
            "{} diverged",
            process.coordinator().id()
        );
    }
}
