//! End-to-end scenarios driven through the real [`Orchestrator`] and
//! [`BuildStore`], against the `mock` sandbox backend and a fake `make`
//! fixture rather than a live ports tree.

use portbuilder::{
    orchestrator::{Orchestrator, StatsSnapshot},
    store::{BuildStatus, BuildStore},
};
use tokio_util::sync::CancellationToken;

use crate::fixtures::{PortMeta, Workspace, fail_at_phase, write_metadata};

/// Open a fresh [`BuildStore`] handle and run one build, mirroring one CLI
/// invocation: the store (and its exclusive lock) is released when this
/// function returns, same as the real CLI releasing it on process exit.
async fn run_once(ws: &Workspace, specs: &[&str], force: bool) -> StatsSnapshot {
    let store = BuildStore::open(&ws.config.store_path)
        .await
        .expect("open build store");
    let orchestrator = Orchestrator::new(ws.config.clone(), store, CancellationToken::new());
    let specs: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
    orchestrator.run(&specs, force).await.expect("run build")
}

#[test_log::test(tokio::test)]
async fn build_success_updates_store_and_fingerprint() {
    let ws = Workspace::new();
    let port_dir = ws.port("games", "foo", "PORTNAME=\tfoo\n");
    write_metadata(
        &port_dir,
        &PortMeta {
            version: "1.0",
            ..Default::default()
        },
    );

    let stats = run_once(&ws, &["games/foo"], false).await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 0);

    let store = BuildStore::open(&ws.config.store_path).await.unwrap();
    let records = store.records_for_origin("games/foo").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BuildStatus::Success);
    assert!(store.get_fingerprint("games/foo").await.is_ok());
}

#[test_log::test(tokio::test)]
async fn unchanged_port_is_skipped_on_next_run() {
    let ws = Workspace::new();
    let port_dir = ws.port("games", "foo", "PORTNAME=\tfoo\n");
    write_metadata(
        &port_dir,
        &PortMeta {
            version: "1.0",
            ..Default::default()
        },
    );

    let first = run_once(&ws, &["games/foo"], false).await;
    assert_eq!(first.success, 1);

    let second = run_once(&ws, &["games/foo"], false).await;
    assert_eq!(second.success, 0);
    assert_eq!(second.skipped, 1);
}

#[test_log::test(tokio::test)]
async fn changed_port_rebuilds_on_next_run() {
    let ws = Workspace::new();
    let port_dir = ws.port("games", "foo", "PORTNAME=\tfoo\n");
    write_metadata(
        &port_dir,
        &PortMeta {
            version: "1.0",
            ..Default::default()
        },
    );

    let first = run_once(&ws, &["games/foo"], false).await;
    assert_eq!(first.success, 1);

    // Rewriting the Makefile changes the port's content fingerprint.
    ws.port("games", "foo", "PORTNAME=\tfoo\nPORTVERSION=\t2.0\n");
    let second = run_once(&ws, &["games/foo"], false).await;
    assert_eq!(second.success, 1);
    assert_eq!(second.skipped, 0);
}

#[test_log::test(tokio::test)]
async fn force_rebuilds_despite_unchanged_fingerprint() {
    let ws = Workspace::new();
    let port_dir = ws.port("games", "foo", "PORTNAME=\tfoo\n");
    write_metadata(
        &port_dir,
        &PortMeta {
            version: "1.0",
            ..Default::default()
        },
    );

    let first = run_once(&ws, &["games/foo"], false).await;
    assert_eq!(first.success, 1);

    let forced = run_once(&ws, &["games/foo"], true).await;
    assert_eq!(forced.success, 1);
    assert_eq!(forced.skipped, 0);
}

#[test_log::test(tokio::test)]
async fn failed_dependency_skips_its_dependent() {
    let ws = Workspace::new();

    let dep_dir = ws.port("games", "foo", "PORTNAME=\tfoo\n");
    write_metadata(
        &dep_dir,
        &PortMeta {
            version: "1.0",
            ..Default::default()
        },
    );
    fail_at_phase(&dep_dir, "configure");

    let dependent_dir = ws.port("games", "bar", "PORTNAME=\tbar\n");
    write_metadata(
        &dependent_dir,
        &PortMeta {
            version: "1.0",
            build_depends: "foo>0:games/foo",
            ..Default::default()
        },
    );

    let stats = run_once(&ws, &["games/bar"], false).await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.success, 0);
}
