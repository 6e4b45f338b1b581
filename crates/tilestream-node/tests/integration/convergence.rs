//! Loopback convergence tests: the client copy of every chunk in view ends
//! identical to the authoritative world once edits stop.

use tilestream_node::sim::{run_loopback, Loopback};

use crate::harness::{test_loss_percent, TestConfigBuilder};

/// No loss, steady edits: every chunk in view matches after settling.
#[test]
fn test_lossless_convergence() {
    let cfg = TestConfigBuilder::new().seed(3).ticks(150).build();
    let mut sim = Loopback::new(cfg).unwrap();
    sim.run(150).unwrap();

    let report = sim.report();
    assert_eq!(report.chunks_in_view, 25);
    assert_eq!(report.diverging_in_view, 0, "lossless link must converge: {report:?}");
    assert_eq!(report.link_dropped, 0);
    assert!(report.edits > 0, "editor should have run");
    assert_eq!(report.client.patch_mismatches, 0, "no loss, no lineage gaps");
    assert_eq!(report.client.snapshots_applied, 25);
    assert!(report.join_ready);
}

/// Fragment loss recovers through resync requests.
#[test]
fn test_lossy_convergence() {
    let loss = test_loss_percent(20);
    let cfg = TestConfigBuilder::new().seed(11).loss(loss).ticks(400).build();
    let mut sim = Loopback::new(cfg).unwrap();
    sim.run(400).unwrap();

    let report = sim.report();
    assert_eq!(report.diverging_in_view, 0, "lossy link must converge: {report:?}");
    assert_eq!(report.wanted_chunks, 0, "no resync left outstanding");
    if loss > 0 {
        assert!(report.link_dropped > 0, "link should have dropped fragments");
        assert!(report.client.resync_issued > 0, "recovery goes through resync");
    }
}

/// Several seeds, heavier loss, smaller view.
#[test]
fn test_convergence_across_seeds() {
    for seed in 1..=4 {
        let cfg = TestConfigBuilder::new()
            .seed(seed)
            .loss(35)
            .radius(1)
            .edits(2, 100)
            .build();
        let mut sim = Loopback::new(cfg).unwrap();
        sim.run(600).unwrap();
        let report = sim.report();
        assert_eq!(report.diverging_in_view, 0, "seed {seed} did not converge: {report:?}");
    }
}

/// A message budget of one snapshot per tick still fills the view, one
/// chunk at a time.
#[test]
fn test_tight_budget_fills_view() {
    let cfg = TestConfigBuilder::new().seed(5).no_edits().budget(64 * 1024, 1).build();
    let mut sim = Loopback::new(cfg).unwrap();

    sim.run(1).unwrap();
    assert_eq!(sim.server().session.scheduler().have_count(), 1);
    assert!(!sim.report().join_ready);

    sim.run(24).unwrap();
    let report = sim.report();
    assert_eq!(sim.server().session.scheduler().have_count(), 25);
    assert_eq!(report.diverging_in_view, 0);
    assert_eq!(report.client.snapshots_applied, 25);
    assert!(report.join_ready);
}

/// Focus in the corner: only the in-grid part of the view is streamed.
#[test]
fn test_corner_focus_clips_view() {
    let cfg = TestConfigBuilder::new().seed(8).focus(0, 0).loss(10).ticks(300).build();
    let mut sim = Loopback::new(cfg).unwrap();
    sim.run(300).unwrap();
    let report = sim.report();
    assert_eq!(report.chunks_in_view, 9);
    assert_eq!(report.diverging_in_view, 0, "{report:?}");
    assert!(sim.server().session.scheduler().have_count() <= 9);
}

/// Same config, same outcome.
#[test]
fn test_lockstep_is_deterministic() {
    let cfg = TestConfigBuilder::new().seed(21).loss(25).build();
    let mut a = Loopback::new(cfg.clone()).unwrap();
    let mut b = Loopback::new(cfg).unwrap();
    a.run(200).unwrap();
    b.run(200).unwrap();
    let (ra, rb) = (a.report(), b.report());
    assert_eq!(ra.client, rb.client);
    assert_eq!(ra.server, rb.server);
    assert_eq!(ra.link_dropped, rb.link_dropped);
}

/// Server and client on separate tasks over channels.
#[tokio::test]
async fn test_async_loopback_converges() {
    let cfg = TestConfigBuilder::new()
        .seed(13)
        .tick_rate(1000)
        .ticks(300)
        .edits(3, 100)
        .build();
    let report = run_loopback(cfg).await.unwrap();
    assert_eq!(report.ticks, 300);
    assert!(report.join_ready, "client should join: {report:?}");
    assert_eq!(report.diverging_in_view, 0, "{report:?}");
}

/// The async runner rejects configs that fail validation.
#[tokio::test]
async fn test_async_loopback_rejects_bad_config() {
    let mut cfg = TestConfigBuilder::new().build();
    cfg.link.compressor = "brotli".into();
    assert!(run_loopback(cfg).await.is_err());
}
