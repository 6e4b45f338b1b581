//! Session-level recovery tests, driving server and client by hand.

use bytes::Bytes;
use tilestream_node::session::{ClientSession, ServerSession};
use tilestream_node::sim::seed_world;
use tilestream_protocol::{Envelope, EnvelopeHeader, Lane, MessageType, ResyncReason};
use tilestream_protocol::{ChunkResyncRequest, WireMessage};
use tilestream_replication::PatchRect;
use tilestream_world::{ChunkCoord, ChunkIndex, ChunkStore};

use crate::harness::{deliver, fragment_coord, TestConfigBuilder};

/// Every fragment of the first tick is lost. After the transfer grace the
/// client asks for the missing chunks and the server resends them.
#[test]
fn test_missing_chunks_requested_and_resent() {
    let cfg = TestConfigBuilder::new().seed(2).radius(1).no_edits().build();
    let world = seed_world(cfg.world.seed, cfg.world.sea_level);
    let mut server = ServerSession::new(&cfg).unwrap();
    let mut client = ClientSession::new(&cfg).unwrap();

    let first = server.tick(&world, 1);
    assert_eq!(first.len(), 10, "hello plus nine single-fragment snapshots");
    deliver(&mut client, &first[..1], 1);

    let mut requests = Vec::new();
    for now in 2..=21 {
        assert!(server.tick(&world, now).is_empty(), "server believes the client is complete");
        requests.extend(client.tick(now));
    }
    assert_eq!(requests.len(), 8, "first window is capped");
    assert!(requests.iter().all(|e| e.header.lane == Lane::ReliableOrdered));
    for env in &requests {
        let req = ChunkResyncRequest::decode(&env.payload).unwrap();
        assert_eq!(req.reason, ResyncReason::TransferTimedOut);
        assert_eq!(req.client_snapshot_id, 0);
        server.on_envelope(env);
    }
    assert_eq!(server.scheduler().pending_resyncs(), 8);

    let resent = server.tick(&world, 22);
    assert_eq!(resent.len(), 8);
    deliver(&mut client, &resent, 22);
    assert_eq!(client.wanted_chunks(), 1);

    // The ninth goes out once the window slides.
    let mut now = 22;
    while client.wanted_chunks() > 0 && now < 60 {
        now += 1;
        for env in client.tick(now) {
            server.on_envelope(&env);
        }
        let out = server.tick(&world, now);
        deliver(&mut client, &out, now);
    }
    assert_eq!(client.wanted_chunks(), 0);
    for idx in ChunkIndex::square(10, 10, 1) {
        assert!(
            client.store().chunk(idx).unwrap().same_fields(world.chunk(idx).unwrap()),
            "chunk {idx} differs"
        );
    }
}

/// A patch for a chunk whose snapshot was lost triggers an immediate
/// resync, and the client ends up on the edited lineage.
#[test]
fn test_patch_gap_resyncs_to_latest() {
    let cfg = TestConfigBuilder::new().seed(4).radius(1).no_edits().build();
    let mut world = seed_world(cfg.world.seed, cfg.world.sea_level);
    let mut server = ServerSession::new(&cfg).unwrap();
    let mut client = ClientSession::new(&cfg).unwrap();
    let target = ChunkCoord::new(11, 10);
    let idx = target.index().unwrap();

    let out = server.tick(&world, 1);
    let kept: Vec<Envelope> = out.into_iter().filter(|e| fragment_coord(e) != Some(target)).collect();
    deliver(&mut client, &kept, 1);
    assert_eq!(client.store().chunk(idx).unwrap().versions.snapshot, 0);

    let mut replies = Vec::new();
    for (now, rect) in [(2, PatchRect::new(0, 0, 4, 4)), (3, PatchRect::new(8, 8, 2, 2))] {
        let patch = server
            .edit_heights(&mut world, idx, rect, |h| h.wrapping_add(5))
            .unwrap()
            .expect("server believes the client holds the chunk");
        replies.extend(client.on_envelope(&patch, now));
    }
    assert_eq!(client.counters().patch_mismatches, 2);
    assert_eq!(replies.len(), 1, "second mismatch is within cooldown");
    assert_eq!(client.counters().resync_suppressed, 1);

    for env in &replies {
        server.on_envelope(env);
    }
    let out = server.tick(&world, 4);
    deliver(&mut client, &out, 4);
    let local = client.store().chunk(idx).unwrap();
    assert_eq!(local.versions.snapshot, 3);
    assert!(local.same_fields(world.chunk(idx).unwrap()));

    // Later patches build on the resynced lineage.
    let patch = server
        .edit_heights(&mut world, idx, PatchRect::new(1, 1, 1, 1), |h| h.wrapping_sub(1))
        .unwrap()
        .unwrap();
    assert!(client.on_envelope(&patch, 5).is_empty());
    assert_eq!(client.store().chunk(idx).unwrap().versions.snapshot, 4);
    assert_eq!(client.counters().patch_applies, 1);
}

/// A hello for a different world drops everything received so far.
#[test]
fn test_new_world_resets_client() {
    let cfg_a = TestConfigBuilder::new().seed(1).radius(1).no_edits().build();
    let mut cfg_b = cfg_a.clone();
    cfg_b.world.seed = 99;

    let world = seed_world(cfg_a.world.seed, cfg_a.world.sea_level);
    let mut server_a = ServerSession::new(&cfg_a).unwrap();
    let server_b = ServerSession::new(&cfg_b).unwrap();
    let mut client = ClientSession::new(&cfg_a).unwrap();

    let out = server_a.tick(&world, 1);
    deliver(&mut client, &out, 1);
    assert_eq!(client.hello().unwrap().world_seed, 1);
    assert!(client
        .store()
        .chunk(ChunkCoord::new(10, 10).index().unwrap())
        .is_some_and(|c| c.versions.snapshot == 1));

    // Re-sending the same hello is harmless.
    deliver(&mut client, &out[..1], 2);
    assert!(client
        .store()
        .chunk(ChunkCoord::new(10, 10).index().unwrap())
        .is_some_and(|c| c.versions.snapshot == 1));

    let hello_b = Envelope::from_message(server_b.hello(), 0, 0);
    client.on_envelope(&hello_b, 3);
    assert_eq!(client.hello().unwrap().world_seed, 99);
    assert!(client.store().iter().all(|(_, c)| c.versions.snapshot == 0));
    assert!(!client.is_join_ready());
}

/// Garbage payloads are rejected without touching the store.
#[test]
fn test_malformed_messages_ignored() {
    let cfg = TestConfigBuilder::new().seed(6).radius(0).no_edits().build();
    let world = seed_world(cfg.world.seed, cfg.world.sea_level);
    let mut server = ServerSession::new(&cfg).unwrap();
    let mut client = ClientSession::new(&cfg).unwrap();
    deliver(&mut client, &server.tick(&world, 1), 1);
    let before = *client.counters();

    let junk = Bytes::from_static(&[1, 2, 3]);
    for ty in [MessageType::ChunkPatchRect, MessageType::ChunkSnapshotFrag, MessageType::Unknown(77)] {
        let env = Envelope {
            header: EnvelopeHeader::new(Lane::ReliableOrdered, ty, 9, 9, junk.len() as u32),
            payload: junk.clone(),
        };
        assert!(client.on_envelope(&env, 2).is_empty());
    }
    assert_eq!(client.counters().snapshots_applied, before.snapshots_applied);
    assert_eq!(client.counters().patch_applies, before.patch_applies);
    assert!(client
        .store()
        .chunk(ChunkCoord::new(10, 10).index().unwrap())
        .unwrap()
        .same_fields(world.chunk(ChunkCoord::new(10, 10).index().unwrap()).unwrap()));

    // Server side: a hello from the client is logged and ignored.
    let hello = Envelope::from_message(server.hello(), 0, 0);
    server.on_envelope(&hello);
    assert_eq!(server.scheduler().pending_resyncs(), 0);
}
