//! Checkpoint round-trip and resume determinism.

use bsgs::{BsgsEngine, BsgsParams, JacobianPoint, KeyRange, Target, U256};
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn pubkey_target(k: &U256) -> Target {
    Target::PubKey(JacobianPoint::mul_generator(k).to_affine())
}

fn scratch_file(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("bsgs-{tag}-{}.ckpt", std::process::id()))
}

/// Single-threaded sequential params keep the sweep deterministic.
fn deterministic_params() -> BsgsParams {
    let range = KeyRange::new(U256::ONE, U256::from_hex("1fffff").unwrap()).unwrap();
    let mut params = BsgsParams::new(range);
    params.m = Some(1024);
    params.num_threads = 1;
    params
}

#[test]
fn interrupted_run_matches_uninterrupted_run() {
    let key = U256::from_hex("15a37b").unwrap();
    let path = scratch_file("resume");

    // uninterrupted reference run
    let mut reference = BsgsEngine::new(deterministic_params());
    reference.initialize(vec![pubkey_target(&key)]).unwrap();
    let reference_results = reference.run().unwrap();
    assert_eq!(reference_results.len(), 1);
    let reference_keys_checked = reference.get_progress().keys_checked;

    // interrupted run: stop somewhere in the first half of the sweep
    let mut first = BsgsEngine::new(deterministic_params());
    first.initialize(vec![pubkey_target(&key)]).unwrap();
    first.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(60);
    while first.get_progress().keys_checked == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    first.pause();
    std::thread::sleep(Duration::from_millis(50));
    first.save_checkpoint(&path).unwrap();
    first.stop();
    first.wait();

    // resumed run from the snapshot
    let mut resumed = BsgsEngine::new(deterministic_params());
    resumed.load_checkpoint(&path).unwrap();
    let resumed_results = resumed.run().unwrap();
    std::fs::remove_file(&path).ok();

    let mut all_keys: Vec<U256> = resumed_results
        .iter()
        .map(|r| r.private_key.to_u256())
        .collect();
    all_keys.sort();
    all_keys.dedup();
    assert_eq!(all_keys, vec![key], "resumed run must recover the same key");
    assert_eq!(
        resumed.get_progress().keys_checked,
        reference_keys_checked,
        "resumed coverage must equal an uninterrupted run"
    );
}

#[test]
fn checkpoint_restores_params_and_targets() {
    let key = U256::from_hex("1234f").unwrap();
    let path = scratch_file("restore");

    let mut engine = BsgsEngine::new(deterministic_params());
    engine.initialize(vec![pubkey_target(&key)]).unwrap();
    engine.start().unwrap();
    engine.pause();
    std::thread::sleep(Duration::from_millis(50));
    engine.save_checkpoint(&path).unwrap();
    engine.stop();
    engine.wait();

    let mut restored = BsgsEngine::new(BsgsParams::new(
        KeyRange::new(U256::ONE, U256::from_u64(2)).unwrap(),
    ));
    restored.load_checkpoint(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(restored.params().m, Some(1024));
    assert_eq!(
        restored.params().range,
        KeyRange::new(U256::ONE, U256::from_hex("1fffff").unwrap()).unwrap()
    );
}

#[test]
fn checkpoint_preserves_found_results() {
    let key = U256::from_u64(0x777);
    let path = scratch_file("results");

    let range = KeyRange::new(U256::ONE, U256::from_u64(0xFFF)).unwrap();
    let mut params = BsgsParams::new(range);
    params.m = Some(64);
    params.num_threads = 1;

    let mut engine = BsgsEngine::new(params);
    engine.initialize(vec![pubkey_target(&key)]).unwrap();
    let results = engine.run().unwrap();
    assert_eq!(results.len(), 1);
    engine.save_checkpoint(&path).unwrap();

    let mut restored = BsgsEngine::new(deterministic_params());
    restored.load_checkpoint(&path).unwrap();
    std::fs::remove_file(&path).ok();
    let restored_results = restored.get_results();
    assert_eq!(restored_results.len(), 1);
    assert_eq!(restored_results[0].private_key.to_u256(), key);
}

#[test]
fn load_rejects_tampered_file() {
    let key = U256::from_u64(0x42);
    let path = scratch_file("tamper");

    let range = KeyRange::new(U256::ONE, U256::from_u64(0xFFF)).unwrap();
    let mut params = BsgsParams::new(range);
    params.m = Some(64);
    params.num_threads = 1;
    let mut engine = BsgsEngine::new(params);
    engine.initialize(vec![pubkey_target(&key)]).unwrap();
    engine.run().unwrap();
    engine.save_checkpoint(&path).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let mut fresh = BsgsEngine::new(deterministic_params());
    assert!(fresh.load_checkpoint(&path).is_err());
    std::fs::remove_file(&path).ok();
}
