// Random operations and write orders, with the disk checked after every write

use softdep_core::{BufId, SoftdepConfig, ROOT_INO};
use softdep_tracker::{
    completion_channel, run_scenario, CompletionResult, IoCompletion, IoStatus, MemDisk, Scenario,
};
use std::sync::Once;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .try_init();
    });
}

#[test]
fn test_fuzz_write_orders() {
    init_logging();
    for seed in 1..=12 {
        let report = run_scenario(SoftdepConfig::default(), &Scenario::Fuzz { seed, ops: 300 }).unwrap();
        assert!(report.violations.is_empty(), "seed {}: {:?}", seed, report.violations);
        assert!(report.idle, "seed {} did not drain", seed);
        assert!(!report.needs_fsck, "seed {} needs fsck", seed);
        assert!(report.writes > 0);
    }
}

#[test]
fn test_fuzz_small_fragments() {
    init_logging();
    let config = SoftdepConfig {
        block_size: 8192,
        frag_size: 1024,
        ..Default::default()
    };
    let report = run_scenario(config, &Scenario::Fuzz { seed: 99, ops: 200 }).unwrap();
    assert!(report.passed(), "{:?}", report.violations);
}

#[test]
fn test_fuzz_is_deterministic() {
    init_logging();
    let a = run_scenario(SoftdepConfig::default(), &Scenario::Fuzz { seed: 7, ops: 150 }).unwrap();
    let b = run_scenario(SoftdepConfig::default(), &Scenario::Fuzz { seed: 7, ops: 150 }).unwrap();
    assert_eq!(a.writes, b.writes);
    assert_eq!(a.stats, b.stats);
}

#[tokio::test]
async fn test_completions_out_of_band() {
    init_logging();
    let disk = MemDisk::new(SoftdepConfig::default()).unwrap();
    disk.set_write_checks(true);
    let dir = disk.mkdir(ROOT_INO, "async").unwrap();
    let file = disk.create(dir, "f").unwrap();
    disk.append_block(file).unwrap();

    let (queue, worker, mut done) = completion_channel(disk.softdep().clone());
    let handle = tokio::spawn(worker.run());

    let dirty = disk.dirty_buffers().unwrap();
    for id in dirty.iter().rev() {
        let (buf, token) = disk.start_write(*id).unwrap();
        queue
            .complete(IoCompletion { buf, token, status: IoStatus::Success })
            .unwrap();
    }
    for _ in 0..dirty.len() {
        let completed = done.recv().await.unwrap();
        assert!(matches!(completed.result, Ok(CompletionResult::Written(_))));
        disk.return_buffer(completed.buf);
    }
    drop(queue);
    assert_eq!(handle.await.unwrap(), dirty.len());

    assert!(disk.take_violations().is_empty());
    disk.sync().unwrap();
    assert!(disk.softdep().is_idle().unwrap());
    assert!(disk.check_consistency().is_empty());
}

#[test]
fn test_failed_write_keeps_dependencies() {
    init_logging();
    let disk = MemDisk::new(SoftdepConfig::default()).unwrap();
    disk.set_write_checks(true);
    disk.create(ROOT_INO, "f").unwrap();
    let page = BufId(disk.inode(ROOT_INO).unwrap().din.db[0]);

    let (queue, worker, mut done) = completion_channel(disk.softdep().clone());
    let (buf, token) = disk.start_write(page).unwrap();
    queue
        .complete(IoCompletion {
            buf,
            token,
            status: IoStatus::Failed("sector not found".to_string()),
        })
        .unwrap();
    drop(queue);

    let applied = tokio_test::block_on(worker.run());
    assert_eq!(applied, 1);
    let completed = done.try_recv().unwrap();
    match &completed.result {
        Ok(CompletionResult::Failed(inos)) => assert!(inos.contains(&ROOT_INO)),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(completed.buf.dirty);
    disk.return_buffer(completed.buf);
    assert_eq!(disk.softdep().take_io_error(ROOT_INO).as_deref(), Some("sector not found"));

    disk.sync().unwrap();
    assert!(disk.take_violations().is_empty());
    assert!(disk.softdep().is_idle().unwrap());
}
