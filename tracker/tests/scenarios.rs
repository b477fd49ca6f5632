// Reference scenarios against the in-memory disk

use softdep_core::types::mode;
use softdep_core::{BlockBuf, BlockNo, BufId, InCoreInode, Ino, SoftdepConfig, SoftdepError, ROOT_INO};
use softdep_tracker::scenario::write_reverse;
use softdep_tracker::{run_scenario, FsBackend, LinkCounts, MemDisk, Scenario, Softdep, Syncer};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

fn disk() -> MemDisk {
    init_logging();
    let disk = MemDisk::new(SoftdepConfig::default()).unwrap();
    disk.set_write_checks(true);
    disk
}

#[test]
fn test_reference_scenarios_pass() {
    init_logging();
    for scenario in [Scenario::Extend, Scenario::Mkdir, Scenario::Rename, Scenario::Truncate] {
        let report = run_scenario(SoftdepConfig::default(), &scenario).unwrap();
        assert!(report.violations.is_empty(), "{}: {:?}", scenario, report.violations);
        assert!(report.idle, "{} left dependencies behind", scenario);
        assert!(report.passed());
        assert_eq!(report.stats.records_created, report.stats.records_freed);
    }
}

#[test]
fn test_extend_rolls_back_unsafe_pointers() {
    let disk = disk();
    let ino = disk.create(ROOT_INO, "grow").unwrap();
    write_reverse(&disk).unwrap();
    let stats = disk.softdep().stats();
    assert!(stats.dirent_rollbacks >= 1);
    assert!(stats.inode_image_rollbacks >= 1);

    for _ in 0..14 {
        disk.append_block(ino).unwrap();
    }
    write_reverse(&disk).unwrap();
    assert!(disk.softdep().stats().direct_rollbacks >= 1);
    assert!(disk.take_violations().is_empty());

    disk.sync().unwrap();
    let ip = disk.inode(ino).unwrap();
    assert_eq!(ip.din.size, 14 * 4096);
    assert_eq!(ip.din.blocks, 15 * 4);
    assert_ne!(ip.din.ib[0], 0);
    assert!(disk.check_consistency().is_empty());
    assert!(disk.softdep().record_counts().is_empty());
}

#[test]
fn test_mkdir_links() {
    let disk = disk();
    let a = disk.mkdir(ROOT_INO, "a").unwrap();
    write_reverse(&disk).unwrap();
    assert!(disk.take_violations().is_empty());
    disk.sync().unwrap();

    assert_eq!(disk.inode(ROOT_INO).unwrap().din.nlink, 3);
    assert_eq!(disk.inode(a).unwrap().din.nlink, 2);
    assert_eq!(disk.lookup(ROOT_INO, "a").unwrap(), Some(a));

    disk.rmdir(ROOT_INO, "a").unwrap();
    disk.sync().unwrap();
    assert!(disk.take_violations().is_empty());
    assert_eq!(disk.inode(ROOT_INO).unwrap().din.nlink, 2);
    assert_eq!(disk.softdep().stats().inodes_released, 1);
    assert!(disk.softdep().is_idle().unwrap());
}

#[test]
fn test_rmdir_before_anything_written() {
    let disk = disk();
    disk.mkdir(ROOT_INO, "brief").unwrap();
    disk.rmdir(ROOT_INO, "brief").unwrap();
    write_reverse(&disk).unwrap();
    disk.sync().unwrap();
    assert!(disk.take_violations().is_empty());
    assert_eq!(disk.list_dir(ROOT_INO).unwrap(), vec![]);
    assert!(disk.softdep().is_idle().unwrap());
}

#[test]
fn test_rename_over_existing_entry() {
    let disk = disk();
    let src = disk.create(ROOT_INO, "new").unwrap();
    let dst = disk.create(ROOT_INO, "old").unwrap();
    disk.sync().unwrap();

    disk.rename(ROOT_INO, "new", ROOT_INO, "old").unwrap();
    assert_eq!(disk.lookup(ROOT_INO, "old").unwrap(), Some(src));
    assert_eq!(disk.lookup(ROOT_INO, "new").unwrap(), None);
    write_reverse(&disk).unwrap();
    assert!(disk.take_violations().is_empty());

    disk.sync().unwrap();
    assert_eq!(disk.inode(src).unwrap().din.nlink, 1);
    assert_eq!(disk.softdep().stats().inodes_released, 1);
    // The replaced inode is free again.
    assert_eq!(disk.create(ROOT_INO, "third").unwrap(), dst);
}

#[test]
fn test_truncate_returns_space() {
    let disk = disk();
    let ino = disk.create(ROOT_INO, "shrink").unwrap();
    for _ in 0..14 {
        disk.append_block(ino).unwrap();
    }
    disk.sync().unwrap();
    disk.truncate(ino).unwrap();
    write_reverse(&disk).unwrap();
    disk.sync().unwrap();

    let stats = disk.softdep().stats();
    // 14 data blocks and the indirect block
    assert_eq!(stats.frags_released, 15 * 4);
    assert_eq!(stats.pending_free_frags, 0);
    assert_eq!(disk.inode(ino).unwrap().din.size, 0);
    assert!(disk.take_violations().is_empty());
}

#[test]
fn test_drain_leaves_graph_empty() {
    let disk = disk();
    let d = disk.mkdir(ROOT_INO, "d").unwrap();
    for n in 0..5 {
        let f = disk.create(d, &format!("f{}", n)).unwrap();
        disk.append_block(f).unwrap();
    }
    disk.unlink(d, "f2").unwrap();
    disk.rename(d, "f3", ROOT_INO, "moved").unwrap();
    disk.sync().unwrap();

    assert!(disk.softdep().record_counts().is_empty());
    assert_eq!(disk.softdep().queued_work(), 0);
    assert!(disk.check_consistency().is_empty());
}

/// Backend that only counts what it is asked to release
#[derive(Default)]
struct CountingBackend {
    released: Mutex<Vec<(BlockNo, u32)>>,
}

impl FsBackend for CountingBackend {
    fn release_blocks(&self, _ino: Ino, _uid: u32, blkno: BlockNo, size: u32) -> Result<(), SoftdepError> {
        self.released.lock().unwrap().push((blkno, size));
        Ok(())
    }

    fn release_inode(&self, _ino: Ino, _mode: u16) -> Result<(), SoftdepError> {
        Ok(())
    }

    fn read_indirect(&self, _blkno: BlockNo) -> Result<Vec<u8>, SoftdepError> {
        Ok(vec![0; 4096])
    }

    fn drop_links(&self, _ino: Ino, _count: u16) -> Result<LinkCounts, SoftdepError> {
        Ok(LinkCounts { nlink: 0, effnlink: 0 })
    }

    fn truncate_directory(&self, _softdep: &Softdep, _ino: Ino) -> Result<(), SoftdepError> {
        Ok(())
    }
}

#[test]
fn test_truncate_count_mismatch_needs_fsck() {
    init_logging();
    let softdep = Softdep::new(SoftdepConfig::default()).unwrap();
    let backend = CountingBackend::default();

    // The inode claims two blocks but points at one.
    let mut ip = InCoreInode::new(20, mode::IFREG, 0);
    ip.din.nlink = 1;
    ip.effnlink = 1;
    ip.din.size = 4096;
    ip.din.blocks = 8;
    ip.din.db[0] = 400;
    let mut inode_buf = BlockBuf::new(BufId(16), 16, 4096);
    softdep.on_truncate(&mut ip, &mut inode_buf, &mut [], 0).unwrap();

    let token = softdep.before_buffer_write(&mut inode_buf).unwrap();
    softdep.after_buffer_write(&mut inode_buf, token).unwrap();
    let err = softdep.process_worklist(&backend).unwrap_err();
    assert!(matches!(
        err,
        SoftdepError::AccountingMismatch { ino: 20, expected: 8, released: 4 }
    ));
    assert_eq!(backend.released.lock().unwrap().as_slice(), &[(400, 4096)]);
    assert!(softdep.needs_fsck());
    assert!(matches!(softdep.is_idle(), Err(SoftdepError::NeedsFsck)));
}

#[test]
fn test_syncer_runs_removals() {
    init_logging();
    let config = SoftdepConfig {
        syncer_interval_ms: 10,
        ..Default::default()
    };
    let disk = Arc::new(MemDisk::new(config).unwrap());
    let ino = disk.create(ROOT_INO, "doomed").unwrap();
    disk.sync().unwrap();
    disk.unlink(ROOT_INO, "doomed").unwrap();
    disk.flush().unwrap();
    assert!(disk.softdep().queued_work() > 0);

    let mut syncer = Syncer::spawn(disk.softdep().clone(), disk.clone(), Duration::from_millis(10));
    let deadline = Instant::now() + Duration::from_secs(5);
    while disk.softdep().queued_work() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    syncer.shutdown();
    assert_eq!(disk.softdep().queued_work(), 0);

    disk.sync().unwrap();
    assert_eq!(disk.softdep().stats().inodes_released, 1);
    assert_eq!(disk.lookup(ROOT_INO, "doomed").unwrap(), None);
    assert_eq!(disk.create(ROOT_INO, "reborn").unwrap(), ino);
}

#[test]
fn test_syncer_flushes_over_limit() {
    init_logging();
    let config = SoftdepConfig {
        max_dependencies: 2,
        ..Default::default()
    };
    let disk = Arc::new(MemDisk::new(config).unwrap());
    for n in 0..4 {
        disk.create(ROOT_INO, &format!("f{}", n)).unwrap();
    }
    assert!(disk.softdep().cleanup_requested());
    assert!(disk.softdep().stats().inodedep_limit_hits > 0);

    let mut syncer = Syncer::spawn(disk.softdep().clone(), disk.clone(), Duration::from_millis(10));
    let deadline = Instant::now() + Duration::from_secs(5);
    while disk.softdep().cleanup_requested() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    syncer.shutdown();
    assert!(!disk.softdep().cleanup_requested());
    assert!(disk.writes() > 0);
}
