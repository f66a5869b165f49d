// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use arbiter_service::Flow;
use arbiter_service::disk::Stage;
use arbiter_service::policy::mount_path::SENTINEL_FILE;
use arbiter_types::{Caller, Interest, Notification, PeekVerdict, Reply, RequestKind};

use common::{FakeMountTable, FakePlugin, Harness, ProbeBehavior, ScriptedSession, usb_stick};

#[tokio::test]
async fn empty_drive_is_never_probed_or_mounted() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();
    let listener = ScriptedSession::listener();
    h.handle.register_session(listener.clone());

    let mut card_reader = usb_stick("sdb", "sdb");
    card_reader.media_size = 0;
    let disk = h.arrive(card_reader);
    h.settle().await;

    let description = h.description(&disk);
    assert!(!description.volume_mountable);
    assert!(!description.is_mounted());
    assert_eq!(FakePlugin::count(&vfat.probes), 0);
    assert!(matches!(
        listener.heard().as_slice(),
        [Notification::Appeared { .. }]
    ));
}

#[tokio::test]
async fn stick_is_mounted_before_it_appears() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();
    let listener = ScriptedSession::listener();
    h.handle.register_session(listener.clone());

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.settle().await;

    let expected = h.base().join("CAMERA");
    let description = h.description(&disk);
    assert_eq!(description.volume_kind.as_deref(), Some("vfat"));
    assert_eq!(description.volume_path.as_ref(), Some(&expected));
    assert!(expected.join(SENTINEL_FILE).exists());
    assert_eq!(table.mount_point_of(&description.device_path), Some(expected.clone()));

    // Untrusted removable media never gets setuid or device nodes
    let options = vfat.mount_options.lock().unwrap()[0].clone();
    assert!(options.contains(&"nosuid".to_string()));
    assert!(options.contains(&"nodev".to_string()));

    let engine_disk = h.engine().disk(&disk).expect("registered");
    assert!(engine_disk.is_settled());
    assert_eq!(engine_disk.context.mount_owner, Some(1000));

    let heard = listener.heard();
    assert_eq!(heard.len(), 1);
    match &heard[0] {
        Notification::Appeared { description, .. } => {
            assert_eq!(description.volume_path.as_ref(), Some(&expected));
        }
        other => panic!("expected Appeared, got {other:?}"),
    }
}

#[tokio::test]
async fn signals_before_a_pass_coalesce() {
    let table = FakeMountTable::shared();
    let mut h = Harness::builder(&table).build();

    for _ in 0..5 {
        h.event_loop.engine_mut().signal();
    }
    h.settle().await;

    assert_eq!(h.engine().passes(), 1);
    assert!(h.engine().is_idle());
}

#[tokio::test]
async fn unnamed_volumes_get_numbered_mount_points() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, None);
    let mut h = Harness::builder(&table).plugin(vfat).build();

    let first = h.arrive(usb_stick("sdb1", "sdb"));
    let second = h.arrive(usb_stick("sdc1", "sdc"));
    h.settle().await;

    let paths: BTreeSet<PathBuf> = [first, second]
        .iter()
        .map(|disk| h.description(disk).volume_path.expect("mounted"))
        .collect();
    let expected: BTreeSet<PathBuf> = [h.base().join("Untitled"), h.base().join("Untitled 1")]
        .into_iter()
        .collect();
    assert_eq!(paths, expected);
}

#[tokio::test]
async fn later_candidate_recognizes_after_an_earlier_one_fails() {
    let table = FakeMountTable::shared();
    let broken = FakePlugin::new("ntfs", &table, ProbeBehavior::Fail);
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let mut h = Harness::builder(&table)
        .plugin(broken.clone())
        .plugin(vfat.clone())
        .build();

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.settle().await;

    assert_eq!(FakePlugin::count(&broken.probes), 1);
    assert_eq!(FakePlugin::count(&vfat.probes), 1);
    let description = h.description(&disk);
    assert_eq!(description.volume_kind.as_deref(), Some("vfat"));
    assert!(description.is_mounted());
    assert!(!h.engine().disk(&disk).expect("registered").require_reprobe);
}

#[tokio::test]
async fn peek_veto_only_stops_the_automatic_mount() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();
    let watcher = ScriptedSession::with_peek(Interest::Peek | Interest::Notify, PeekVerdict::Veto);
    h.handle.register_session(watcher.clone());

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.settle().await;

    assert!(!h.description(&disk).is_mounted());
    assert_eq!(FakePlugin::count(&vfat.mounts), 0);
    assert!(h.engine().disk(&disk).expect("registered").has_appeared());

    let ticket = h.submit(RequestKind::Mount, &disk, Caller::root());
    let outcome = h.finish(ticket).await;
    assert_eq!(outcome, Ok(Reply::Mounted(h.base().join("CAMERA"))));
}

#[tokio::test]
async fn probe_failure_is_announced_and_refresh_starts_over() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::new("vfat", &table, ProbeBehavior::Fail);
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();
    let listener = ScriptedSession::listener();
    h.handle.register_session(listener.clone());

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.settle().await;

    assert!(h.engine().disk(&disk).expect("registered").require_reprobe);
    assert!(!h.description(&disk).volume_mountable);
    assert!(listener.heard().iter().any(|notification| matches!(
        notification,
        Notification::DescriptionChanged { disk: changed, .. } if *changed == disk
    )));

    vfat.set_behavior(ProbeBehavior::Recognize {
        name: Some("CAMERA".to_string()),
        clean: true,
    });
    let ticket = h.submit(RequestKind::Refresh, &disk, Caller::root());
    assert_eq!(h.finish(ticket).await, Ok(Reply::Done));

    let description = h.description(&disk);
    assert_eq!(description.volume_kind.as_deref(), Some("vfat"));
    assert!(description.is_mounted());
    assert!(!h.engine().disk(&disk).expect("registered").require_reprobe);
}

#[tokio::test(start_paused = true)]
async fn busy_deadline_holds_probing_back() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();

    let disk = h.arrive_busy(usb_stick("sdb1", "sdb"), Duration::from_secs(5));
    let early = tokio::time::timeout(Duration::from_secs(4), h.event_loop.run_until_idle()).await;
    assert!(early.is_err(), "engine went idle while the disk was busy");
    assert_eq!(FakePlugin::count(&vfat.probes), 0);
    assert!(!h.engine().unit("sdb").quiesced);

    h.settle().await;
    assert_eq!(FakePlugin::count(&vfat.probes), 1);
    assert!(h.description(&disk).is_mounted());
    let unit = h.engine().unit("sdb");
    assert!(unit.quiesced);
    assert!(!unit.quiesced_without_timeout);
}

#[tokio::test]
async fn partition_waits_for_its_unprobed_whole_disk() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    vfat.ignore("/dev/sdb");
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();

    let whole = h.arrive_busy(usb_stick("sdb", "sdb"), Duration::from_secs(600));
    let partition = h.arrive(usb_stick("sdb1", "sdb"));

    h.turn_until(|engine| {
        engine
            .disk(&partition)
            .is_some_and(|disk| disk.stages.contains(Stage::Peek))
    })
    .await;
    let waiting = h.engine().disk(&partition).expect("registered");
    assert!(!waiting.stages.contains(Stage::Mount));
    assert!(!waiting.description.is_mounted());

    h.handle.busy_changed(whole.clone(), None);
    h.settle().await;

    assert!(h.description(&partition).is_mounted());
    assert!(!h.description(&whole).volume_mountable);
    assert!(h.engine().unit("sdb").quiesced_without_timeout);
}

#[tokio::test]
async fn liveness_is_released_only_while_idle() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let mut h = Harness::builder(&table).plugin(vfat).build();
    let liveness = h.handle.liveness();

    h.arrive(usb_stick("sdb1", "sdb"));
    h.settle().await;
    assert!(!*liveness.borrow());

    h.arrive(usb_stick("sdc1", "sdc"));
    h.turn_until(|engine| !engine.is_idle()).await;
    assert!(*liveness.borrow());

    h.settle().await;
    assert!(!*liveness.borrow());
}

#[tokio::test]
async fn removed_disk_lingers_until_its_probe_returns() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let gate = vfat.gate_probes();
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.turn_until(|engine| engine.disk(&disk).is_some_and(|d| d.in_flight > 0))
        .await;

    h.handle.device_removed(disk.clone());
    h.turn_until(|engine| engine.disk(&disk).is_some_and(|d| d.zombie))
        .await;
    assert!(h.engine().description(&disk).is_none());

    let ticket = h.submit(RequestKind::Mount, &disk, Caller::root());

    gate.open();
    h.settle().await;
    assert!(h.engine().disk(&disk).is_none());
    assert_eq!(h.engine().disk_count(), 0);
    assert_eq!(FakePlugin::count(&vfat.mounts), 0);
    let outcome = ticket.outcome().await;
    assert_eq!(
        outcome.map_err(|d| d.kind()),
        Err(arbiter_types::ErrorKind::NotFound)
    );
}

#[tokio::test(start_paused = true)]
async fn removed_disk_is_dropped_when_its_job_outlives_the_grace_period() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let gate = vfat.gate_probes();
    let mut h = Harness::builder(&table)
        .plugin(vfat.clone())
        .preferences(|p| p.zombie_timeout_secs = 10)
        .build();

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.turn_until(|engine| engine.disk(&disk).is_some_and(|d| d.in_flight > 0))
        .await;

    let removed_at = tokio::time::Instant::now();
    h.handle.device_removed(disk.clone());
    h.turn_until(|engine| engine.disk_count() == 0).await;
    assert!(removed_at.elapsed() >= Duration::from_secs(10));

    // The record that outlived its grace period is gone; the late result
    // must not resurrect it
    gate.open();
    h.settle().await;
    assert_eq!(h.engine().disk_count(), 0);
    assert_eq!(FakePlugin::count(&vfat.mounts), 0);
}

#[tokio::test]
async fn media_change_discards_the_old_media_probe() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let gate = vfat.gate_probes();
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();
    let listener = ScriptedSession::listener();
    h.handle.register_session(listener.clone());

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.turn_until(|engine| engine.disk(&disk).is_some_and(|d| d.in_flight > 0))
        .await;
    let generation = h.engine().disk(&disk).expect("registered").generation;

    let mut emptied = usb_stick("sdb1", "sdb");
    emptied.media_size = 0;
    h.arrive(emptied);
    h.turn_until(|engine| engine.disk(&disk).is_some_and(|d| d.has_appeared()))
        .await;
    assert!(h.engine().disk(&disk).expect("registered").generation > generation);

    gate.open();
    h.settle().await;

    let description = h.description(&disk);
    assert_eq!(description.media_size, 0);
    assert!(!description.volume_mountable);
    assert_eq!(description.volume_kind, None);
    assert!(!description.is_mounted());
    assert_eq!(FakePlugin::count(&vfat.probes), 1);
    assert_eq!(FakePlugin::count(&vfat.mounts), 0);
    let record = h.engine().disk(&disk).expect("registered");
    assert_eq!(record.in_flight, 0);
    assert!(!record.command_active);
    assert!(
        !listener
            .heard()
            .iter()
            .any(|n| matches!(n, Notification::DescriptionChanged { .. })),
        "the stale result leaked into a notification"
    );
}

#[tokio::test(start_paused = true)]
async fn idle_exit_fires_only_after_an_uninterrupted_timeout() {
    let table = FakeMountTable::shared();
    let mut h = Harness::builder(&table)
        .preferences(|p| {
            p.exit_on_idle = true;
            p.idle_timeout_secs = 30;
        })
        .build();
    h.settle().await;
    assert!(h.engine().is_idle());

    let short = Duration::from_secs(20);
    assert!(tokio::time::timeout(short, h.event_loop.turn()).await.is_err());

    // Waking restarts the countdown; the first timer would have fired
    // ten seconds into the next window
    h.event_loop.engine_mut().signal();
    h.settle().await;
    assert!(tokio::time::timeout(short, h.event_loop.turn()).await.is_err());

    let flow = tokio::time::timeout(short, h.event_loop.turn()).await;
    assert!(matches!(flow, Ok(Flow::Exit)), "got {flow:?}");
}

#[tokio::test]
async fn preference_changes_are_read_when_the_engine_wakes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arbiter.toml");
    let write = |auto_mount: bool| {
        let raw = format!(
            "auto_mount = {auto_mount}\nfstab_path = {:?}\nvolinfo_path = {:?}\n",
            dir.path().join("fstab"),
            dir.path().join("volinfo")
        );
        std::fs::write(&path, raw).unwrap();
    };
    write(false);

    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    let mut h = Harness::builder(&table)
        .plugin(vfat.clone())
        .config_file(&path)
        .build();

    let first = h.arrive(usb_stick("sdb1", "sdb"));
    h.settle().await;
    assert!(!h.description(&first).is_mounted());

    write(true);
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(std::time::SystemTime::now() + Duration::from_secs(5))
        .unwrap();

    let second = h.arrive(usb_stick("sdc1", "sdc"));
    h.settle().await;
    assert!(h.engine().preferences().auto_mount);
    assert!(h.description(&second).is_mounted());
    assert!(!h.description(&first).is_mounted());
}

#[tokio::test]
async fn dirty_volume_that_cannot_be_repaired_mounts_read_only() {
    let table = FakeMountTable::shared();
    let ext4 = FakePlugin::new(
        "ext4",
        &table,
        ProbeBehavior::Recognize {
            name: Some("DATA".to_string()),
            clean: false,
        },
    );
    let mut h = Harness::builder(&table).plugin(ext4.clone()).build();

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.settle().await;

    assert!(h.description(&disk).is_mounted());
    let options = ext4.mount_options.lock().unwrap()[0].clone();
    assert_eq!(options.first().map(String::as_str), Some("ro"));
    assert!(!options.contains(&"rw".to_string()));
    assert!(h.engine().disk(&disk).expect("registered").requires_repair);
}

#[tokio::test]
async fn failed_automatic_mount_still_appears_and_cleans_up() {
    let table = FakeMountTable::shared();
    let vfat = FakePlugin::recognizing("vfat", &table, Some("CAMERA"));
    vfat.fail_mounts();
    let mut h = Harness::builder(&table).plugin(vfat.clone()).build();
    let listener = ScriptedSession::listener();
    h.handle.register_session(listener.clone());

    let disk = h.arrive(usb_stick("sdb1", "sdb"));
    h.settle().await;

    assert_eq!(FakePlugin::count(&vfat.mounts), 1);
    assert!(!h.description(&disk).is_mounted());
    assert!(h.description(&disk).volume_mountable);
    assert!(!h.base().join("CAMERA").exists());
    assert!(matches!(
        listener.heard().as_slice(),
        [Notification::Appeared { .. }]
    ));
}
