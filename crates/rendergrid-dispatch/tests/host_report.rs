//! Host report reconciliation against a seeded farm: frame verification,
//! memory kills, swap distress and the bookability gate.

mod common;

use common::*;
use rendergrid_dispatch::{Booking, Counter, DispatchConfig};
use rendergrid_state::{FrameState, HostReport, epoch_millis};

fn report(rig: &Rig, frames: Vec<rendergrid_state::RunningFrameInfo>) -> HostReport {
    HostReport {
        host: render_host(&rig.host("host-1")),
        frames,
    }
}

// ── Frame verification ─────────────────────────────────────────────

#[tokio::test]
async fn young_frame_is_trusted_without_a_proc() {
    let rig = Rig::new(open(&small_farm(2)), DispatchConfig::default());
    let frame = rig.frame("render-1");
    let rf = running("proc-ghost", &frame, epoch_millis(), GB / 4);

    let outcome = rig.reports.handle(&report(&rig, vec![rf]), false).await.unwrap();

    assert_eq!(outcome.verified.len(), 1);
    assert_eq!(outcome.kills, 0);
    assert_eq!(rig.stats.get(Counter::AccountingErrors), 0);
    assert!(rig.kills().await.is_empty());
}

#[tokio::test]
async fn stale_mismatch_is_killed_once_and_counted() {
    let rig = Rig::new(open(&small_farm(2)), DispatchConfig::default());
    let frame = rig.frame("render-1");
    let rf = running("proc-ghost", &frame, epoch_millis() - 121_000, GB / 4);

    let outcome = rig.reports.handle(&report(&rig, vec![rf]), false).await.unwrap();

    assert!(outcome.verified.is_empty());
    assert_eq!(outcome.kills, 1);
    assert_eq!(rig.stats.get(Counter::AccountingErrors), 1);
    let kills = rig.kills().await;
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].frame_id, "render-1");
    assert_eq!(kills[0].host_name, "beta");
    assert_eq!(kills[0].proc_id.as_deref(), Some("proc-ghost"));
}

#[tokio::test]
async fn one_bad_record_does_not_stop_the_rest() {
    let rig = Rig::new(open(&small_farm(3)), DispatchConfig::default());
    let procs = rig.dispatcher.dispatch_host_to_job("host-1", "job-1").await.unwrap();
    let good = running(&procs[0].id, &rig.frame("render-1"), epoch_millis() - 600_000, GB / 2);
    let bad = running("proc-ghost", &rig.frame("render-3"), epoch_millis() - 600_000, GB / 2);

    let outcome = rig.reports.handle(&report(&rig, vec![bad, good]), false).await.unwrap();

    assert_eq!(outcome.verified.len(), 1);
    assert_eq!(outcome.verified[0].frame_id, "render-1");
    assert_eq!(rig.frame("render-1").max_rss, GB / 2);
    assert_eq!(rig.kills().await.len(), 1);
}

// ── Memory ─────────────────────────────────────────────────────────

#[tokio::test]
async fn frame_larger_than_host_is_killed_each_time() {
    let rig = Rig::new(open(&small_farm(2)), DispatchConfig::default());
    let procs = rig.dispatcher.dispatch_host("host-1").await.unwrap();
    let proc = &procs[0];
    let frame = rig.frame("render-1");

    for occurrence in 1..=2u64 {
        let rf = running(&proc.id, &frame, epoch_millis(), 9 * GB);
        let outcome = rig.reports.handle(&report(&rig, vec![rf]), false).await.unwrap();
        assert_eq!(outcome.kills, 1);
        assert_eq!(rig.stats.get(Counter::KilledOomProcs), occurrence);
    }

    let kills = rig.kills().await;
    assert_eq!(kills.len(), 2);
    assert!(kills.iter().all(|k| k.frame_id == "render-1"));
    // The reservation is left alone; only the kill path applies.
    assert_eq!(rig.store.get_proc(&proc.id).unwrap().unwrap().memory_reserved, GB);
}

#[tokio::test]
async fn swapping_host_loses_its_worst_offender() {
    let rig = Rig::new(open(&small_farm(2)), DispatchConfig::default());
    let first = rig.dispatcher.dispatch_host("host-1").await.unwrap().remove(0);
    let second = rig.dispatcher.dispatch_host("host-1").await.unwrap().remove(0);
    assert_eq!(second.frame_id.as_deref(), Some("render-2"));

    let mut report = report(
        &rig,
        vec![
            running(&first.id, &rig.frame("render-1"), epoch_millis(), GB / 2),
            running(&second.id, &rig.frame("render-2"), epoch_millis(), 3 * GB),
        ],
    );
    report.host.free_swap = 0;
    let outcome = rig.reports.handle(&report, false).await.unwrap();

    assert_eq!(outcome.kills, 1);
    assert_eq!(rig.stats.get(Counter::KilledOffenderProcs), 1);
    let kills = rig.kills().await;
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].proc_id.as_deref(), Some(second.id.as_str()));
}

#[tokio::test]
async fn idle_proc_with_stale_memory_does_not_shield_the_offender() {
    let rig = Rig::new(open(&small_farm(2)), DispatchConfig::default());
    let first = rig.dispatcher.dispatch_host("host-1").await.unwrap().remove(0);
    let second = rig.dispatcher.dispatch_host("host-1").await.unwrap().remove(0);

    let heavy = report(
        &rig,
        vec![
            running(&first.id, &rig.frame("render-1"), epoch_millis(), 3 * GB),
            running(&second.id, &rig.frame("render-2"), epoch_millis(), GB),
        ],
    );
    assert_eq!(rig.reports.handle(&heavy, false).await.unwrap().kills, 0);

    // The first proc finishes its frame and idles with its last rss.
    rig.store.clear_proc_assignment(&first.id).unwrap();
    let mut swapping = report(
        &rig,
        vec![running(&second.id, &rig.frame("render-2"), epoch_millis(), GB)],
    );
    swapping.host.free_swap = 0;
    let outcome = rig.reports.handle(&swapping, false).await.unwrap();

    assert_eq!(outcome.kills, 1);
    assert_eq!(rig.stats.get(Counter::KilledOffenderProcs), 1);
    let kills = rig.kills().await;
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].proc_id.as_deref(), Some(second.id.as_str()));
    assert_eq!(kills[0].frame_id, "render-2");
}

#[tokio::test]
async fn swapping_host_without_procs_is_left_alone() {
    let rig = Rig::new(open(&small_farm(0)), DispatchConfig::default());
    let mut report = report(&rig, Vec::new());
    report.host.free_swap = 0;

    let outcome = rig.reports.handle(&report, false).await.unwrap();

    assert_eq!(outcome.kills, 0);
    assert_eq!(rig.stats.get(Counter::KilledOffenderProcs), 0);
    assert!(rig.kills().await.is_empty());
}

// ── Bookability gate ───────────────────────────────────────────────

#[tokio::test]
async fn too_few_idle_cores_means_no_dispatch() {
    let mut config = DispatchConfig::default();
    config.booking.min_idle_cores = 16;
    let rig = Rig::new(open(&small_farm(2)), config);

    let outcome = rig.reports.handle(&report(&rig, Vec::new()), false).await.unwrap();

    assert!(matches!(outcome.booking, Booking::Skipped(ref reason) if reason.contains("idle cores")));
    assert_eq!(rig.frame("render-1").state, FrameState::Waiting);
    assert_eq!(rig.host("host-1").idle_cores, 8);
    assert_eq!(rig.stats.get(Counter::ProcsBooked), 0);
}

#[tokio::test]
async fn down_host_is_brought_up_and_booked() {
    let mut farm = small_farm(1);
    farm.hosts[0].state = rendergrid_state::HardwareState::Down;
    let rig = Rig::new(open(&farm), DispatchConfig::default());

    let outcome = rig.reports.handle(&report(&rig, Vec::new()), false).await.unwrap();

    assert_eq!(outcome.host.state, rendergrid_state::HardwareState::Up);
    assert_eq!(outcome.booking.procs().len(), 1);
}
