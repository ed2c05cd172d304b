//! Downtime protocol: scheduled breaks, going-down soft stops, peer
//! coordination, failure agents

use std::cell::RefCell;
use std::rc::Rc;

use procsim::{
    Dist, DowntimeSchedule, DowntimeView, EndCondition, Sampler, SimConfig, SimError, SimTime,
    Simulation, StreamId, TakedownDecision, TakedownPolicy, ResourceId,
};

type Log = Rc<RefCell<Vec<(&'static str, f64)>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn push(log: &Log, tag: &'static str, at: SimTime) {
    log.borrow_mut().push((tag, at.value()));
}

fn break_at(offset: f64, duration: f64) -> DowntimeSchedule {
    DowntimeSchedule {
        cycle_length: SimTime::new(10_000.0),
        intervals: vec![(SimTime::new(offset), SimTime::new(duration))],
    }
}

#[test]
fn test_scheduled_break_takes_idle_resource_down_and_back_up() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let machine = sim.add_resource("Machine", 1).unwrap();
    sim.add_scheduled_downtime("Machine.Break", machine, break_at(120.0, 15.0))
        .unwrap();

    sim.run_until(EndCondition::Time(SimTime::new(125.0))).unwrap();
    assert!(sim.resource_snapshot(machine).is_down());
    sim.run_until(EndCondition::Time(SimTime::new(140.0))).unwrap();
    assert!(!sim.resource_snapshot(machine).is_down());
}

#[test]
fn test_downed_resource_is_not_assignable() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let machine = sim.add_resource("Machine", 1).unwrap();
    sim.add_scheduled_downtime("Machine.Break", machine, break_at(10.0, 5.0))
        .unwrap();
    let log = new_log();
    let l = Rc::clone(&log);
    sim.spawn("job", 0, move |ctx| async move {
        ctx.wait_for(SimTime::new(12.0)).await?;
        let held = ctx.acquire(machine, 1).await?;
        push(&l, "acquired", ctx.now());
        held.release();
        Ok(())
    })
    .unwrap();
    sim.run_until(EndCondition::NoEvents).unwrap();
    // the request issued mid-break waits for the bring-up at 15
    assert_eq!(*log.borrow(), vec![("acquired", 15.0)]);
}

#[test]
fn test_overlapping_break_intervals_are_rejected() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let machine = sim.add_resource("Machine", 1).unwrap();
    let schedule = DowntimeSchedule {
        cycle_length: SimTime::new(100.0),
        intervals: vec![
            (SimTime::new(0.0), SimTime::new(10.0)),
            (SimTime::new(5.0), SimTime::new(10.0)),
        ],
    };
    let err = sim
        .add_scheduled_downtime("Machine.Break", machine, schedule)
        .unwrap_err();
    assert!(matches!(err, SimError::InvalidRequest(_)));
}

#[test]
fn test_interval_past_cycle_end_is_rejected() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let machine = sim.add_resource("Machine", 1).unwrap();
    let schedule = DowntimeSchedule {
        cycle_length: SimTime::new(100.0),
        intervals: vec![(SimTime::new(95.0), SimTime::new(10.0))],
    };
    assert!(sim
        .add_scheduled_downtime("Machine.Break", machine, schedule)
        .is_err());
}

/// Soft-stop policy with a hard-stop grace period
struct SoftStop {
    grace: f64,
}

impl TakedownPolicy for SoftStop {
    fn start_resource_takedown(&mut self, _view: &DowntimeView<'_>) -> TakedownDecision {
        TakedownDecision::GoingDown {
            timeout: Some(SimTime::new(self.grace)),
        }
    }
}

/// Going-down with a timeout: the holder rides past the break start,
/// gets *ResourceDown* at the grace deadline, catches it and finishes on
/// another resource.
#[test]
fn test_going_down_timeout_interrupts_the_holder() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let teller1 = sim.add_resource("Teller1", 1).unwrap();
    let teller2 = sim.add_resource("Teller2", 1).unwrap();
    sim.add_scheduled_downtime_with_policy(
        "Teller1.Break",
        teller1,
        break_at(120.0, 15.0),
        Box::new(SoftStop { grace: 4.0 }),
    )
    .unwrap();
    let log = new_log();

    let l = Rc::clone(&log);
    sim.spawn("customer", 0, move |ctx| async move {
        ctx.wait_for(SimTime::new(100.0)).await?;
        let held = ctx.acquire(teller1, 1).await?;
        match ctx.wait_for(SimTime::new(30.0)).await {
            Ok(()) => push(&l, "served-at-1", ctx.now()),
            Err(SimError::ResourceDown { resource }) => {
                assert_eq!(resource, teller1);
                push(&l, "interrupted", ctx.now());
                drop(held);
                let second = ctx.acquire(teller2, 1).await?;
                let remaining = 130.0 - ctx.now().value();
                ctx.wait_for(SimTime::new(remaining)).await?;
                push(&l, "served-at-2", ctx.now());
                second.release();
            }
            Err(e) => return Err(e),
        }
        Ok(())
    })
    .unwrap();

    sim.run_until(EndCondition::Time(SimTime::new(126.0))).unwrap();
    // still up at 120 (going down), hard down at the 124 deadline
    assert!(sim.resource_snapshot(teller1).is_down());
    sim.run_until(EndCondition::NoEvents).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![("interrupted", 124.0), ("served-at-2", 130.0)]
    );
    // the break still lasts its full duration from the actual take-down
    assert!(!sim.resource_snapshot(teller1).is_down());
}

#[test]
fn test_going_down_excludes_new_requests_but_keeps_holder() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let machine = sim.add_resource("Machine", 2).unwrap();
    sim.add_scheduled_downtime_with_policy(
        "Machine.Break",
        machine,
        break_at(10.0, 5.0),
        Box::new(SoftStop { grace: 100.0 }),
    )
    .unwrap();
    let log = new_log();

    let l = Rc::clone(&log);
    sim.spawn("holder", 0, move |ctx| async move {
        let held = ctx.acquire(machine, 1).await?;
        ctx.wait_for(SimTime::new(13.0)).await?;
        push(&l, "done", ctx.now());
        held.release();
        Ok(())
    })
    .unwrap();

    let l = Rc::clone(&log);
    sim.spawn("latecomer", 0, move |ctx| async move {
        ctx.wait_for(SimTime::new(11.0)).await?;
        // a unit is nominally free, but the resource is going down
        let held = ctx.acquire(machine, 1).await?;
        push(&l, "late", ctx.now());
        held.release();
        Ok(())
    })
    .unwrap();

    sim.run_until(EndCondition::Time(SimTime::new(12.0))).unwrap();
    let snapshot = sim.resource_snapshot(machine);
    assert!(snapshot.going_down);
    assert_eq!(snapshot.available(), 0);
    assert_eq!(snapshot.in_use, 1);

    sim.run_until(EndCondition::NoEvents).unwrap();
    // the holder finished undisturbed at 13, which completed the
    // take-down; the break then runs 13..18 and the latecomer enters at 18
    assert_eq!(*log.borrow(), vec![("done", 13.0), ("late", 18.0)]);
}

/// Peer-coordination policy: never take the break while the peer is down
struct DontBothBreak {
    peer: ResourceId,
}

impl TakedownPolicy for DontBothBreak {
    fn start_resource_takedown(&mut self, view: &DowntimeView<'_>) -> TakedownDecision {
        if view.snapshot(self.peer).is_down() {
            TakedownDecision::Defer {
                until_up: self.peer,
            }
        } else {
            TakedownDecision::TakedownNow
        }
    }
}

#[test]
fn test_peer_coordinated_breaks_never_overlap() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let first = sim.add_resource("Line.First", 1).unwrap();
    let second = sim.add_resource("Line.Second", 1).unwrap();
    sim.add_scheduled_downtime_with_policy(
        "Line.First.Break",
        first,
        break_at(120.0, 15.0),
        Box::new(DontBothBreak { peer: second }),
    )
    .unwrap();
    sim.add_scheduled_downtime_with_policy(
        "Line.Second.Break",
        second,
        break_at(120.0, 15.0),
        Box::new(DontBothBreak { peer: first }),
    )
    .unwrap();

    sim.run_until(EndCondition::Time(SimTime::new(121.0))).unwrap();
    assert!(sim.resource_snapshot(first).is_down());
    assert!(!sim.resource_snapshot(second).is_down());

    sim.run_until(EndCondition::Time(SimTime::new(136.0))).unwrap();
    // the first break ended at 135; the deferred second break started
    // right as the first resource came up
    assert!(!sim.resource_snapshot(first).is_down());
    assert!(sim.resource_snapshot(second).is_down());

    sim.run_until(EndCondition::Time(SimTime::new(151.0))).unwrap();
    assert!(!sim.resource_snapshot(first).is_down());
    assert!(!sim.resource_snapshot(second).is_down());
}

#[test]
fn test_wait_extends_through_downtime() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let machine = sim.add_resource("Machine", 1).unwrap();
    sim.add_scheduled_downtime("Machine.Break", machine, break_at(10.0, 10.0))
        .unwrap();
    let log = new_log();
    let l = Rc::clone(&log);
    sim.spawn("job", 0, move |ctx| async move {
        let held = ctx.acquire(machine, 1).await?;
        ctx.wait_for_opts(SimTime::new(30.0), true).await?;
        push(&l, "finished", ctx.now());
        held.release();
        Ok(())
    })
    .unwrap();
    sim.run_until(EndCondition::NoEvents).unwrap();
    // 10 worked + 10 down + 20 remaining
    assert_eq!(*log.borrow(), vec![("finished", 40.0)]);
}

#[test]
fn test_failure_agent_alternates_down_and_up() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let machine = sim.add_resource("Machine", 1).unwrap();
    sim.add_failure_agent(
        "Machine.Failures",
        machine,
        Sampler::new(Dist::Constant { value: 10.0 }, StreamId(0)),
        Sampler::new(Dist::Constant { value: 5.0 }, StreamId(0)),
    )
    .unwrap();

    sim.run_until(EndCondition::Time(SimTime::new(12.0))).unwrap();
    assert!(sim.resource_snapshot(machine).is_down());
    sim.run_until(EndCondition::Time(SimTime::new(16.0))).unwrap();
    assert!(!sim.resource_snapshot(machine).is_down());
    sim.run_until(EndCondition::Time(SimTime::new(26.0))).unwrap();
    assert!(sim.resource_snapshot(machine).is_down());
    sim.run_until(EndCondition::Time(SimTime::new(31.0))).unwrap();
    assert!(!sim.resource_snapshot(machine).is_down());
}
