//! Pool assignment: class filters, reservation for higher priorities,
//! custom assignment policies

use std::cell::RefCell;
use std::rc::Rc;

use procsim::{
    AcquireOptions, AssignmentPolicy, EndCondition, PoolApi, SimConfig, SimResult, SimTime,
    Simulation,
};

type Log = Rc<RefCell<Vec<(&'static str, f64)>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn push(log: &Log, tag: &'static str, at: SimTime) {
    log.borrow_mut().push((tag, at.value()));
}

/// A merchant teller and two regular tellers behind one pool. The
/// merchant customer picks the merchant teller by class; regular
/// customers select the teller base class and fill the regular tellers
/// in registration order; the third regular customer waits for the first
/// release.
#[test]
fn test_class_filtered_pool_assignment() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let teller = sim.add_resource_class("Teller", None);
    let merchant_class = sim.add_resource_class("MerchantTeller", Some(teller));
    let regular_class = sim.add_resource_class("RegularTeller", Some(teller));

    let merchant = sim
        .add_resource_in_class("Bank.MerchantTeller", 1, merchant_class)
        .unwrap();
    let regular1 = sim
        .add_resource_in_class("Bank.Teller1", 1, regular_class)
        .unwrap();
    let regular2 = sim
        .add_resource_in_class("Bank.Teller2", 1, regular_class)
        .unwrap();
    let pool = sim.add_pool("Bank.Tellers").unwrap();
    sim.add_to_pool(pool, merchant).unwrap();
    sim.add_to_pool(pool, regular1).unwrap();
    sim.add_to_pool(pool, regular2).unwrap();

    let log = new_log();

    let l = Rc::clone(&log);
    sim.spawn("merchant-customer", 0, move |ctx| async move {
        let held = ctx.acquire_from(pool, merchant_class, 1).await?;
        assert_eq!(held.resources(), vec![(merchant, 1)]);
        push(&l, "merchant", ctx.now());
        ctx.wait_for(SimTime::new(10.0)).await?;
        Ok(())
    })
    .unwrap();

    let l = Rc::clone(&log);
    sim.spawn("regular-1", 0, move |ctx| async move {
        let held = ctx.acquire_from(pool, teller, 1).await?;
        assert_eq!(held.resources(), vec![(regular1, 1)]);
        push(&l, "regular-1", ctx.now());
        ctx.wait_for(SimTime::new(4.0)).await?;
        held.release();
        Ok(())
    })
    .unwrap();

    let l = Rc::clone(&log);
    sim.spawn("regular-2", 0, move |ctx| async move {
        let held = ctx.acquire_from(pool, teller, 1).await?;
        assert_eq!(held.resources(), vec![(regular2, 1)]);
        push(&l, "regular-2", ctx.now());
        ctx.wait_for(SimTime::new(8.0)).await?;
        Ok(())
    })
    .unwrap();

    let l = Rc::clone(&log);
    sim.spawn("regular-3", 0, move |ctx| async move {
        let held = ctx.acquire_from(pool, teller, 1).await?;
        // the unit freed by regular-1
        assert_eq!(held.resources(), vec![(regular1, 1)]);
        push(&l, "regular-3", ctx.now());
        Ok(())
    })
    .unwrap();

    sim.run_until(EndCondition::NoEvents).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![
            ("merchant", 0.0),
            ("regular-1", 0.0),
            ("regular-2", 0.0),
            ("regular-3", 4.0),
        ]
    );
}

/// The default pass reserves all units an unmet higher-priority request
/// could use; a lower-priority request cannot take them this pass.
#[test]
fn test_pool_reserves_units_for_unmet_higher_priority() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let worker = sim.add_resource_class("Worker", None);
    let a = sim.add_resource_in_class("Crew.A", 1, worker).unwrap();
    let b = sim.add_resource_in_class("Crew.B", 1, worker).unwrap();
    let c = sim.add_resource_in_class("Crew.C", 1, worker).unwrap();
    let pool = sim.add_pool("Crew").unwrap();
    for r in [a, b, c] {
        sim.add_to_pool(pool, r).unwrap();
    }
    let log = new_log();

    sim.spawn("holder", 0, move |ctx| async move {
        let held = ctx.acquire_from(pool, worker, 2).await?;
        ctx.wait_for(SimTime::new(6.0)).await?;
        held.release();
        Ok(())
    })
    .unwrap();

    let l = Rc::clone(&log);
    sim.spawn("urgent", 0, move |ctx| async move {
        ctx.wait_for(SimTime::new(1.0)).await?;
        let held = ctx
            .acquire_from_with(
                pool,
                worker,
                2,
                AcquireOptions {
                    priority: Some(5),
                    ..AcquireOptions::default()
                },
            )
            .await?;
        push(&l, "urgent", ctx.now());
        ctx.wait_for(SimTime::new(2.0)).await?;
        held.release();
        Ok(())
    })
    .unwrap();

    let l = Rc::clone(&log);
    sim.spawn("casual", 0, move |ctx| async move {
        ctx.wait_for(SimTime::new(2.0)).await?;
        let held = ctx.acquire_from(pool, worker, 1).await?;
        push(&l, "casual", ctx.now());
        held.release();
        Ok(())
    })
    .unwrap();

    sim.run_until(EndCondition::NoEvents).unwrap();
    // the one free unit stays reserved for the urgent request; casual only
    // runs once urgent is satisfied and done
    assert_eq!(*log.borrow(), vec![("urgent", 6.0), ("casual", 6.0)]);
}

/// Opportunistic policy for the extension seam: fulfill whatever fits, in
/// queue order, with no reservation for unmet requests.
struct GreedyBackfill;

impl AssignmentPolicy for GreedyBackfill {
    fn process_queued_requests(&mut self, api: &mut PoolApi<'_>) -> SimResult<()> {
        for request in api.requests() {
            let info = match api.request(request) {
                Some(info) => info,
                None => continue,
            };
            let eligible: Vec<_> = api
                .members()
                .into_iter()
                .filter(|r| api.eligible(*r, request))
                .collect();
            let total: u32 = eligible.iter().map(|r| api.available_units(*r)).sum();
            if total < info.units {
                continue;
            }
            let mut remaining = info.units;
            for resource in eligible {
                if remaining == 0 {
                    break;
                }
                let take = api.available_units(resource).min(remaining);
                if take > 0 {
                    api.assign(request, resource, take)?;
                    remaining -= take;
                }
            }
        }
        Ok(())
    }
}

#[test]
fn test_custom_policy_can_backfill_past_blocked_requests() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let worker = sim.add_resource_class("Worker", None);
    let solo = sim.add_resource_in_class("Crew.Solo", 1, worker).unwrap();
    let pool = sim
        .add_pool_with_policy("Crew", Box::new(GreedyBackfill))
        .unwrap();
    sim.add_to_pool(pool, solo).unwrap();
    let log = new_log();

    let l = Rc::clone(&log);
    sim.spawn("urgent-bulk", 0, move |ctx| async move {
        // two units can never be assembled from this pool
        let outcome = ctx
            .acquire_from_with(
                pool,
                worker,
                2,
                AcquireOptions {
                    priority: Some(5),
                    timeout: Some(SimTime::new(20.0)),
                    ..AcquireOptions::default()
                },
            )
            .await;
        assert!(outcome.is_err());
        push(&l, "gave-up", ctx.now());
        Ok(())
    })
    .unwrap();

    let l = Rc::clone(&log);
    sim.spawn("casual", 0, move |ctx| async move {
        ctx.wait_for(SimTime::new(1.0)).await?;
        let held = ctx.acquire_from(pool, worker, 1).await?;
        push(&l, "casual", ctx.now());
        held.release();
        Ok(())
    })
    .unwrap();

    sim.run_until(EndCondition::NoEvents).unwrap();
    // the greedy policy hands the single unit to the casual request even
    // though a higher-priority request is still queued
    assert_eq!(*log.borrow(), vec![("casual", 1.0), ("gave-up", 20.0)]);
}
