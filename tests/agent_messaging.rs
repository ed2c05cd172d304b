//! Agent messaging: synchronous sends, response timeouts, queue retry,
//! publish/subscribe fan-out

use std::cell::RefCell;
use std::rc::Rc;

use procsim::{
    AgentApi, AgentBehavior, EndCondition, Message, MessageKind, MessagePayload, SimConfig,
    SimError, SimTime, Simulation,
};

type Log = Rc<RefCell<Vec<(String, f64)>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Answers every `User(1)` message with its own payload wrapped up
struct Echo;

impl AgentBehavior for Echo {
    fn handle_message(&mut self, api: &mut AgentApi<'_>, msg: &Message) -> bool {
        if msg.kind == MessageKind::User(1) {
            if let MessagePayload::Value(value) = &msg.payload {
                api.respond(msg, serde_json::json!({ "echo": value }));
            }
            true
        } else {
            false
        }
    }
}

#[test]
fn test_synchronous_send_resumes_with_the_response() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let echo = sim.add_agent("Echo", Box::new(Echo)).unwrap();
    let log = new_log();
    let l = Rc::clone(&log);
    sim.spawn("caller", 0, move |ctx| async move {
        ctx.wait_for(SimTime::new(2.0)).await?;
        let response = ctx
            .send_sync(echo, MessageKind::User(1), serde_json::json!("ping"))
            .await?;
        l.borrow_mut()
            .push((response.to_string(), ctx.now().value()));
        Ok(())
    })
    .unwrap();
    sim.run_until(EndCondition::NoEvents).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![("{\"echo\":\"ping\"}".to_string(), 2.0)]
    );
}

/// Never answers anything
struct Deaf;

impl AgentBehavior for Deaf {
    fn handle_message(&mut self, _api: &mut AgentApi<'_>, _msg: &Message) -> bool {
        false
    }
}

#[test]
fn test_synchronous_send_times_out() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let deaf = sim.add_agent("Deaf", Box::new(Deaf)).unwrap();
    let log = new_log();
    let l = Rc::clone(&log);
    sim.spawn("caller", 0, move |ctx| async move {
        let outcome = ctx
            .send_sync_with_timeout(
                deaf,
                MessageKind::User(1),
                serde_json::json!("anyone?"),
                SimTime::new(5.0),
            )
            .await;
        assert!(matches!(outcome, Err(SimError::TimedOut)));
        l.borrow_mut().push(("timed-out".to_string(), ctx.now().value()));
        Ok(())
    })
    .unwrap();
    sim.run_until(EndCondition::NoEvents).unwrap();
    assert_eq!(*log.borrow(), vec![("timed-out".to_string(), 5.0)]);
}

/// Holds `User(5)` messages in the queue until a `User(6)` arms it; a
/// declined message stays queued and is retried on the next pass.
struct Gate {
    ready: bool,
    log: Log,
}

impl AgentBehavior for Gate {
    fn handle_message(&mut self, api: &mut AgentApi<'_>, msg: &Message) -> bool {
        match msg.kind {
            MessageKind::User(5) => {
                if self.ready {
                    self.log
                        .borrow_mut()
                        .push(("handled-5".to_string(), api.now().value()));
                    true
                } else {
                    false
                }
            }
            MessageKind::User(6) => {
                self.ready = true;
                self.log
                    .borrow_mut()
                    .push(("armed".to_string(), api.now().value()));
                true
            }
            _ => true,
        }
    }
}

#[test]
fn test_declined_messages_stay_queued_for_retry() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let log = new_log();
    let gate = sim
        .add_agent(
            "Gate",
            Box::new(Gate {
                ready: false,
                log: Rc::clone(&log),
            }),
        )
        .unwrap();
    sim.spawn("driver", 0, move |ctx| async move {
        ctx.send_async(gate, MessageKind::User(5), serde_json::json!(null));
        ctx.wait_for(SimTime::new(2.0)).await?;
        ctx.send_async(gate, MessageKind::User(6), serde_json::json!(null));
        ctx.wait_for(SimTime::new(1.0)).await?;
        // any later trigger reprocesses the queue and drains the held
        // message
        ctx.send_async(gate, MessageKind::User(7), serde_json::json!(null));
        Ok(())
    })
    .unwrap();
    sim.run_until(EndCondition::NoEvents).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![("armed".to_string(), 2.0), ("handled-5".to_string(), 3.0)]
    );
}

/// Rebroadcasts every `User(2)` it handles to its subscribers
struct Announcer;

impl AgentBehavior for Announcer {
    fn handle_message(&mut self, api: &mut AgentApi<'_>, msg: &Message) -> bool {
        if msg.kind == MessageKind::User(2) {
            api.publish(MessageKind::User(3), msg.payload.clone());
        }
        true
    }
}

/// Records everything it hears
struct Listener {
    log: Log,
    tag: &'static str,
}

impl AgentBehavior for Listener {
    fn handle_message(&mut self, api: &mut AgentApi<'_>, msg: &Message) -> bool {
        if msg.kind == MessageKind::User(3) {
            self.log
                .borrow_mut()
                .push((self.tag.to_string(), api.now().value()));
        }
        true
    }
}

#[test]
fn test_publish_fans_out_to_every_subscriber() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    let log = new_log();
    let announcer = sim.add_agent("Announcer", Box::new(Announcer)).unwrap();
    let left = sim
        .add_agent(
            "LeftListener",
            Box::new(Listener {
                log: Rc::clone(&log),
                tag: "left",
            }),
        )
        .unwrap();
    let right = sim
        .add_agent(
            "RightListener",
            Box::new(Listener {
                log: Rc::clone(&log),
                tag: "right",
            }),
        )
        .unwrap();
    sim.subscribe(announcer, MessageKind::User(3), left);
    sim.subscribe(announcer, MessageKind::User(3), right);

    sim.spawn("publisher", 0, move |ctx| async move {
        ctx.wait_for(SimTime::new(4.0)).await?;
        ctx.send_async(announcer, MessageKind::User(2), serde_json::json!("news"));
        Ok(())
    })
    .unwrap();
    sim.run_until(EndCondition::NoEvents).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![("left".to_string(), 4.0), ("right".to_string(), 4.0)]
    );
}
