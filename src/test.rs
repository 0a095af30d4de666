#[cfg(test)]
mod tests {
    use crate::accessor::AtomicAccessor;
    use crate::config::HostConfig;
    use crate::director::CallbackId;
    use crate::error::RuntimeError;
    use crate::event::Event;
    use crate::host::{EventListener, Host, HostState};
    use crate::hypervisor::HostHypervisor;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, Weak};
    use std::thread;
    use std::time::Duration;

    // Real-time tick for spontaneous actors. Short enough to keep the suite
    // quick, long enough that one wake never covers two instants.
    const TICK_MS: i64 = 200;

    // ---- model pieces -------------------------------------------------

    struct Counter {
        count: i64,
        tick_ms: i64,
    }

    /// Emits 0, 1, 2, ... on a spontaneous output, one value per tick.
    fn spontaneous_counter(name: &str, tick_ms: i64) -> AtomicAccessor<Counter> {
        AtomicAccessor::new(name, Counter { count: 0, tick_ms })
            .unwrap()
            .add_spontaneous_output_port("CounterValue")
            .unwrap()
            .on_initialize(|counter: &mut Counter, cx| {
                cx.schedule_callback::<Counter, _>(counter.tick_ms, true, |counter, cx| {
                    cx.send_output("CounterValue", Event::new(counter.count))?;
                    counter.count += 1;
                    Ok(())
                })?;
                Ok(())
            })
    }

    #[derive(Default)]
    struct Adder {
        left: i64,
        right: i64,
    }

    fn integer_adder(name: &str) -> AtomicAccessor<Adder> {
        AtomicAccessor::new(name, Adder::default())
            .unwrap()
            .add_input_port("LeftInput")
            .unwrap()
            .add_input_port("RightInput")
            .unwrap()
            .add_output_port("SumOutput")
            .unwrap()
            .add_input_handler("LeftInput", |adder: &mut Adder, event, _cx| {
                adder.left = *event
                    .payload::<i64>()
                    .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
                Ok(())
            })
            .unwrap()
            .add_input_handler("RightInput", |adder: &mut Adder, event, _cx| {
                adder.right = *event
                    .payload::<i64>()
                    .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
                Ok(())
            })
            .unwrap()
            .on_fire(|adder: &mut Adder, cx| {
                cx.send_output("SumOutput", Event::new(adder.left + adder.right))?;
                Ok(())
            })
    }

    struct Verifier {
        expected: i64,
        latest: Arc<AtomicI64>,
        error: Arc<AtomicBool>,
    }

    /// Expects the sums 0, 2, 4, ... in order.
    fn sum_verifier(
        name: &str,
        latest: Arc<AtomicI64>,
        error: Arc<AtomicBool>,
    ) -> AtomicAccessor<Verifier> {
        AtomicAccessor::new(
            name,
            Verifier {
                expected: 0,
                latest,
                error,
            },
        )
        .unwrap()
        .add_input_port("Sum")
        .unwrap()
        .add_input_handler("Sum", |verifier: &mut Verifier, event, _cx| {
            let actual = *event
                .payload::<i64>()
                .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
            verifier.latest.store(actual, Ordering::SeqCst);
            if actual != verifier.expected {
                verifier.error.store(true, Ordering::SeqCst);
            }
            verifier.expected += 2;
            Ok(())
        })
        .unwrap()
    }

    fn sum_verifier_host(latest: Arc<AtomicI64>, error: Arc<AtomicBool>) -> Host {
        let host = Host::new("TargetHost").unwrap();
        host.add_child(spontaneous_counter("CounterOne", TICK_MS)).unwrap();
        host.add_child(spontaneous_counter("CounterTwo", TICK_MS)).unwrap();
        host.add_child(integer_adder("Adder")).unwrap();
        host.add_child(sum_verifier("Verifier", latest, error)).unwrap();
        // wiring happens in additional setup, before the causality analysis
        host.on_additional_setup::<(), _>(|_, cx| {
            cx.connect_children("CounterOne", "CounterValue", "Adder", "LeftInput")?;
            cx.connect_children("CounterTwo", "CounterValue", "Adder", "RightInput")?;
            cx.connect_children("Adder", "SumOutput", "Verifier", "Sum")?;
            Ok(())
        });
        host
    }

    // ---- two-counter adder --------------------------------------------

    #[test]
    fn two_counter_adder_reports_expected_sums() {
        let latest = Arc::new(AtomicI64::new(-1));
        let error = Arc::new(AtomicBool::new(false));
        let host = sum_verifier_host(latest.clone(), error.clone());

        host.setup().unwrap();
        assert_eq!(HostState::ReadyToRun, host.state());
        host.iterate(5).unwrap();
        host.exit();

        assert!(!error.load(Ordering::SeqCst));
        // the sum at round k is 2 * (k - 1)
        assert_eq!(8, latest.load(Ordering::SeqCst));
    }

    #[test]
    fn two_counter_adder_runs_detached() {
        let latest = Arc::new(AtomicI64::new(-1));
        let error = Arc::new(AtomicBool::new(false));
        let host = sum_verifier_host(latest.clone(), error.clone());

        host.setup().unwrap();
        host.run().unwrap();
        assert_eq!(HostState::Running, host.state());
        thread::sleep(Duration::from_millis((TICK_MS * 5 + TICK_MS / 2) as u64));
        host.exit();
        assert_eq!(HostState::Finished, host.state());

        assert!(!error.load(Ordering::SeqCst));
        let final_sum = latest.load(Ordering::SeqCst);
        assert!(final_sum >= 8, "expected at least five rounds, saw sum {final_sum}");
        assert_eq!(0, final_sum % 2);
    }

    // ---- dynamic model growth -----------------------------------------

    fn input_port_name(index: usize) -> String {
        format!("Input-{index}")
    }

    struct DynamicAdder {
        latest: Vec<i64>,
        next_port: usize,
    }

    /// Sums n inputs and grows a fresh input port on every fire, ready for
    /// the counter the host wires up next.
    fn dynamic_adder(name: &str) -> AtomicAccessor<DynamicAdder> {
        let mut builder = AtomicAccessor::new(
            name,
            DynamicAdder {
                latest: vec![0; 2],
                next_port: 2,
            },
        )
        .unwrap()
        .add_output_port("SumOutput")
        .unwrap();
        for index in 0..2 {
            builder = builder
                .add_input_port(&input_port_name(index))
                .unwrap()
                .add_input_handler(
                    &input_port_name(index),
                    move |adder: &mut DynamicAdder, event, _cx| {
                        adder.latest[index] = *event
                            .payload::<i64>()
                            .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
                        Ok(())
                    },
                )
                .unwrap();
        }
        builder.on_fire(|adder: &mut DynamicAdder, cx| {
            let sum: i64 = adder.latest.iter().sum();
            cx.send_output("SumOutput", Event::new(sum))?;
            let index = adder.next_port;
            adder.next_port += 1;
            adder.latest.push(0);
            cx.add_input_port(&input_port_name(index))?;
            cx.add_input_handler::<DynamicAdder, _>(
                &input_port_name(index),
                move |adder, event, _cx| {
                    adder.latest[index] = *event
                        .payload::<i64>()
                        .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
                    Ok(())
                },
            )?;
            Ok(())
        })
    }

    struct DynamicVerifier {
        next_addition: i64,
        expected: i64,
        latest: Arc<AtomicI64>,
        error: Arc<AtomicBool>,
    }

    fn dynamic_verifier(
        name: &str,
        latest: Arc<AtomicI64>,
        error: Arc<AtomicBool>,
    ) -> AtomicAccessor<DynamicVerifier> {
        AtomicAccessor::new(
            name,
            DynamicVerifier {
                next_addition: 0,
                expected: 0,
                latest,
                error,
            },
        )
        .unwrap()
        .add_input_port("Sum")
        .unwrap()
        .add_input_handler("Sum", |verifier: &mut DynamicVerifier, event, _cx| {
            let actual = *event
                .payload::<i64>()
                .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
            verifier.latest.store(actual, Ordering::SeqCst);
            if actual != verifier.expected {
                verifier.error.store(true, Ordering::SeqCst);
            }
            verifier.next_addition += 1;
            verifier.expected = actual + verifier.next_addition;
            Ok(())
        })
        .unwrap()
    }

    struct DynamicHostState {
        next_counter: usize,
    }

    fn dynamic_host(latest: Arc<AtomicI64>, error: Arc<AtomicBool>) -> Host {
        let host = Host::with_state("DynamicHost", DynamicHostState { next_counter: 0 }).unwrap();
        host.add_child(dynamic_adder("DynamicAdder")).unwrap();
        host.add_child(dynamic_verifier("Verifier", latest, error)).unwrap();
        host.connect_children("DynamicAdder", "SumOutput", "Verifier", "Sum").unwrap();
        host.on_initialize::<DynamicHostState, _>(|_, cx| {
            cx.schedule_callback::<DynamicHostState, _>(TICK_MS, true, |state, cx| {
                let index = state.next_counter;
                state.next_counter += 1;
                let name = format!("Counter-{index}");
                cx.add_child(spontaneous_counter(&name, TICK_MS))?;
                cx.connect_children(&name, "CounterValue", "DynamicAdder", &input_port_name(index))?;
                cx.children_changed();
                Ok(())
            })?;
            Ok(())
        });
        host
    }

    #[test]
    fn dynamic_adder_grows_with_model_updates() {
        // Each round: the host adds a counter, the model update re-prices
        // and initializes it, and every already-live counter ticks. The sum
        // after round n is (n - 1)(n - 2) / 2.
        let latest = Arc::new(AtomicI64::new(0));
        let error = Arc::new(AtomicBool::new(false));
        let host = dynamic_host(latest.clone(), error.clone());

        host.setup().unwrap();
        host.iterate(5).unwrap();
        host.exit();

        assert!(!error.load(Ordering::SeqCst));
        assert_eq!(6, latest.load(Ordering::SeqCst));
    }

    // ---- naming -------------------------------------------------------

    #[test]
    fn invalid_host_name_is_rejected() {
        assert!(matches!(
            Host::new("Bad Name"),
            Err(RuntimeError::Name { .. })
        ));
    }

    // ---- lifecycle ----------------------------------------------------

    #[test]
    fn pause_requires_running_host() {
        let host = Host::new("TargetHost").unwrap();
        host.setup().unwrap();
        assert!(matches!(
            host.pause(),
            Err(RuntimeError::Lifecycle { .. })
        ));
    }

    #[test]
    fn exit_is_allowed_before_setup() {
        let host = Host::new("TargetHost").unwrap();
        assert_eq!(HostState::NeedsSetup, host.state());
        host.exit();
        assert_eq!(HostState::Finished, host.state());
    }

    #[test]
    fn cannot_run_without_setup() {
        let host = Host::new("TargetHost").unwrap();
        assert!(host.run().is_err());
        assert!(host.run_on_current_thread().is_err());
        assert!(host.iterate(1).is_err());
        assert!(host.pause().is_err());
    }

    #[test]
    fn empty_host_sets_up_cleanly() {
        let host = Host::new("EmptyHost").unwrap();
        host.setup().unwrap();
        assert_eq!(HostState::ReadyToRun, host.state());
        host.exit();
        assert_eq!(HostState::Finished, host.state());
    }

    #[test]
    fn second_setup_is_rejected() {
        let host = Host::new("TargetHost").unwrap();
        host.setup().unwrap();
        assert!(matches!(
            host.setup(),
            Err(RuntimeError::Lifecycle { .. })
        ));
    }

    // ---- causality ----------------------------------------------------

    fn feedback_stage(name: &str) -> AtomicAccessor<()> {
        AtomicAccessor::new(name, ())
            .unwrap()
            .add_input_port("In")
            .unwrap()
            .add_output_port("Out")
            .unwrap()
    }

    #[test]
    fn causality_loop_fails_setup() {
        let host = Host::new("LoopHost").unwrap();
        host.add_child(feedback_stage("StageOne")).unwrap();
        host.add_child(feedback_stage("StageTwo")).unwrap();
        host.connect_children("StageOne", "Out", "StageTwo", "In").unwrap();
        host.connect_children("StageTwo", "Out", "StageOne", "In").unwrap();
        assert!(matches!(
            host.setup(),
            Err(RuntimeError::CausalityLoop { .. })
        ));
    }

    #[test]
    fn double_connection_is_rejected() {
        let host = Host::new("WiringHost").unwrap();
        host.add_child(spontaneous_counter("CounterOne", TICK_MS)).unwrap();
        host.add_child(spontaneous_counter("CounterTwo", TICK_MS)).unwrap();
        host.add_child(integer_adder("Adder")).unwrap();
        host.connect_children("CounterOne", "CounterValue", "Adder", "LeftInput").unwrap();
        assert!(matches!(
            host.connect_children("CounterTwo", "CounterValue", "Adder", "LeftInput"),
            Err(RuntimeError::Structure(_))
        ));
    }

    // ---- queue discipline ---------------------------------------------

    #[test]
    fn queued_events_drain_in_order_within_one_instant() {
        // three back-to-back events on one port: a single pending reaction,
        // then one reaction per event, all inside the same logical instant
        let seen = Arc::new(Mutex::new(Vec::<i64>::new()));
        let fires = Arc::new(AtomicUsize::new(0));

        let host = Host::new("BurstHost").unwrap();
        let producer = AtomicAccessor::new("Producer", ())
            .unwrap()
            .add_spontaneous_output_port("Burst")
            .unwrap()
            .on_initialize(|_: &mut (), cx| {
                cx.schedule_callback::<(), _>(TICK_MS, false, |_, cx| {
                    for value in 0..3i64 {
                        cx.send_output("Burst", Event::new(value))?;
                    }
                    Ok(())
                })?;
                Ok(())
            });
        let seen_in_handler = seen.clone();
        let fires_in_hook = fires.clone();
        let consumer = AtomicAccessor::new("Consumer", ())
            .unwrap()
            .add_input_port("In")
            .unwrap()
            .add_input_handler("In", move |_: &mut (), event, _cx| {
                let value = *event
                    .payload::<i64>()
                    .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
                seen_in_handler.lock().unwrap().push(value);
                Ok(())
            })
            .unwrap()
            .on_fire(move |_: &mut (), _cx| {
                fires_in_hook.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        host.add_child(producer).unwrap();
        host.add_child(consumer).unwrap();
        host.connect_children("Producer", "Burst", "Consumer", "In").unwrap();

        host.setup().unwrap();
        host.iterate(1).unwrap();
        host.exit();

        assert_eq!(vec![0, 1, 2], *seen.lock().unwrap());
        assert_eq!(3, fires.load(Ordering::SeqCst));
    }

    #[test]
    fn cleared_callback_never_fires() {
        struct Canceller {
            target: Option<CallbackId>,
        }
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_callback = fired.clone();

        let host = Host::new("CancelHost").unwrap();
        let canceller = AtomicAccessor::new("Canceller", Canceller { target: None })
            .unwrap()
            .on_initialize(move |state: &mut Canceller, cx| {
                let fired = fired_in_callback.clone();
                let target = cx.schedule_callback::<Canceller, _>(TICK_MS * 2, false, move |_, _| {
                    fired.store(true, Ordering::SeqCst);
                    Ok(())
                })?;
                state.target = Some(target);
                cx.schedule_callback::<Canceller, _>(TICK_MS, false, |state, cx| {
                    if let Some(target) = state.target.take() {
                        cx.clear_scheduled_callback(target)?;
                    }
                    Ok(())
                })?;
                Ok(())
            });
        host.add_child(canceller).unwrap();

        host.setup().unwrap();
        host.iterate(2).unwrap();
        thread::sleep(Duration::from_millis((TICK_MS * 3) as u64));
        host.exit();

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn events_before_initialization_are_dropped() {
        // send_output from an initialize hook must fail: the accessor is
        // not initialized until its hook completes
        let host = Host::new("EarlyHost").unwrap();
        let eager = AtomicAccessor::new("Eager", ())
            .unwrap()
            .add_output_port("Out")
            .unwrap()
            .on_initialize(|_: &mut (), cx| {
                cx.send_output("Out", Event::empty())?;
                Ok(())
            });
        host.add_child(eager).unwrap();
        let result = host.setup();
        assert!(matches!(result, Err(RuntimeError::Handler { .. })));
        assert_eq!(HostState::SettingUp, host.state());
    }

    // ---- listeners and failure handling -------------------------------

    #[derive(Default)]
    struct RecordingListener {
        changes: Mutex<Vec<(HostState, HostState)>>,
        errors: AtomicUsize,
    }

    impl EventListener for RecordingListener {
        fn on_state_change(&self, old: HostState, new: HostState) -> anyhow::Result<()> {
            self.changes.lock().unwrap().push((old, new));
            Ok(())
        }

        fn on_execution_error(&self, _error: &RuntimeError) -> anyhow::Result<()> {
            self.errors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn listener_observes_state_changes() {
        let listener = Arc::new(RecordingListener::default());
        let host = Host::new("ListenerHost").unwrap();
        let weak: Weak<dyn EventListener> = Arc::downgrade(&(listener.clone() as Arc<dyn EventListener>));
        let id = host.add_event_listener(weak);
        assert!(host.event_listener_is_registered(id));

        host.setup().unwrap();
        let changes = listener.changes.lock().unwrap().clone();
        assert_eq!(
            vec![
                (HostState::NeedsSetup, HostState::SettingUp),
                (HostState::SettingUp, HostState::ReadyToRun),
            ],
            changes
        );

        host.remove_event_listener(id);
        assert!(!host.event_listener_is_registered(id));
    }

    #[test]
    fn expired_listener_is_reaped_on_notification() {
        let listener = Arc::new(RecordingListener::default());
        let host = Host::new("ReapHost").unwrap();
        let weak: Weak<dyn EventListener> = Arc::downgrade(&(listener.clone() as Arc<dyn EventListener>));
        let id = host.add_event_listener(weak);
        drop(listener);
        host.setup().unwrap();
        assert!(!host.event_listener_is_registered(id));
    }

    #[test]
    fn failing_handler_corrupts_then_pauses() {
        let listener = Arc::new(RecordingListener::default());
        let host = Host::new("FaultyHost").unwrap();
        let weak: Weak<dyn EventListener> = Arc::downgrade(&(listener.clone() as Arc<dyn EventListener>));
        host.add_event_listener(weak);

        let producer = AtomicAccessor::new("Producer", ())
            .unwrap()
            .add_spontaneous_output_port("Out")
            .unwrap()
            .on_initialize(|_: &mut (), cx| {
                cx.schedule_callback::<(), _>(TICK_MS, false, |_, cx| {
                    cx.send_output("Out", Event::empty())?;
                    Ok(())
                })?;
                Ok(())
            });
        let consumer = AtomicAccessor::new("Consumer", ())
            .unwrap()
            .add_input_port("In")
            .unwrap()
            .add_input_handler("In", |_: &mut (), _event, _cx| {
                anyhow::bail!("handler blew up")
            })
            .unwrap();
        host.add_child(producer).unwrap();
        host.add_child(consumer).unwrap();
        host.connect_children("Producer", "Out", "Consumer", "In").unwrap();

        host.setup().unwrap();
        host.iterate(1).unwrap();

        assert_eq!(HostState::Paused, host.state());
        assert_eq!(1, listener.errors.load(Ordering::SeqCst));
        let changes = listener.changes.lock().unwrap().clone();
        assert!(changes.contains(&(HostState::Corrupted, HostState::Paused)));
        host.exit();
    }

    // ---- dynamic removal ----------------------------------------------

    #[test]
    fn removed_child_stops_reacting() {
        let received = Arc::new(AtomicUsize::new(0));
        let received_in_handler = received.clone();

        let host = Host::new("RemovalHost").unwrap();
        host.add_child(spontaneous_counter("Counter", TICK_MS)).unwrap();
        let sink = AtomicAccessor::new("Sink", ())
            .unwrap()
            .add_input_port("In")
            .unwrap()
            .add_input_handler("In", move |_: &mut (), _event, _cx| {
                received_in_handler.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        host.add_child(sink).unwrap();
        host.connect_children("Counter", "CounterValue", "Sink", "In").unwrap();

        host.setup().unwrap();
        host.iterate(2).unwrap();
        let after_two_rounds = received.load(Ordering::SeqCst);
        assert_eq!(2, after_two_rounds);

        host.remove_child("Counter").unwrap();
        host.children_changed();
        host.iterate(2).unwrap();
        host.exit();

        assert_eq!(after_two_rounds, received.load(Ordering::SeqCst));
    }

    // ---- hypervisor ---------------------------------------------------

    #[test]
    fn hypervisor_fans_out_lifecycle_operations() {
        let hypervisor = HostHypervisor::new();
        let first = hypervisor.add_host(Host::new("HostA").unwrap());
        let second = hypervisor.add_host(Host::new("HostB").unwrap());

        let names = hypervisor.host_names();
        assert_eq!(Some(&"HostA".to_string()), names.get(&first));
        assert_eq!(Some(&"HostB".to_string()), names.get(&second));

        let results = hypervisor.setup_hosts();
        assert!(results.values().all(|r| r.is_ok()));
        let states = hypervisor.host_states();
        assert!(states.values().all(|s| *s == HostState::ReadyToRun));

        hypervisor.remove_host(first).unwrap();
        assert!(hypervisor.host_name(first).is_err());
        assert!(hypervisor.host_name(second).is_ok());
        hypervisor.remove_all_hosts();
        assert!(hypervisor.host_states().is_empty());
    }

    // ---- configuration ------------------------------------------------

    #[test]
    fn host_config_deserializes_from_json() {
        let config: HostConfig = serde_json::from_value(serde_json::json!({
            "name": "JsonHost",
            "sleep_chunk_ms": 250,
        }))
        .unwrap();
        let host = Host::with_config(config).unwrap();
        assert_eq!("JsonHost", host.name());
    }
}
