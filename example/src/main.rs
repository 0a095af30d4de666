//! Two spontaneous counters feed an integer adder whose sum is checked by a
//! verifier. Run with LOG_LEVEL=debug to watch the director at work.

use accessors::event::Event;
use accessors::prelude::*;
use accessors::utils::logger::LoggerConfig;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INTERVAL_MS: i64 = 1000;

struct Counter {
    count: i64,
}

fn spontaneous_counter(name: &str) -> Result<AtomicAccessor<Counter>> {
    Ok(AtomicAccessor::new(name, Counter { count: 0 })?
        .add_spontaneous_output_port("CounterValue")?
        .on_initialize(|_: &mut Counter, cx| {
            cx.schedule_callback::<Counter, _>(INTERVAL_MS, true, |counter, cx| {
                cx.send_output("CounterValue", Event::new(counter.count))?;
                counter.count += 1;
                Ok(())
            })?;
            Ok(())
        }))
}

#[derive(Default)]
struct Adder {
    left: i64,
    right: i64,
}

fn integer_adder(name: &str) -> Result<AtomicAccessor<Adder>> {
    Ok(AtomicAccessor::new(name, Adder::default())?
        .add_input_port("LeftInput")?
        .add_input_port("RightInput")?
        .add_output_port("SumOutput")?
        .add_input_handler("LeftInput", |adder: &mut Adder, event, _cx| {
            adder.left = *event
                .payload::<i64>()
                .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
            Ok(())
        })?
        .add_input_handler("RightInput", |adder: &mut Adder, event, _cx| {
            adder.right = *event
                .payload::<i64>()
                .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
            Ok(())
        })?
        .on_fire(|adder: &mut Adder, cx| {
            cx.send_output("SumOutput", Event::new(adder.left + adder.right))?;
            Ok(())
        }))
}

struct Verifier {
    expected: i64,
    latest: Arc<AtomicI64>,
    error: Arc<AtomicBool>,
}

fn sum_verifier(
    name: &str,
    latest: Arc<AtomicI64>,
    error: Arc<AtomicBool>,
) -> Result<AtomicAccessor<Verifier>> {
    Ok(AtomicAccessor::new(
        name,
        Verifier {
            expected: 0,
            latest,
            error,
        },
    )?
    .add_input_port("Sum")?
    .add_input_handler("Sum", |verifier: &mut Verifier, event, _cx| {
        let actual = *event
            .payload::<i64>()
            .ok_or_else(|| anyhow::anyhow!("expected integer payload"))?;
        if actual == verifier.expected {
            tracing::info!(actual, "sum matched expectation");
        } else {
            tracing::error!(actual, expected = verifier.expected, "sum mismatch");
            verifier.error.store(true, Ordering::SeqCst);
        }
        verifier.latest.store(actual, Ordering::SeqCst);
        verifier.expected += 2;
        Ok(())
    })?)
}

fn main() -> anyhow::Result<()> {
    let _guard = LoggerConfig::from_env().init()?;

    let latest = Arc::new(AtomicI64::new(0));
    let error = Arc::new(AtomicBool::new(false));

    let host = Host::new("ExampleHost")?;
    host.add_child(spontaneous_counter("CounterOne")?)?;
    host.add_child(spontaneous_counter("CounterTwo")?)?;
    host.add_child(integer_adder("Adder")?)?;
    host.add_child(sum_verifier("Verifier", latest.clone(), error.clone())?)?;
    host.on_additional_setup::<(), _>(|_, cx| {
        cx.connect_children("CounterOne", "CounterValue", "Adder", "LeftInput")?;
        cx.connect_children("CounterTwo", "CounterValue", "Adder", "RightInput")?;
        cx.connect_children("Adder", "SumOutput", "Verifier", "Sum")?;
        Ok(())
    });

    host.setup()?;
    host.run()?;
    std::thread::sleep(Duration::from_millis(5500));
    host.exit();

    tracing::info!(
        latest = latest.load(Ordering::SeqCst),
        error = error.load(Ordering::SeqCst),
        "model finished"
    );
    Ok(())
}
