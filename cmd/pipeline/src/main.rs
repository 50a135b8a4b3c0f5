//! Canonical graph demo
//!
//! A periodic counter generator and a constant-label generator both feed a
//! two-input sink. The graph runs for a bounded wall time, a watchdog thread
//! requests stop, and the demo prints how often each node executed.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::info;

use axon::{
    when_all2, Cancelled, Context, EngineConfig, Node, NodeEngine, Output, TypedInput,
};

struct CounterSource {
    period: Duration,
    count: u64,
    output: Output<u64>,
}

impl Node for CounterSource {
    type Readiness = ();
    type Value = u64;

    fn name(&self) -> &str {
        "counter"
    }

    fn trigger(&mut self, ctx: &Context) -> impl Future<Output = Result<(), Cancelled>> {
        ctx.schedule_after(self.period)
    }

    fn execute(&mut self, _readiness: ()) -> u64 {
        self.count += 1;
        self.count
    }

    fn output(&self) -> Option<&Output<u64>> {
        Some(&self.output)
    }
}

struct LabelSource {
    period: Duration,
    output: Output<&'static str>,
}

impl Node for LabelSource {
    type Readiness = ();
    type Value = &'static str;

    fn name(&self) -> &str {
        "label"
    }

    fn trigger(&mut self, ctx: &Context) -> impl Future<Output = Result<(), Cancelled>> {
        ctx.schedule_after(self.period)
    }

    fn execute(&mut self, _readiness: ()) -> &'static str {
        "sample"
    }

    fn output(&self) -> Option<&Output<&'static str>> {
        Some(&self.output)
    }
}

struct PairSink {
    numbers: TypedInput<u64>,
    labels: TypedInput<&'static str>,
    executed: Rc<Cell<u64>>,
    last: u64,
}

impl Node for PairSink {
    type Readiness = (u64, &'static str);
    type Value = ();

    fn name(&self) -> &str {
        "sink"
    }

    fn trigger(
        &mut self,
        ctx: &Context,
    ) -> impl Future<Output = Result<Self::Readiness, Cancelled>> {
        when_all2(self.numbers.await_one(ctx), self.labels.await_one(ctx))
    }

    fn execute(&mut self, readiness: Self::Readiness) {
        let (number, label) = readiness;
        self.last = number;
        self.executed.set(self.executed.get() + 1);
        info!("sink consumed ({number}, {label:?})");
    }
}

fn main() {
    env_logger::init();

    let engine = NodeEngine::new(EngineConfig::default()).expect("engine init");
    let executed = Rc::new(Cell::new(0u64));

    let counter = engine.create_node(CounterSource {
        period: Duration::from_millis(1),
        count: 0,
        output: Output::new(),
    });
    let labels = engine.create_node(LabelSource {
        period: Duration::from_millis(1),
        output: Output::new(),
    });
    let sink = engine.create_node(PairSink {
        numbers: TypedInput::with_capacity(8),
        labels: TypedInput::with_capacity(8),
        executed: Rc::clone(&executed),
        last: 0,
    });

    engine
        .connect(&counter, &counter.borrow().output, &sink, &sink.borrow().numbers)
        .expect("wire counter -> sink");
    engine
        .connect(&labels, &labels.borrow().output, &sink, &sink.borrow().labels)
        .expect("wire label -> sink");

    let stop = engine.stop_handle();
    let watchdog = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        stop.request_stop();
    });

    engine.run().expect("graph run");
    watchdog.join().unwrap();

    println!(
        "pipeline done: sink executed {} times, generator reached {}",
        executed.get(),
        counter.borrow().count
    );
}
