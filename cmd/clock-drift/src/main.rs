//! Periodic timer drift measurement
//!
//! Runs a periodic wake-up at a fixed nominal period under a configurable
//! time-scale factor and reports per-tick and cumulative drift against the
//! wall clock. Usage:
//!
//! ```text
//! clock-drift [period_ms] [ticks] [time_scale_factor]
//! ```

use std::env;
use std::time::{Duration, Instant};

use axon::{Context, ContextConfig, TimerConfig};

fn arg<T: std::str::FromStr>(n: usize, default: T) -> T {
    env::args()
        .nth(n)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn main() {
    env_logger::init();

    let period = Duration::from_millis(arg(1, 10));
    let ticks: u32 = arg(2, 100);
    let scale: f64 = arg(3, 1.0);

    let ctx = Context::new(ContextConfig {
        timer: TimerConfig {
            time_scale_factor: scale,
        },
        ..Default::default()
    })
    .expect("context init");

    let nominal = period.mul_f64(scale);
    println!(
        "period {period:?} x scale {scale} => nominal tick {nominal:?}, {ticks} ticks"
    );

    {
        let ctx2 = ctx.clone();
        ctx.spawn(async move {
            let started = Instant::now();
            let mut worst = Duration::ZERO;
            for tick in 1..=ticks {
                if ctx2.schedule_after(period).await.is_err() {
                    break;
                }
                let expected = nominal * tick;
                let actual = started.elapsed();
                let drift = actual.saturating_sub(expected);
                worst = worst.max(drift);
                if tick % 10 == 0 {
                    println!(
                        "tick {tick:>4}: expected {expected:>10.3?} actual {actual:>10.3?} drift {drift:?}"
                    );
                }
            }
            let total = started.elapsed();
            println!(
                "done: {ticks} ticks in {total:?} (cumulative drift {:?}, worst tick drift {worst:?})",
                total.saturating_sub(nominal * ticks)
            );
            ctx2.request_stop();
        });
    }

    ctx.run();
}
