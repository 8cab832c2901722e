//! Runs ten periodic timers (1 to 10 ms) and reports how many times each one
//! fired and how late it was on average.

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use padlink::poll::wait_backend::WaitBackend;
use padlink::poll::{Backend, Flow, Multiplexer, DEFAULT_MAX_SOURCES};
use padlink::priority::PriorityElevator;
use padlink::timer::{AnomalyPolicy, TimerId, TimerService};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const TIMER_COUNT: u64 = 10;
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Measure periodic timer accuracy.
#[derive(Parser, Debug)]
#[command(name = "timer_probe", version, about)]
struct Args {
    /// Seconds to run, 0 runs until Ctrl-C
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Treat a timer firing before its deadline as fatal
    #[arg(long)]
    strict: bool,

    /// Lateness in percent of the period that gets logged
    #[arg(long, default_value_t = padlink::timer::DEFAULT_TOLERANCE_PERCENT)]
    tolerance: u64,

    /// Use the portable wait-object backend
    #[arg(long)]
    wait_backend: bool,

    /// Keep the default scheduling class
    #[arg(long)]
    no_priority: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();

    let args = Args::parse();

    let done = CancellationToken::new();
    let ctrl_c = done.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            ctrl_c.cancel();
        }
    });

    tokio::task::spawn_blocking(move || run(args, done))
        .await
        .map_err(|e| eyre!("Probe thread panicked: {}", e))?
}

fn run(args: Args, done: CancellationToken) -> Result<()> {
    if !args.no_priority {
        PriorityElevator::default().elevate();
    }

    let policy = if args.strict {
        AnomalyPolicy::Strict
    } else {
        AnomalyPolicy::Lenient
    };

    if args.wait_backend {
        let mux = Multiplexer::with_backend(WaitBackend::new()?, DEFAULT_MAX_SOURCES);
        probe(TimerService::with_multiplexer(mux, policy), &args, &done)
    } else {
        probe(TimerService::new(policy)?, &args, &done)
    }
}

fn probe<B: Backend>(timers: TimerService<B>, args: &Args, done: &CancellationToken) -> Result<()> {
    let mut timers = timers.with_tolerance(args.tolerance);
    let closed = Rc::new(Cell::new(false));

    for k in 1..=TIMER_COUNT {
        let closed = Rc::clone(&closed);
        timers.start(
            Duration::from_millis(k),
            |_, _| Flow::Continue,
            move |_| closed.set(true),
        )?;
    }

    let until = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    info!("Probing {} timers", timers.len());

    let outcome = loop {
        if done.is_cancelled() || closed.get() || until.is_some_and(|until| Instant::now() >= until) {
            break Ok(());
        }
        if let Err(e) = timers.poll_timeout(Some(POLL_SLICE)) {
            error!("Probe stopped: {}", e);
            break Err(e);
        }
    };

    let report: Vec<(TimerId, Duration, u64, Option<u64>)> = timers
        .ids()
        .into_iter()
        .filter_map(|id| {
            let period = timers.period(id)?;
            let stats = timers.stats(id)?;
            Some((id, period, stats.count, stats.error_percent(period)))
        })
        .collect();
    timers.close_all();

    for (id, period, count, error) in report {
        match error {
            Some(error) => println!(
                "timer: {}, period: {}us, count={}, error average: {}%",
                id.get(),
                period.as_micros(),
                count,
                error
            ),
            None => println!("timer: {}, period: {}us, never fired", id.get(), period.as_micros()),
        }
    }

    outcome.map_err(Into::into)
}
