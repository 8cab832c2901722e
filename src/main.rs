use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use padlink::cli::Cli;
use padlink::config::{AppConfig, TransportKind};
use padlink::controller::event_processor::FrameProcessor;
use padlink::controller::InputSource;
use padlink::dispatch::timing::LoopTiming;
use padlink::dispatch::{AppState, DispatchError, DispatchLoop, LoopSettings, Setup};
use padlink::priority::PriorityElevator;
use padlink::transport::{write_timeout_for, SerialTransport, TcpTransport, Transport};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).await?;
    cli.apply(&mut config);
    config.validate()?;

    if cli.dump_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let timing = LoopTiming::resolve(config.refresh_period(), config.control.precision_bits)?;
    if cli.status {
        // Read by frontends
        println!("max_axis_value: {}", timing.max_axis_value);
    }

    if config.transport.target.is_none() && !cli.check {
        error!("No transport target given, use --serial or --tcp");
        return Err(eyre!("no transport target specified"));
    }

    let done = CancellationToken::new();
    let ctrl_c = done.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current iteration");
            ctrl_c.cancel();
        }
    });

    let settings = LoopSettings {
        period: timing.period,
        precision_bits: config.control.precision_bits,
        controller: config.control.controller,
        force_updates: config.control.force_updates,
        keygen: cli.keygen.clone(),
        check_only: cli.check,
        on_send_failure: config.transport.on_send_failure,
        stats_interval: Duration::from_secs(config.control.stats_interval_secs),
    };

    // The loop owns the control thread until it terminates
    tokio::task::spawn_blocking(move || run_bridge(config, settings, done))
        .await
        .map_err(|e| eyre!("Control thread panicked: {}", e))??;

    Ok(())
}

fn run_bridge(config: AppConfig, settings: LoopSettings, done: CancellationToken) -> Result<(), DispatchError> {
    let input = open_input(&config)?;
    let processor = Box::new(FrameProcessor::new(config.processor_settings()));
    let transport = open_transport(&config);
    let elevator = config
        .priority
        .enabled
        .then(|| PriorityElevator::new(config.priority.level));

    let mut state = AppState::new(done);
    let dispatch = DispatchLoop::create(settings, input, processor, transport)?.with_elevator(elevator);

    match dispatch.initialize(&mut state)? {
        Setup::Validated => Ok(()),
        Setup::Ready(running) => {
            let terminated = running.run(&mut state)?;
            terminated.report(&state);
            Ok(())
        }
    }
}

#[cfg(feature = "gamepad")]
fn open_input(config: &AppConfig) -> Result<Box<dyn InputSource>, DispatchError> {
    use padlink::controller::event_collector::{CollectorSettings, EventCollector};

    let settings = CollectorSettings {
        gamepad_index: config.mapping.gamepad_index,
        quit_button: config.mapping.quit_button,
    };
    let collector = EventCollector::create(settings)?.initialize();
    Ok(Box::new(collector))
}

#[cfg(not(feature = "gamepad"))]
fn open_input(_config: &AppConfig) -> Result<Box<dyn InputSource>, DispatchError> {
    tracing::warn!("Built without gamepad support, only injected input reaches the adapter");
    Ok(Box::new(padlink::controller::QueuedInput::new()))
}

fn open_transport(config: &AppConfig) -> Box<dyn Transport> {
    // Only reachable without a target in check mode, where it is never connected
    let target = config.transport.target.clone().unwrap_or_default();
    let write_timeout = write_timeout_for(config.refresh_period());
    match config.transport.kind {
        TransportKind::Serial => Box::new(
            SerialTransport::new(target, config.transport.baud_rate).with_write_timeout(write_timeout),
        ),
        TransportKind::Tcp => Box::new(TcpTransport::new(target).with_write_timeout(write_timeout)),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
