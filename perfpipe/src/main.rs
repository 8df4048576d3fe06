//! # perfpipe - Main Entry Point
//!
//! Two subcommands:
//! - **produce**: synthetic samples → ordering → thread pool → producer → collector
//! - **collect**: accepts producers and drives start/stop capture cycles
//!
//! Both run a Ctrl+C aware loop; the pipeline itself runs on plain threads.

// Time conversions lose precision only for display
#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use perfpipe::cli::{Args, CollectArgs, Command, ProduceArgs};
use perfpipe::collector::ProducerSideServer;
use perfpipe::config::PipelineConfig;
use perfpipe::domain::ConfigError;
use perfpipe::executor::ThreadPool;
use perfpipe::pipeline::{CapturePipeline, PipelineController};
use perfpipe::producer::BufferedCaptureEventProducer;
use perfpipe::source::SyntheticSource;
use perfpipe::transport::{ProducerSideAddress, SocketChannel, DEFAULT_CONNECT_TIMEOUT};
use perfpipe_common::CaptureOptions;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

const TICK: Duration = Duration::from_millis(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.downcast_ref::<ConfigError>().is_some()) {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Produce(produce) => run_produce(produce, args.quiet).await,
        Command::Collect(collect) => run_collect(collect, args.quiet).await,
    }
}

/// Config file (or defaults) with command-line overrides applied.
fn load_config(args: &ProduceArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(address) = &args.address {
        config.address.clone_from(address);
    }
    if let Some(delay) = args.reconnect_delay_ms {
        config.reconnection_delay_ms = delay;
    }
    if let Some(min) = args.min_workers {
        config.min_workers = min;
    }
    if let Some(max) = args.max_workers {
        config.max_workers = max;
    }
    if let Some(ttl) = args.idle_ttl_ms {
        config.idle_ttl_ms = ttl;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

// ============================================================================
// produce
// ============================================================================

async fn run_produce(args: ProduceArgs, quiet: bool) -> Result<()> {
    let config = load_config(&args)?;
    let address = config.producer_side_address()?;

    if !quiet {
        println!("perfpipe v{}", env!("CARGO_PKG_VERSION"));
        println!("collector: {address}");
        println!(
            "workers: {}..{} (idle ttl {}ms)",
            config.min_workers, config.max_workers, config.idle_ttl_ms
        );
        println!("origins: {}", args.origins);
    }

    let pool = Arc::new(ThreadPool::new(config.min_workers, config.max_workers, config.idle_ttl()));
    let producer = BufferedCaptureEventProducer::new();
    producer.producer().set_reconnection_delay(config.reconnection_delay());

    let controller = Arc::new(PipelineController::new(CapturePipeline::new(
        config.pipeline_settings(),
        Arc::clone(&pool),
        producer.event_sender(),
    )));
    producer.set_downstream_listener(Arc::clone(&controller) as _);
    let channel = SocketChannel::new(address)
        .with_connect_timeout(config.reconnection_delay().min(DEFAULT_CONNECT_TIMEOUT));
    producer
        .build_and_start(Arc::new(channel))
        .context("Failed to start capture event producer")?;

    let mut source = SyntheticSource::new(args.origins, args.seed);
    let clock = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let mut status_timer = Instant::now();
    let mut exit_reason = "interrupted";

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if let Some(limit) = duration_limit {
            if clock.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        if controller.is_active() {
            let now_ns = u64::try_from(clock.elapsed().as_nanos()).unwrap_or(u64::MAX);
            let events = source.read_burst(now_ns, args.events_per_tick);
            controller.tick(events, now_ns);
        }

        if status_timer.elapsed() > STATUS_INTERVAL {
            let snapshot = controller.snapshot();
            info!(
                "state: {}, pool: {} workers ({} busy), released: {}, sent: {}",
                producer.state(),
                pool.pool_size(),
                pool.busy_thread_count(),
                snapshot.events_released,
                producer.events_sent()
            );
            status_timer = Instant::now();
        }

        tokio::select! {
            () = tokio::time::sleep(TICK) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    producer.shutdown_and_wait();
    pool.shutdown();
    pool.wait();

    if !quiet {
        let snapshot = controller.snapshot();
        eprintln!(
            "\n{}: {:.1}s, {} captures, {} samples (released: {}, discarded: {}, sent: {}, dropped: {})",
            exit_reason,
            clock.elapsed().as_secs_f64(),
            controller.captures_completed(),
            source.emitted(),
            snapshot.events_released,
            snapshot.events_discarded,
            producer.events_sent(),
            producer.events_dropped(),
        );
    }
    Ok(())
}

// ============================================================================
// collect
// ============================================================================

enum WaitOutcome {
    Ready,
    TimedOut,
    Interrupted,
}

async fn wait_until<C>(
    ctrl_c: &mut Pin<&mut C>,
    timeout: Duration,
    ready: impl Fn() -> bool,
) -> WaitOutcome
where
    C: Future<Output = std::io::Result<()>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if ready() {
            return WaitOutcome::Ready;
        }
        if Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }
        tokio::select! {
            () = tokio::time::sleep(TICK) => {}
            _ = ctrl_c.as_mut() => return WaitOutcome::Interrupted,
        }
    }
}

async fn run_collect(args: CollectArgs, quiet: bool) -> Result<()> {
    let address: ProducerSideAddress = args.listen.parse()?;
    let mut server = ProducerSideServer::bind(&address)
        .with_context(|| format!("Failed to listen on {address}"))?;
    let timeout = Duration::from_secs(args.timeout);

    if !quiet {
        println!("perfpipe v{}", env!("CARGO_PKG_VERSION"));
        println!("listening: {}", server.address());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut signals_expected = 0;
    for capture_id in 1..=args.captures {
        match wait_until(&mut ctrl_c, timeout, || {
            server.stats().active_connections >= args.producers
        })
        .await
        {
            WaitOutcome::Ready => {}
            WaitOutcome::TimedOut => {
                anyhow::bail!("No producer connected within {}s", args.timeout)
            }
            WaitOutcome::Interrupted => break,
        }

        let options = CaptureOptions { capture_id, ..CaptureOptions::default() };
        let producers = server.start_capture(options);
        if !quiet {
            println!("capture {capture_id}: started on {producers} producers");
        }

        let interrupted = matches!(
            wait_until(&mut ctrl_c, Duration::from_secs(args.duration), || false).await,
            WaitOutcome::Interrupted
        );

        signals_expected += server.stop_capture() as u64;
        if !server.wait_for_all_events_sent(signals_expected, timeout) {
            warn!("Not every producer confirmed the end of capture {capture_id}");
            signals_expected = server.stats().all_events_sent;
        }

        let events = server.take_events();
        let ordered = events.windows(2).all(|pair| pair[0].timestamp_ns <= pair[1].timestamp_ns);
        server.capture_finished();

        if !quiet {
            println!(
                "capture {capture_id}: {} events, {} ordered",
                events.len(),
                if ordered { "fully" } else { "not" }
            );
        }
        if interrupted {
            break;
        }
    }

    let stats = server.stats();
    server.shutdown();
    if !quiet {
        eprintln!(
            "\ncollector: {} connections, {} batches, {} events",
            stats.connections_accepted, stats.batches_received, stats.events_received
        );
    }
    Ok(())
}
