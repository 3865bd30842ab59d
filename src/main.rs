use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use log::{info, warn};
use screenstream::capture::{CaptureSource, Frame, PixelLayout, StreamStopped, SyntheticSource};
use screenstream::config::{StreamKind, app_name, version};
use screenstream::pipeline::{CaptureSession, SessionCallbacks, SessionStatus};
use screenstream::SessionConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const STOP_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct FrameCounter {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl FrameCounter {
    fn record(&self, frame: &Frame<'_>) -> anyhow::Result<()> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON session config; flags below override its fields.")
                .required(false),
        )
        .arg(
            Arg::new("display")
                .short('d')
                .long("display")
                .value_name("ID")
                .value_parser(value_parser!(u32))
                .help("Display to capture."),
        )
        .arg(Arg::new("x").long("x").value_parser(value_parser!(i32)).help("Region left edge."))
        .arg(Arg::new("y").long("y").value_parser(value_parser!(i32)).help("Region top edge."))
        .arg(
            Arg::new("width")
                .short('W')
                .long("width")
                .value_parser(value_parser!(i32))
                .help("Region width."),
        )
        .arg(
            Arg::new("height")
                .short('H')
                .long("height")
                .value_parser(value_parser!(i32))
                .help("Region height."),
        )
        .arg(
            Arg::new("region-fps")
                .long("region-fps")
                .value_parser(value_parser!(i32))
                .help("Region stream frame rate."),
        )
        .arg(
            Arg::new("full-fps")
                .long("full-fps")
                .value_parser(value_parser!(i32))
                .help("Full-screen stream frame rate."),
        )
        .arg(
            Arg::new("layout")
                .long("layout")
                .value_name("LAYOUT")
                .help("Pixel layout emitted by the synthetic source (argb/bgra).")
                .ignore_case(true)
                .value_parser(["argb", "bgra"])
                .default_value("argb"),
        )
        .arg(
            Arg::new("duration")
                .short('t')
                .long("duration")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .help("Stop after this many seconds (0 runs until Ctrl-C).")
                .default_value("0"),
        )
        .arg(
            Arg::new("list-displays")
                .short('l')
                .long("list-displays")
                .help("Print the available displays and exit.")
                .action(ArgAction::SetTrue),
        )
}

fn session_config(matches: &ArgMatches) -> anyhow::Result<SessionConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::default(),
    };

    if let Some(id) = matches.get_one::<u32>("display") {
        config.display_id = *id;
    }
    for (name, field) in [
        ("x", &mut config.x),
        ("y", &mut config.y),
        ("width", &mut config.width),
        ("height", &mut config.height),
        ("region-fps", &mut config.region_frame_rate),
        ("full-fps", &mut config.full_screen_frame_rate),
    ] {
        if let Some(value) = matches.get_one::<i32>(name) {
            *field = *value;
        }
    }
    Ok(config)
}

fn source(matches: &ArgMatches) -> SyntheticSource {
    #[cfg(feature = "os-displays")]
    let source = SyntheticSource::with_os_displays();
    #[cfg(not(feature = "os-displays"))]
    let source = SyntheticSource::default();

    let layout = match matches.get_one::<String>("layout").map(|l| l.to_lowercase()) {
        Some(l) if l == "bgra" => PixelLayout::Bgra,
        _ => PixelLayout::Argb,
    };
    source.with_layout(layout)
}

/// Wait for `streams` stopped notifications. Returns `false` on timeout.
async fn confirm_stopped(
    stopped: &mut mpsc::UnboundedReceiver<StreamKind>,
    streams: usize,
    within: Duration,
) -> bool {
    let confirmed = async {
        for _ in 0..streams {
            if stopped.recv().await.is_none() {
                return false;
            }
        }
        true
    };
    tokio::time::timeout(within, confirmed).await.unwrap_or(false)
}

async fn run(matches: ArgMatches) -> anyhow::Result<SessionStatus> {
    let source = Arc::new(source(&matches));

    if matches.get_flag("list-displays") {
        for display in source.available_displays().await? {
            println!(
                "{}\t{}{}",
                display.id,
                display,
                if display.is_primary { " (primary)" } else { "" }
            );
        }
        return Ok(SessionStatus::Success);
    }

    let config = session_config(&matches)?;

    let region = Arc::new(FrameCounter::default());
    let full_screen = Arc::new(FrameCounter::default());
    let region_sink = {
        let counter = Arc::clone(&region);
        move |frame: &Frame<'_>| counter.record(frame)
    };
    let full_screen_sink = {
        let counter = Arc::clone(&full_screen);
        move |frame: &Frame<'_>| counter.record(frame)
    };
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let observer = move |event: StreamStopped| {
        match &event.cause {
            Some(cause) => warn!("{} stream (gen {}) ended: {}", event.kind, event.generation, cause.report()),
            None => info!("{} stream (gen {}) ended", event.kind, event.generation),
        }
        let _ = stopped_tx.send(event.kind);
    };

    let callbacks = SessionCallbacks::new(Arc::new(region_sink), Arc::new(full_screen_sink))
        .with_stop_observer(Arc::new(observer));
    let session = CaptureSession::new(source, callbacks);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || on_signal.cancel()).context("Error setting Ctrl-C handler")?;

    if let Err(e) = session.start(config) {
        eprintln!("{}", e.report());
        return Ok(session.status());
    }
    if let Err(e) = session.wait_started().await {
        eprintln!("{}", e.report());
        return Ok(session.status());
    }

    let seconds = matches.get_one::<u64>("duration").copied().unwrap_or(0);
    let deadline = async {
        if seconds == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(seconds)).await
        }
    };
    tokio::pin!(deadline);

    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut deadline => break,
            _ = report.tick() => {
                let diagnostics = session.diagnostics();
                if let Some(region) = diagnostics.region {
                    info!("region: {}", region);
                }
                if let Some(full) = diagnostics.full_screen {
                    info!("full screen: {}", full);
                }
            }
        }
    }

    let status = session.stop();
    if !confirm_stopped(&mut stopped_rx, 2, STOP_CONFIRM_TIMEOUT).await {
        warn!("Capture streams did not confirm the stop within {:?}", STOP_CONFIRM_TIMEOUT);
    }

    println!(
        "region: {} frames ({} bytes), full screen: {} frames ({} bytes), status: {}",
        region.frames.load(Ordering::Relaxed),
        region.bytes.load(Ordering::Relaxed),
        full_screen.frames.load(Ordering::Relaxed),
        full_screen.bytes.load(Ordering::Relaxed),
        session.status()
    );
    Ok(status)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")?;

    let status = runtime.block_on(run(matches))?;
    if !status.is_success() {
        std::process::exit(status.code() as i32 + 1);
    }
    Ok(())
}
