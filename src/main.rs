use anyhow::Context;
use clap::{Arg, Command, value_parser};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{panic, process};

use v4l2_sink::config::{BACKEND_NAME, app_name, version};
use v4l2_sink::{
    BackendRegistry, DisplaySession, DisplaySpec, FrameSize, GstEngineFactory, I420Image,
    SinkConfig, SinkError, SubmitOutcome, V4l2SinkBackend,
};

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("PATH")
                .help("Output device, overrides the config file (default /dev/video0).")
                .required(false),
        )
        .arg(
            Arg::new("display")
                .long("display")
                .value_name("MODULE[,DEVICE]")
                .help("Display module line, e.g. 'gst_v4l2_sink,/dev/video1'.")
                .required(false),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON sink configuration.")
                .required(false),
        )
        .arg(
            Arg::new("frames")
                .short('n')
                .long("frames")
                .value_name("COUNT")
                .help("Number of frames to send, 0 runs until interrupted.")
                .value_parser(value_parser!(u64))
                .default_value("300"),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_name("WxH")
                .help("Frame size of the test pattern.")
                .value_parser(|s: &str| s.parse::<FrameSize>())
                .default_value("640x480"),
        )
        .arg(
            Arg::new("resize-to")
                .long("resize-to")
                .value_name("WxH")
                .help("Switch to this frame size mid stream.")
                .value_parser(|s: &str| s.parse::<FrameSize>())
                .required(false),
        )
        .arg(
            Arg::new("resize-after")
                .long("resize-after")
                .value_name("N")
                .help("Frame index at which --resize-to takes effect.")
                .value_parser(value_parser!(u64))
                .default_value("150"),
        )
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let options = Options {
        device: matches.get_one::<String>("device").cloned(),
        display: matches.get_one::<String>("display").cloned(),
        config: matches.get_one::<String>("config").cloned(),
        frames: matches.get_one::<u64>("frames").copied().unwrap_or(300),
        size: matches
            .get_one::<FrameSize>("size")
            .copied()
            .unwrap_or(FrameSize::new(640, 480)),
        resize_to: matches.get_one::<FrameSize>("resize-to").copied(),
        resize_after: matches.get_one::<u64>("resize-after").copied().unwrap_or(150),
    };

    if let Err(e) = run(options) {
        error!("{:#}", e);
        process::exit(1);
    }
}

struct Options {
    device: Option<String>,
    display: Option<String>,
    config: Option<String>,
    frames: u64,
    size: FrameSize,
    resize_to: Option<FrameSize>,
    resize_after: u64,
}

impl Options {
    fn size_at(&self, index: u64) -> FrameSize {
        match self.resize_to {
            Some(size) if index >= self.resize_after => size,
            _ => self.size,
        }
    }
}

fn run(options: Options) -> anyhow::Result<()> {
    let mut config = match &options.config {
        Some(path) => SinkConfig::from_json_file(path)?,
        None => SinkConfig::default(),
    };
    if let Some(device) = &options.device {
        config.device = Some(device.clone());
    }

    let spec = match &options.display {
        Some(line) => DisplaySpec::parse(line)
            .with_context(|| format!("Invalid display module line '{}'", line))?,
        None => DisplaySpec {
            backend: BACKEND_NAME.to_string(),
            device: None,
        },
    };
    let framerate = config.framerate.max(1);

    let mut registry = BackendRegistry::new();
    registry.init()?;
    registry.register(Arc::new(V4l2SinkBackend::new(GstEngineFactory)))?;

    let session: Arc<dyn DisplaySession> = Arc::from(registry.open(&spec, config)?);

    // gracefully close the session when receiving SIGINT, SIGTERM, or SIGHUP
    {
        let session = session.clone();
        ctrlc::set_handler(move || {
            info!("Interrupted, closing sink");
            session.close();
        })
        .context("Error setting Ctrl-C handler")?;
    }

    let result = feed(&options, session.as_ref(), framerate);
    session.close();
    registry.shutdown();
    result
}

fn feed(options: &Options, session: &dyn DisplaySession, framerate: u32) -> anyhow::Result<()> {
    let period = Duration::from_secs(1) / framerate;
    let mut image = I420Image::black(options.size);
    let mut next = Instant::now();
    let mut index = 0u64;

    while options.frames == 0 || index < options.frames {
        let size = options.size_at(index);
        if image.size != size {
            info!("Switching test pattern to {}", size);
            image = I420Image::black(size);
        }
        draw_pattern(&mut image, index);

        match session.display(app_name(), &image.as_frame()) {
            Ok(SubmitOutcome::Submitted) => {}
            Ok(SubmitOutcome::Recovered { fault }) => warn!("Recovered from {}", fault),
            Ok(SubmitOutcome::Dropped) => warn!("Frame {} dropped", index),
            Err(SinkError::Closed) => break,
            Err(e) if e.is_recoverable() => warn!("Frame {}: {}", index, e),
            Err(e) => return Err(e).with_context(|| format!("Frame {} rejected", index)),
        }

        index += 1;
        next += period;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }
    }

    info!("Sent {} frames", index);
    Ok(())
}

/// Diagonal luma ramp scrolling one pixel per frame over slowly cycling chroma
fn draw_pattern(image: &mut I420Image, tick: u64) {
    let (y_stride, c_stride) = I420Image::strides(image.size);
    let shift = tick as usize;

    for (row, line) in image.y.chunks_mut(y_stride.max(1)).enumerate() {
        for (col, px) in line.iter_mut().enumerate() {
            *px = 16 + ((row + col + shift) % 220) as u8;
        }
    }

    let phase = (tick % 256) as u8;
    for (row, line) in image.u.chunks_mut(c_stride.max(1)).enumerate() {
        line.fill(phase.wrapping_add(row as u8));
    }
    image.v.fill(255 - phase);
}
