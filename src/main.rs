//! Scanpipe CLI
//!
//! Demonstration front end: runs a TOML-described pipeline over an image file
//! through the memory-bounded coordinator.

use anyhow::{bail, Context, Result};
use scanpipe::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("scanpipe");
    if args.len() < 2 {
        print_usage(program);
        return;
    }

    let result = match args[1].as_str() {
        "process" => ProcessArgs::parse(&args[2..]).and_then(|a| process(&a)),
        "describe" => match args.get(2) {
            Some(path) => describe(path),
            None => Err(anyhow::anyhow!("describe needs a pipeline file")),
        },
        "formats" => {
            list_formats();
            Ok(())
        }
        "kernels" => {
            list_kernels();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage(program);
            Ok(())
        }
        other => {
            print_usage(program);
            Err(anyhow::anyhow!("unknown command: {}", other))
        }
    };

    if let Err(err) = result {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("Scanpipe v{}", scanpipe::VERSION);
    println!();
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  process <in> <out> --pipeline <file> [--config <file>] [--tiled|--direct]");
    println!("                      Run a pipeline over an image and save the result");
    println!("  describe <file>     Validate a pipeline file and print it as JSON");
    println!("  formats             List pixel formats");
    println!("  kernels             List SIMD backends usable on this machine");
    println!("  help                Show this help message");
    println!();
    println!("Set RUST_LOG=debug to see routing and tiling decisions.");
}

struct ProcessArgs {
    input: PathBuf,
    output: PathBuf,
    pipeline: PathBuf,
    config: Option<PathBuf>,
    mode: Option<ProcessingMode>,
}

impl ProcessArgs {
    fn parse(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            bail!("process needs an input and an output path");
        }
        let mut pipeline = None;
        let mut config = None;
        let mut mode = None;

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--pipeline" if i + 1 < args.len() => {
                    pipeline = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                }
                "--config" if i + 1 < args.len() => {
                    config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                }
                "--tiled" => {
                    mode = Some(ProcessingMode::ForceTiled);
                    i += 1;
                }
                "--direct" => {
                    mode = Some(ProcessingMode::ForceDirect);
                    i += 1;
                }
                other => bail!("unknown option: {}", other),
            }
        }

        Ok(Self {
            input: PathBuf::from(&args[0]),
            output: PathBuf::from(&args[1]),
            pipeline: pipeline.context("--pipeline is required")?,
            config,
            mode,
        })
    }
}

fn process(args: &ProcessArgs) -> Result<()> {
    let description = PipelineDescription::load(&args.pipeline)
        .with_context(|| format!("loading pipeline {}", args.pipeline.display()))?;
    let mut config = match &args.config {
        Some(path) => ProcessingConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ProcessingConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    let pipeline = Pipeline::from_stages(&description.stages).context("building pipeline")?;
    log::info!(
        "pipeline '{}': {} stages, kernels {}",
        description.name.as_deref().unwrap_or("unnamed"),
        pipeline.len(),
        pipeline.kernels().level()
    );

    let image = image::open(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let scan = PixelBuffer::from_dynamic_image(&image)?;
    log::info!("input {}x{} {}", scan.width(), scan.height(), scan.format());

    let coordinator = TiledProcessingCoordinator::new(pipeline, config)?.with_progress(Arc::new(
        |update: ProgressUpdate| match update {
            ProgressUpdate::TilesPlanned { count } => log::info!("split into {} tiles", count),
            ProgressUpdate::StageStarted { node_name, index, total, .. } => {
                log::info!("stage {}/{}: {}", index + 1, total, node_name)
            }
            ProgressUpdate::Completed { total_duration_ms, units_processed, .. } => {
                log::info!("finished {} units in {}ms", units_processed, total_duration_ms)
            }
            ProgressUpdate::Error { message, .. } => log::error!("{}", message),
            _ => {}
        },
    ));

    let output = pollster::block_on(coordinator.process_async(scan))?;
    let exportable = match output.format() {
        PixelFormat::Mono8 | PixelFormat::Rgb24 | PixelFormat::Rgba32 | PixelFormat::HighPrecision16 => output,
        other => {
            log::info!("converting {} output to rgb24 for export", other);
            FormatConvertNode::new(PixelFormat::Rgb24).convert(&output, &NodeContext::new())?
        }
    };
    exportable
        .to_dynamic_image()?
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    log::info!("saved {}", args.output.display());

    let report = serde_json::json!({
        "memory": coordinator.memory_stats(),
        "performance": coordinator.performance_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn describe(path: &str) -> Result<()> {
    let description = PipelineDescription::load(path).with_context(|| format!("loading {}", path))?;
    let pipeline = Pipeline::from_stages(&description.stages)?;
    for (index, stage) in pipeline.stages().iter().enumerate() {
        println!("{:>2}. {} ({})", index + 1, stage.node.name(), stage.node.kind());
        for (name, value) in stage.node.parameters() {
            println!("      {} = {}", name, value);
        }
    }
    println!();
    println!("{}", description.to_json()?);
    Ok(())
}

fn list_formats() {
    println!("Pixel formats:");
    for format in PixelFormat::all() {
        println!(
            "  {:<18} {:>2} bits/pixel, {} channel(s)",
            format.name(),
            format.bits_per_pixel(),
            format.channels()
        );
    }
}

fn list_kernels() {
    println!("Detected: {}", SimdLevel::detect());
    for level in SimdLevel::available() {
        println!("  {} ({} byte vectors)", level, level.vector_bytes());
    }
}
