//! Forward CTI model CLI
//!
//! Reads one or more images in the whitespace text format (`# rows cols`
//! header, row-major decimals), clocks them through a detector model, and
//! writes `<stem>_cti.txt` next to each input.
//!
//! The model comes from `--model FILE` (JSON, see `config::ModelFile`) or
//! falls back to the built-in demo model: one instant-capture species of
//! density 10 with a one-transfer half-life in a 10k-electron well.
//!
//! Flags: `-h` help, `-v N` verbosity 0..2, `--model FILE`,
//! `--express N`, `--parallel-only` / `--serial-only`. Exit 0 on success,
//! 1 on any error.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use cticlock::config::ModelFile;
use cticlock::{add_cti, ClockOptions, ClockParams, Image};

fn print_help() {
    eprintln!(
        "add_cti — add charge-transfer-inefficiency trails to images

USAGE:
    add_cti [OPTIONS] IMAGE...

OPTIONS:
    -h              Print this help and exit
    -v N            Verbosity: 0 silent, 1 progress (default), 2 diagnostics
    --model FILE    JSON detector model (default: built-in demo model)
    --express N     Override the model's express setting
    --parallel-only Clock the parallel direction only (default: both)
    --serial-only   Clock the serial direction only

Images use whitespace text with a `# rows cols` header; outputs are
written as `<stem>_cti.txt` beside each input."
    );
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "error",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    input.with_file_name(format!("{stem}{suffix}.txt"))
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut verbosity: u8 = 1;
    let mut model_path: Option<PathBuf> = None;
    let mut express_override: Option<usize> = None;
    let mut parallel_only = false;
    let mut serial_only = false;
    let mut images: Vec<PathBuf> = Vec::new();

    let mut it = args.iter().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" => {
                let value = it.next().context("-v requires a value; run with -h for help")?;
                verbosity = value.parse().context("-v expects 0, 1, or 2")?;
            }
            "--model" => {
                let value =
                    it.next().context("--model requires a path; run with -h for help")?;
                model_path = Some(PathBuf::from(value));
            }
            "--express" => {
                let value = it.next().context("--express requires a value")?;
                express_override = Some(value.parse().context("--express expects an integer")?);
            }
            "--parallel-only" => parallel_only = true,
            "--serial-only" => serial_only = true,
            other if other.starts_with('-') => {
                bail!("option `{other}` not recognised; run with -h for help");
            }
            path => images.push(PathBuf::from(path)),
        }
    }
    init_tracing(verbosity);

    if images.is_empty() {
        bail!("no input images; run with -h for help");
    }
    if parallel_only && serial_only {
        bail!("--parallel-only and --serial-only are mutually exclusive");
    }

    let model = match &model_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read model file {}", path.display()))?;
            ModelFile::from_json(&text)
                .with_context(|| format!("parse model file {}", path.display()))?
        }
        None => ModelFile::default(),
    };

    let traps = model.build_traps()?;
    let ccd = model.build_ccd()?;
    let roe = model.build_roe()?;

    let mut params = ClockParams::new(&roe, &ccd, &traps);
    params.express = express_override.unwrap_or(model.express);
    params.offset = model.offset;
    params.prune_n_electrons = model.prune_n_electrons;
    params.prune_frequency = model.prune_frequency;

    for path in &images {
        let image =
            Image::load_txt(path).with_context(|| format!("load image {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            n_rows = image.n_rows(),
            n_columns = image.n_columns(),
            "adding CTI"
        );

        let parallel = if serial_only { None } else { Some(&params) };
        let serial = if parallel_only { None } else { Some(&params) };
        let trailed = add_cti(&image, parallel, serial, ClockOptions::default())
            .with_context(|| format!("clock image {}", path.display()))?;

        let out = output_path(path, "_cti");
        trailed
            .save_txt(&out)
            .with_context(|| format!("write output {}", out.display()))?;
        tracing::info!(path = %out.display(), "wrote trailed image");
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
