use anyhow::{Context, bail};
use slog::info;
use std::sync::atomic::Ordering;

use callfuzz::FuzzerState;
use callfuzz::config::FuzzConfig;
use callfuzz::fuzzer::{FuzzerBuilder, FuzzerState};
use callfuzz::invocation::Invocation;
use callfuzz::orchestrator::{self, FuzzerOrchestrator};
use callfuzz::shim::{TargetRegistry, worker_main};
use callfuzz::util::stderr_logger;
use callfuzz::value::Value;

/// Splits `Name: value` and shortens the name to `max_name` bytes.
fn split_header(line: &str, max_name: i64) -> anyhow::Result<(String, String)> {
    let Some((name, value)) = line.split_once(':') else {
        bail!("no separator in {line:?}");
    };
    if max_name < 0 {
        bail!("negative name limit");
    }
    let limit = (max_name as usize).min(name.len());
    // Byte slicing: panics when `limit` lands inside a multi-byte character.
    Ok((name[..limit].trim().to_string(), value.trim().to_string()))
}

/// Folds `line` into chunks of `width` characters.
fn fold_line(line: &str, width: i64) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let width = width.max(0) as usize;
    let mut chunks = Vec::new();
    let mut start = 0;
    // A zero width never advances.
    while start < chars.len() {
        let end = (start + width).min(chars.len());
        if end > start {
            chunks.push(chars[start..end].iter().collect());
        }
        start = end;
    }
    chunks
}

fn text_and_int(call: &Invocation) -> anyhow::Result<(&str, i64)> {
    match call.positional.as_slice() {
        [Value::Text(text), Value::Int(n)] => Ok((text, *n)),
        other => bail!("expected (text, int), got {other:?}"),
    }
}

fn targets() -> TargetRegistry {
    TargetRegistry::new()
        .register("headers.split_header", |call| {
            let (line, max_name) = text_and_int(call)?;
            split_header(line, max_name)?;
            Ok(())
        })
        .register("headers.fold_line", |call| {
            let (line, width) = text_and_int(call)?;
            fold_line(line, width);
            Ok(())
        })
}

fn seeds() -> Vec<Invocation> {
    vec![
        Invocation::positional(
            "headers.split_header",
            vec![Value::Text("Content-Type: text/plain".into()), Value::Int(8)],
        ),
        Invocation::positional(
            "headers.fold_line",
            vec![Value::Text("Accept: */*".into()), Value::Int(4)],
        ),
    ]
}

#[derive(FuzzerState)]
struct HeaderSplitFuzzer {
    state: FuzzerState,
}

impl FuzzerOrchestrator for HeaderSplitFuzzer {}

fn load_config(path: Option<String>) -> anyhow::Result<FuzzConfig> {
    match path {
        Some(path) => FuzzConfig::load(&path).with_context(|| format!("loading {path}")),
        None => Ok(FuzzConfig::default()),
    }
}

fn build_fuzzer(config: FuzzConfig) -> anyhow::Result<HeaderSplitFuzzer> {
    let logger = stderr_logger(config.log_level()?);
    let state = FuzzerBuilder::new()
        .name("header_split")
        .with_config(config)
        .with_seeds(seeds())
        .with_logger(logger)
        .build();
    Ok(HeaderSplitFuzzer { state })
}

/// `header_split [config.toml]` fuzzes every seed;
/// `header_split replay <target> <ordinal> [config.toml]` re-runs one recorded mutant.
fn actual_main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    match args.next() {
        Some(command) if command == "replay" => {
            let target = args.next().context("missing target")?;
            let ordinal: u64 = args
                .next()
                .context("missing ordinal")?
                .parse()
                .context("ordinal must be a number")?;
            let seed = seeds()
                .into_iter()
                .find(|seed| seed.target == target)
                .with_context(|| format!("no seed for {target}"))?;
            let fuzzer = build_fuzzer(load_config(args.next())?)?;
            orchestrator::replay_one(fuzzer, &seed, ordinal)?;
        }
        path => {
            let fuzzer = build_fuzzer(load_config(path)?)?;
            let logger = fuzzer.state.logger().clone();
            let cancel = fuzzer.state.cancel_flag();
            ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))?;

            let report = orchestrator::run(fuzzer)?;
            info!(logger, "header_split finished";
                "executions" => report.executions(),
                "failures" => report.failures(),
                "cancelled" => report.cancelled);
        }
    }
    Ok(())
}

fn main() {
    let registry = targets();
    worker_main(&registry, || {
        if let Err(e) = actual_main() {
            eprintln!("header_split: {e:#}");
            std::process::exit(1);
        }
    });
}
