//! `crf-apply`: tags files with a linear-chain CRF model.
//!
//! ```text
//! crf-apply -c ner.cfg -m ner.model input.txt > tagged.tsv
//! crf-apply -c chunk.cfg -m chunk.model -e test.conll
//! ```

mod output;

use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Instant;

use clap::Parser;
use lcrf_core::config::{Column, InputMode};
use lcrf_core::{load_model, Applier, CancelToken, CrfConfig, Evaluation, UnitResult};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::output::{sink, write_evaluation, Format, ResultSink};

#[derive(Debug, Parser)]
#[command(name = "crf-apply", version, about = "Applies a linear-chain CRF model to text.")]
struct Args {
    /// Configuration file (`Key = Value` or `.json`)
    #[arg(short, long)]
    config: PathBuf,

    /// Model file in CRFsuite dump format
    #[arg(short, long)]
    model: PathBuf,

    /// Treat the input as running text whatever the configuration says
    #[arg(short, long)]
    running_text: bool,

    /// Compare against the `Label` column and print an evaluation report
    #[arg(short, long)]
    evaluate: bool,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value_t = Format::Tsv)]
    format: Format,

    /// Worker threads (0 = one per core)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Units decoded per parallel chunk
    #[arg(long, default_value_t = 64)]
    chunk_size: usize,

    /// Stop after this many units in total
    #[arg(long)]
    max_units: Option<usize>,

    /// Input files; standard input when empty
    inputs: Vec<PathBuf>,
}

fn open(path: Option<&PathBuf>) -> Result<Box<dyn BufRead + Send>, Box<dyn Error>> {
    Ok(match path {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    })
}

/// Decodes `reader` on a worker thread and hands each result to `consume` in
/// input order. Returns the number of units consumed.
fn run<F>(
    applier: &Applier,
    reader: Box<dyn BufRead + Send>,
    args: &Args,
    budget: Option<usize>,
    mut consume: F,
) -> Result<usize, Box<dyn Error>>
where
    F: FnMut(&UnitResult) -> io::Result<()>,
{
    let cancel = CancelToken::new();
    let (tx, rx) = mpsc::channel();
    std::thread::scope(|scope| {
        let worker = scope.spawn(|| applier.apply_streaming(reader, args.chunk_size, &cancel, tx));
        let mut consumed = 0;
        let mut failure = None;
        for result in rx.iter() {
            if budget.is_some_and(|b| consumed >= b) {
                cancel.cancel();
                break;
            }
            if let Err(e) = consume(&result) {
                cancel.cancel();
                failure = Some(e);
                break;
            }
            consumed += 1;
        }
        drop(rx);
        let joined = worker.join().map_err(|_| "decoding thread panicked")?;
        joined?;
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(consumed),
        }
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new().num_threads(args.threads).build_global()?;
    }

    let mut config = CrfConfig::load(&args.config)?;
    if args.running_text {
        config = config.with_input(InputMode::RunningText)?;
    }
    if args.evaluate && !matches!(config.input(), InputMode::Columns(layout) if layout.has(Column::Label)) {
        return Err("evaluation needs column input with a Label column".into());
    }
    let output_token = config.output_token();
    let default_label = config.default_label().to_string();
    let applier = Applier::new(config, load_model(&args.model)?);

    let inputs: Vec<Option<&PathBuf>> = if args.inputs.is_empty() {
        vec![None]
    } else {
        args.inputs.iter().map(Some).collect()
    };

    let start = Instant::now();
    let mut remaining = args.max_units;
    let mut evaluation = Evaluation::new(Some(default_label.as_str()));
    for input in inputs {
        if remaining == Some(0) {
            break;
        }
        if let Some(path) = input {
            info!(path = %path.display(), "tagging");
        }
        let reader = open(input)?;
        let consumed = if args.evaluate {
            run(&applier, reader, &args, remaining, |result| {
                evaluation.accumulate_result(result);
                Ok(())
            })?
        } else {
            let stdout = io::stdout();
            let mut out: Box<dyn ResultSink> = sink(args.format, stdout.lock(), output_token);
            let consumed = run(&applier, reader, &args, remaining, |result| out.write_unit(result))?;
            out.finish()?;
            consumed
        };
        remaining = remaining.map(|r| r.saturating_sub(consumed));
    }

    if args.evaluate {
        if evaluation.skipped_units() > 0 {
            warn!(
                failed = evaluation.failed_units(),
                unlabeled = evaluation.unlabeled_units(),
                "units left out of the evaluation"
            );
        }
        write_evaluation(args.format, io::stdout().lock(), &evaluation)?;
    }

    let stats = applier.stats();
    info!(
        units = stats.units,
        failed = stats.failed,
        tokens = stats.tokens,
        elapsed_sec = start.elapsed().as_secs_f64(),
        "done"
    );
    Ok(())
}
