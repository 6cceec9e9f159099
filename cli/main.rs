//! This module contains the main entrypoint to the grove cli.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use grove_tree::{EnsembleModel, PredictKind, PredictOptions, Predictor};
use itertools::Itertools;
use ndarray::prelude::*;
use std::{
	io::{Read, Write},
	path::{Path, PathBuf},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
	name = "grove",
	about = "Make predictions with gradient boosted tree models.",
	disable_help_subcommand = true
)]
enum Options {
	#[command(name = "info")]
	Info(InfoOptions),
	#[command(name = "predict")]
	Predict(PredictArgs),
}

#[derive(Parser, Debug)]
#[command(about = "print a summary of a model as json")]
struct InfoOptions {
	#[arg(short, long, help = "the path to the model text file")]
	model: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "make predictions for the rows of a csv file")]
#[command(long_about = "make predictions for the rows of a csv file of numbers, writing one line of comma separated predictions per row to stdout")]
struct PredictArgs {
	#[arg(short, long, help = "the path to the model text file")]
	model: PathBuf,
	#[arg(short, long, help = "the path to the .csv file, or - for stdin")]
	input: PathBuf,
	#[arg(long, help = "the first line of the csv file is a header")]
	header: bool,
	#[arg(long, help = "output raw scores instead of transformed predictions")]
	raw_score: bool,
	#[arg(long, default_value = "0", help = "use at most this many iterations, or all if 0")]
	num_iteration: usize,
	#[arg(long, default_value = "0", help = "the number of threads, or one per core if 0")]
	threads: usize,
	#[arg(long, help = "stop evaluating trees for a row once its prediction is decided")]
	early_stop: bool,
	#[arg(long, default_value = "10")]
	early_stop_freq: i64,
	#[arg(long, default_value = "10", allow_negative_numbers = true)]
	early_stop_margin: f64,
}

fn main() {
	init_logging();
	let options = Options::parse();
	let result = match options {
		Options::Info(options) => cli_info(options),
		Options::Predict(options) => cli_predict(options),
	};
	if let Err(error) = result {
		eprintln!("{}: {:#}", "error".red().bold(), error);
		std::process::exit(1);
	}
}

/// Log to stderr, filtered by the `GROVE_LOG` environment variable.
fn init_logging() {
	let filter = EnvFilter::try_from_env("GROVE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();
}

fn load_model(path: &Path) -> Result<EnsembleModel> {
	let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
	let model = EnsembleModel::from_bytes(&bytes)
		.with_context(|| format!("failed to load the model at {}", path.display()))?;
	Ok(model)
}

fn cli_info(options: InfoOptions) -> Result<()> {
	let model = load_model(&options.model)?;
	let summary = serde_json::to_string_pretty(&model.summary())?;
	println!("{}", summary);
	Ok(())
}

fn cli_predict(options: PredictArgs) -> Result<()> {
	let model = load_model(&options.model)?;
	let features = if options.input.as_os_str() == "-" {
		read_features(std::io::stdin(), options.header)?
	} else {
		let file = std::fs::File::open(&options.input)
			.with_context(|| format!("failed to open {}", options.input.display()))?;
		read_features(file, options.header)?
	};
	tracing::debug!(n_rows = features.nrows(), n_cols = features.ncols(), "read input");
	if features.ncols() != model.n_features() {
		tracing::warn!(
			n_cols = features.ncols(),
			n_features = model.n_features(),
			"the number of columns does not match the number of features"
		);
	}
	let kind = if options.raw_score {
		PredictKind::RawScore
	} else {
		PredictKind::Normal
	};
	let predict_options = PredictOptions {
		num_threads: options.threads,
		early_stopping: options.early_stop,
		early_stopping_frequency: options.early_stop_freq,
		early_stopping_margin: options.early_stop_margin,
	};
	let predictor = Predictor::new(&model, kind, options.num_iteration, &predict_options)?;
	let n_outputs = predictor.n_predictions_per_row();
	let mut output = vec![0.0; features.nrows() * n_outputs];
	predictor.predict(features.view(), &mut output)?;
	let stdout = std::io::stdout();
	let mut stdout = std::io::BufWriter::new(stdout.lock());
	write_predictions(&mut stdout, &output, n_outputs)?;
	stdout.flush()?;
	Ok(())
}

/// Read a csv file of numbers into a matrix with one row per record. Empty fields are missing values and become NaN.
fn read_features<R: Read>(reader: R, has_header: bool) -> Result<Array2<f64>> {
	let mut reader = csv::ReaderBuilder::new()
		.has_headers(has_header)
		.from_reader(reader);
	let mut values = Vec::new();
	let mut n_rows = 0;
	let mut n_cols = None;
	for (record_index, record) in reader.records().enumerate() {
		let record = record?;
		match n_cols {
			None => n_cols = Some(record.len()),
			Some(n_cols) if n_cols != record.len() => {
				return Err(anyhow!(
					"row {} has {} columns, expected {}",
					record_index,
					record.len(),
					n_cols
				))
			}
			Some(_) => {}
		}
		for (column_index, field) in record.iter().enumerate() {
			let field = field.trim();
			let value = if field.is_empty() {
				f64::NAN
			} else {
				field.parse::<f64>().with_context(|| {
					format!(
						"invalid number {:?} in row {}, column {}",
						field, record_index, column_index
					)
				})?
			};
			values.push(value);
		}
		n_rows += 1;
	}
	let features = Array2::from_shape_vec((n_rows, n_cols.unwrap_or(0)), values)?;
	Ok(features)
}

fn write_predictions<W: Write>(writer: &mut W, output: &[f64], n_outputs: usize) -> Result<()> {
	if n_outputs == 0 {
		return Ok(());
	}
	for row in output.chunks(n_outputs) {
		writeln!(writer, "{}", row.iter().join(","))?;
	}
	Ok(())
}

#[test]
fn test_read_features() {
	let csv = "a,b,c\n1,2,3\n4,,6.5\n";
	let features = read_features(csv.as_bytes(), true).unwrap();
	assert_eq!(features.dim(), (2, 3));
	assert_eq!(features[[1, 2]], 6.5);
	assert!(features[[1, 1]].is_nan());
	let features = read_features("1,2\n3,4\n".as_bytes(), false).unwrap();
	assert_eq!(features, array![[1.0, 2.0], [3.0, 4.0]]);
	let error = read_features("1,x\n".as_bytes(), false).unwrap_err();
	assert_eq!(error.to_string(), "invalid number \"x\" in row 0, column 1");
}

#[test]
fn test_write_predictions() {
	let mut buffer = Vec::new();
	write_predictions(&mut buffer, &[0.25, 0.75, 1.0, 0.0], 2).unwrap();
	assert_eq!(String::from_utf8(buffer).unwrap(), "0.25,0.75\n1,0\n");
}

#[test]
fn test_parse_arguments() {
	let options = Options::try_parse_from(&[
		"grove",
		"predict",
		"--model",
		"model.txt",
		"--input",
		"-",
		"--raw-score",
		"--num-iteration",
		"5",
		"--early-stop",
		"--early-stop-margin",
		"2.5",
	])
	.unwrap();
	match options {
		Options::Predict(options) => {
			assert!(options.raw_score);
			assert_eq!(options.num_iteration, 5);
			assert!(options.early_stop);
			assert_eq!(options.early_stop_freq, 10);
			assert_eq!(options.early_stop_margin, 2.5);
		}
		Options::Info(_) => panic!("expected the predict subcommand"),
	}
}
