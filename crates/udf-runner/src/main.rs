use anyhow::Context;
use clap::Parser;
use scalar_udf::{Operator, Row, Schema};
use std::io::{BufRead, Write};
use udf_runner::{json, PipeConfig, ProcessRunner};

/// udf-pipe evaluates a scalar function over JSON rows read from stdin, using
/// a worker process, and writes each row's forwarded fields joined with its
/// function result to stdout.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Path to a JSON file holding `operator` and `worker` configuration.
    #[clap(long, env = "UDF_PIPE_CONFIG")]
    config: std::path::PathBuf,

    /// Filter of logs written to stderr, such as "info" or "udf_runner=debug".
    #[clap(long, default_value = "info", env = "UDF_LOG")]
    log: String,
}

fn main() {
    let args = Args::parse();

    // Logs are written to stderr as JSON lines.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.log.as_str())
        .json()
        .flatten_event(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_current_span(true)
        .with_span_list(false)
        .with_target(false)
        .init();

    if let Err(err) = run(args) {
        tracing::error!(error = ?err, "udf-pipe failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = PipeConfig::load(&args.config)?;
    let input_schema = config.operator.input_schema.clone();

    let runner = ProcessRunner::new(config.worker);
    let mut op = Operator::new(config.operator, runner)?;

    let mut stdout = std::io::BufWriter::new(std::io::stdout().lock());
    let pumped = pump(&mut op, &input_schema, &mut stdout);

    // Close regardless of how pumping ended. A failed operator abandons.
    let mut rows = Vec::new();
    let closed = op.close(&mut rows);

    write_rows(&mut stdout, &mut rows)?;
    stdout.flush().context("flushing stdout")?;

    pumped?;
    let stats = closed?;

    tracing::info!(
        records_in = stats.records_in,
        records_out = stats.records_out,
        call_bytes = stats.call_bytes,
        result_bytes = stats.result_bytes,
        backpressure_waits = stats.backpressure_waits,
        backpressure_duration = ?stats.backpressure_duration,
        "udf-pipe finished"
    );
    Ok(())
}

// Push each row of stdin through `op`, writing joined rows as they're ready.
fn pump<W: Write>(
    op: &mut Operator<ProcessRunner>,
    input_schema: &Schema,
    out: &mut W,
) -> anyhow::Result<()> {
    let mut rows = Vec::new();

    for (index, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let row = json::parse_row(&line, input_schema)
            .with_context(|| format!("parsing input line {}", index + 1))?;

        op.on_record(row, &mut rows)?;
        write_rows(out, &mut rows)?;
    }
    op.flush(&mut rows)?;
    write_rows(out, &mut rows)
}

fn write_rows<W: Write>(out: &mut W, rows: &mut Vec<Row>) -> anyhow::Result<()> {
    for row in rows.drain(..) {
        writeln!(out, "{}", json::render_row(&row)).context("writing stdout")?;
    }
    Ok(())
}
