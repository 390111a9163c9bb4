#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate loggerv;
extern crate libc;

extern crate chartcheck_core;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{App, Arg, ArgMatches, SubCommand};

use chartcheck_core::discovery;
use chartcheck_core::exec::ProcessExecutor;
use chartcheck_core::pipeline::{Coordinator, PipelineConfig};
use chartcheck_core::types::Outcome;
use chartcheck_core::Result;

fn main() {
    let app = App::new("chartcheck")
        .version(crate_version!())
        .about("Render, validate, and verify a fleet of cluster-application charts")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run-checks")
                .about("Discover ApplicationSets, render their charts, and verify every image")
                .arg(
                    Arg::with_name("env")
                        .long("env")
                        .takes_value(true)
                        .help("Restrict to one environment subdirectory (default: all)"),
                )
                .arg(
                    Arg::with_name("envdir")
                        .long("envdir")
                        .takes_value(true)
                        .default_value("../env")
                        .help("Directory containing one subdirectory per environment"),
                )
                .arg(
                    Arg::with_name("output")
                        .long("output")
                        .takes_value(true)
                        .default_value("manifests")
                        .help("Where to write rendered manifests (recreated on start)"),
                )
                .arg(
                    Arg::with_name("src-prefix")
                        .long("src-prefix")
                        .takes_value(true)
                        .default_value("../")
                        .help("Prefix joined onto baseValuesFile/valuesOverride path fragments"),
                )
                .arg(
                    Arg::with_name("workers")
                        .long("workers")
                        .takes_value(true)
                        .default_value("10")
                        .help("Worker count applied uniformly to all four pipeline stages"),
                ),
        );

    let args = app.get_matches();
    loggerv::Logger::new()
        .verbosity(args.occurrences_of("verbose") + 1)
        .module_path(false)
        .init()
        .unwrap();

    // Ignore SIGPIPE errors to avoid having to use let _ = write! everywhere
    // See https://github.com/rust-lang/rust/issues/46016
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    match args.subcommand_matches("run-checks") {
        Some(sub) => {
            let exit_code = match run(sub) {
                Ok(all_succeeded) => {
                    if all_succeeded {
                        0
                    } else {
                        1
                    }
                }
                Err(e) => {
                    error!("run-checks error: {}", e);
                    for cause in e.iter().skip(1) {
                        warn!("caused by: {}", cause);
                    }
                    1
                }
            };
            process::exit(exit_code);
        }
        None => {
            eprintln!("{}", args.usage());
            process::exit(1);
        }
    }
}

/// Runs one `run-checks` invocation to completion. Returns whether every
/// outcome succeeded (spec.md §6: "Exit code 0 iff every outcome succeeded").
fn run(args: &ArgMatches) -> Result<bool> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");
    rt.block_on(run_async(args))
}

async fn run_async(args: &ArgMatches<'_>) -> Result<bool> {
    let envdir = PathBuf::from(args.value_of("envdir").unwrap());
    let src_prefix = PathBuf::from(args.value_of("src-prefix").unwrap());
    let env = args.value_of("env");
    let workers: usize = args
        .value_of("workers")
        .unwrap()
        .parse()
        .unwrap_or(10);

    let charts = discovery::discover(&envdir, env, &src_prefix)?;
    info!("discovered {} chart(s)", charts.len());

    let config = PipelineConfig {
        output_dir: PathBuf::from(args.value_of("output").unwrap()),
        workers_per_stage: workers,
        verify_timeout: Duration::from_secs(120),
        channel_buffer: 16,
    };
    let coordinator = Coordinator::new(ProcessExecutor, config);
    let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    let mut results = coordinator.run_charts(charts, cancel_rx).await?;

    let mut all_succeeded = true;
    while let Some(outcome) = results.recv().await {
        if !outcome.is_success() {
            all_succeeded = false;
        }
        print_outcome(&outcome);
    }
    Ok(all_succeeded)
}

/// Prints one summary line per (chart, image) outcome, spec.md §7's exact
/// wording.
fn print_outcome(outcome: &Outcome) {
    let chart = outcome.chart();
    match outcome {
        Outcome::Verified(v) if v.exists && v.error.is_none() => {
            println!(
                ">>> chart {} {} from env {} with image {}: \u{2713} All checks passed",
                chart.chart_name, chart.chart_version, chart.env, v.image
            );
        }
        Outcome::Verified(v) => {
            let message = v
                .error
                .clone()
                .unwrap_or_else(|| "image absent from registry".to_string());
            println!(
                ">>> chart {} {} from env {} with image {}: \u{2717} Error: {}",
                chart.chart_name, chart.chart_version, chart.env, v.image, message
            );
        }
        Outcome::Failed(e) => {
            println!(
                ">>> chart {} {} from env {}: \u{2717} Error: {}",
                chart.chart_name, chart.chart_version, chart.env, e.error
            );
        }
    }
}
