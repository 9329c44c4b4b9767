use std::{path::PathBuf, process::ExitCode};

use anyhow::Error;
use clap::Parser;
use dcgrind::{Config, Outcome, Run};
use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};

#[derive(Parser)]
struct Cli {
    /// Run settings in JSON format
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// A log4rs configuration file, replaces the default console logging
    #[arg(long)]
    log_config: Option<PathBuf>,

    /// Increase logging verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write the recorded trace to this file
    #[arg(short, long)]
    trace_out: Option<PathBuf>,

    program: PathBuf,
}

fn init_logging(args: &Cli) -> Result<(), Error> {
    if let Some(path) = &args.log_config {
        return log4rs::init_file(path, Default::default());
    }

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{h({l:5})} {t} - {m}{n}")))
        .build();
    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))?;

    log4rs::init_config(config)?;

    Ok(())
}

fn main() -> Result<ExitCode, Error> {
    let args = Cli::parse();
    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    log::debug!("Using {config:?}");

    let run = dcgrind::grind(&args.program, config)?;
    report(&run)?;

    if let Some(path) = &args.trace_out {
        std::fs::write(path, run.trace.to_json()?)?;
        log::info!("Saved trace to {}", path.display());
    }

    Ok(match run.outcome {
        Outcome::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn report(run: &Run) -> Result<(), Error> {
    match &run.outcome {
        Outcome::Completed => println!("Completed after {} steps.", run.steps),
        Outcome::Deadlock { blocked } => {
            let blocked: Vec<String> = blocked.iter().map(|t| t.to_string()).collect();
            println!("Deadlock: threads {} are blocked.", blocked.join(", "))
        }
        Outcome::Fault { thread, fault } => println!("Fault in thread {thread}: {fault}."),
        Outcome::StepLimit { steps } => println!("Aborted after {steps} steps."),
    }

    let basis = run.basis()?;
    basis.dump();
    for process in basis.iter() {
        let root = if basis.is_topology_root(&process[0].cpid) { " (root)" } else { "" };
        println!("  {} {}{root}: {} events", process[0].ipid, process[0].cpid, process.len());
    }

    Ok(())
}
