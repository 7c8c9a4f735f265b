//! Driver for the TeideOS simulator.
//!
//! Boots a kernel and either runs the built-in thread demo or loads a user
//! program image into the stub file system and executes it. `RUST_LOG`
//! selects kernel log output (e.g. `RUST_LOG=teide_os=debug`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use teide_os::Kernel;

#[derive(Parser)]
#[command(name = "teide")]
#[command(version)]
#[command(about = "Instructional operating-system simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cooperative thread demo
    Threads {
        /// Number of threads to fork
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        /// Loop iterations per thread
        #[arg(short, long, default_value_t = 10)]
        iterations: usize,
    },

    /// Load a user program image and execute it
    Exec {
        /// Path to the program image
        image: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Threads { count, iterations } => thread_demo(count, iterations),
        Commands::Exec { image } => exec_image(&image),
    }
}

/// Fork `count` threads that each loop `iterations` times, yielding the CPU
/// on every pass, and wait for all of them.
fn thread_demo(count: usize, iterations: usize) -> anyhow::Result<()> {
    let kernel = Kernel::new();

    let mut children = Vec::new();
    for n in 1..=count {
        let name = format!("thread {n}");
        children.push(kernel.fork_joinable(&name, 0, {
            let kernel = Arc::clone(&kernel);
            let name = name.clone();
            move || {
                for round in 0..iterations {
                    println!("*** {name} looped {round} times");
                    kernel.yield_now();
                }
                println!(">>> {name} has finished");
            }
        }));
    }

    for child in children {
        kernel.join(child);
    }
    Ok(())
}

/// Copy the image into the simulated file system, spawn it, and wait for it
/// to finish or halt the machine.
fn exec_image(image: &PathBuf) -> anyhow::Result<()> {
    let bytes = std::fs::read(image)
        .with_context(|| format!("failed to read image {}", image.display()))?;
    let name = image
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("a.out");

    let kernel = Kernel::new();
    kernel.file_system().preload(name, bytes);

    let program = kernel
        .exec(name)
        .with_context(|| format!("failed to exec {name}"))?;
    let status = kernel.join(program);
    println!("{name} finished with status {status}");
    if kernel.halted() {
        println!("machine halted");
    }
    Ok(())
}
