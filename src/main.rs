use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use makrovm::backend::DryRunBackend;
use makrovm::compile_file;
use makrovm::vm::{Interpreter, Notification, Notifier, Options, Outcome, Repeat};

#[derive(Parser)]
#[command(name = "makrovm", version, about = "Compile and run mouse-macro scripts")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Parse and validate a macro file without running it.
    Check {
        file: PathBuf,

        /// Also check that every referenced image file exists.
        #[arg(long)]
        full: bool,
    },

    /// Execute one macro from a file.
    Run {
        file: PathBuf,

        /// Name of the macro to run.
        macro_name: String,

        /// How many times to run the macro; -1 repeats forever.
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        times: i64,

        /// Retry a failed instruction before giving up.
        #[arg(long)]
        enable_retry: bool,

        /// Number of retry attempts per instruction.
        #[arg(long, default_value_t = 1)]
        retry_times: u32,

        /// Match images in full color instead of grayscale.
        #[arg(long)]
        color_match: bool,

        /// Pixel stride for image scans, 1 (exact) to 5 (coarse).
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=5))]
        match_step: u8,

        /// Pause instead of failing when an instruction gives up.
        #[arg(long)]
        pause_on_fail: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        CliCommand::Check { file, full } => check(&file, full),
        CliCommand::Run {
            file,
            macro_name,
            times,
            enable_retry,
            retry_times,
            color_match,
            match_step,
            pause_on_fail,
        } => {
            let options = Options {
                enable_retry,
                retry_times,
                grayscale: !color_match,
                match_step,
                base_dir: base_dir(&file),
                pause_on_fail,
            };
            run(&file, &macro_name, times, options)
        }
    }
}

fn base_dir(file: &Path) -> PathBuf {
    file.parent().unwrap_or(Path::new(".")).to_path_buf()
}

fn check(file: &Path, full: bool) -> Result<()> {
    let compiled = compile_file(file).with_context(|| format!("Compiling {}", file.display()))?;
    if full {
        compiled.validate(&base_dir(file))?;
    }
    println!("No errors found.");
    Ok(())
}

fn run(file: &Path, macro_name: &str, times: i64, options: Options) -> Result<()> {
    let compiled = compile_file(file).with_context(|| format!("Compiling {}", file.display()))?;
    compiled.validate(&options.base_dir)?;

    let repeat = if times < 0 {
        Repeat::Forever
    } else {
        Repeat::Times(times.try_into().unwrap_or(u32::MAX))
    };

    let (notifier, notifications) = Notifier::channel();
    let printer = thread::spawn(move || {
        for notification in notifications {
            match notification {
                Notification::Status(message) => println!("{message}"),
                Notification::Fatal(message) => eprintln!("{message}"),
            }
        }
    });

    let mut interpreter = Interpreter::new(compiled.into_program(), DryRunBackend, options)
        .with_notifier(notifier);
    let control = interpreter.control();

    // Enter toggles pause, `q` cancels. The thread dies with the process.
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "q" | "Q" => {
                    control.cancel();
                    break;
                }
                _ => control.toggle_pause(),
            }
        }
    });

    let outcome = interpreter.interpret(macro_name, repeat);
    // Closes the notification channel so the printer drains and exits.
    drop(interpreter);
    let _ = printer.join();

    match outcome? {
        Outcome::Finished => println!("Done"),
        Outcome::Cancelled => println!("Cancelled"),
    }
    Ok(())
}
