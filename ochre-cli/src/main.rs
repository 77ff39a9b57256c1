mod emulator;

use clap::{Parser, ValueEnum};
use emulator::{Emulator, TrapCapture};
use ochre_core::device::FillPolicy;
use ochre_core::gdb::DebugSession;
use ochre_core::Board;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about = "RV32IM_Zicond emulator with a GDB remote stub")]
struct Args {
    /// Path to the flash image (raw binary, loaded into ROM).
    #[arg(long)]
    flash: PathBuf,

    /// Fill policy for uninitialized RAM.
    #[arg(long, value_enum, default_value_t = FillArg::Random)]
    fill: FillArg,

    /// Trap capture mode for the non-debug run loop.
    #[arg(long, value_enum, default_value_t = TrapArg::None)]
    trap: TrapArg,

    /// Enable the GDB debug stub.
    #[arg(short = 'g', long)]
    debug: bool,

    /// Stop the emulation when a tight `j .` loop is detected.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    stop_inf_loop: bool,

    /// TCP port of the remote debugging connection.
    #[arg(short = 'p', long, default_value_t = 16355)]
    remote_port: u16,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum FillArg {
    Zero,
    One,
    Random,
    Cdcdcdcd,
}

impl From<FillArg> for FillPolicy {
    fn from(value: FillArg) -> Self {
        match value {
            FillArg::Zero => FillPolicy::Zero,
            FillArg::One => FillPolicy::One,
            FillArg::Random => FillPolicy::Random,
            FillArg::Cdcdcdcd => FillPolicy::Cdcdcdcd,
        }
    }
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum TrapArg {
    None,
    Exception,
    All,
}

impl From<TrapArg> for TrapCapture {
    fn from(value: TrapArg) -> Self {
        match value {
            TrapArg::None => TrapCapture::NoCapture,
            TrapArg::Exception => TrapCapture::ExceptionOnly,
            TrapArg::All => TrapCapture::All,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .parse_default_env()
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            log::error!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), String> {
    let flash = std::fs::read(&args.flash)
        .map_err(|error| format!("failed to read flash file {:?} ({error})", args.flash))?;
    if flash.is_empty() {
        return Err("flash file is empty".to_string());
    }

    let board =
        Board::new(&flash, args.fill.into()).map_err(|error| error.to_string())?;

    if args.debug {
        let mut session = DebugSession::new(board, args.remote_port)
            .map_err(|error| format!("failed to start the debug stub ({error})"))?;
        session.run();
    } else {
        Emulator::new(board, args.trap.into(), args.stop_inf_loop).run();
    }

    Ok(())
}
