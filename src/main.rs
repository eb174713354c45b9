mod app;
mod cli;

use std::process::ExitCode;

use clap::{error::ErrorKind, Parser};

use crate::app::down::DownArgs as AppDownArgs;
use crate::app::doctor::DoctorArgs as AppDoctorArgs;
use crate::app::status::StatusArgs as AppStatusArgs;
use crate::app::up::UpArgs as AppUpArgs;
use crate::cli::{Cli, Commands};
pub use cloudfleet::{core, load_plan, Error, Plan, Result};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    let exit = match cli.command {
        Commands::Up(args) => app::handle_up(AppUpArgs {
            plan: args.plan,
            levels: args.level,
        }),
        Commands::Down(args) => app::handle_down(AppDownArgs {
            plan: args.plan,
            levels: args.level,
        }),
        Commands::Status(args) => app::handle_status(AppStatusArgs {
            plan: args.plan,
            json: args.json,
        }),
        Commands::Doctor(args) => app::handle_doctor(AppDoctorArgs { plan: args.plan }),
    };

    match exit {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            app::error::exit_code(&err)
        }
    }
}
