#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::env;
use std::process::ExitCode;
use std::sync::mpsc;

use trapd_agent::service::{AgentService, SERVICE_NAME};

const BAD_CONFIG_ERR_CODE: u8 = 1;
const START_FAILED_ERR_CODE: u8 = 2;

enum ControlEvent {
    Stop,
}

fn main() -> ExitCode {
    let mut once = false;

    if let Some(arg) = env::args().nth(1) {
        match arg.as_str() {
            "--once" => once = true,
            "run" => {}
            _ => {
                eprintln!("[ERROR] Invalid command: {arg}");
                eprintln!("Usage: {SERVICE_NAME} [run | --once]");
                return ExitCode::from(BAD_CONFIG_ERR_CODE);
            }
        }
    }

    let mut service = match AgentService::load() {
        Ok(service) => service,
        Err(error) => {
            // At this point, the logger may or may not be initialized.
            eprintln!("[ERROR] Failed to load service: {error:#}");
            return ExitCode::from(BAD_CONFIG_ERR_CODE);
        }
    };

    if once {
        return match service.run_single_cycle() {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(error = format!("{error:#}"), "Single cycle failed");
                ExitCode::from(START_FAILED_ERR_CODE)
            }
        };
    }

    let (tx, rx) = mpsc::channel();

    ctrlc::set_handler(move || {
        let _ = tx.send(ControlEvent::Stop);
    })
    .expect("failed to register Ctrl-C handler");

    if let Err(error) = service.start() {
        error!(error = format!("{error:#}"), "Failed to start");
        return ExitCode::from(START_FAILED_ERR_CODE);
    }

    info!("{} service started", SERVICE_NAME);

    // The external supervisor owns restarts; the process just waits for a
    // stop request.
    while let Ok(event) = rx.recv() {
        match event {
            ControlEvent::Stop => break,
        }
    }

    info!("{} service stopping", SERVICE_NAME);

    service.stop();

    ExitCode::SUCCESS
}
