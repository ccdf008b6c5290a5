//! `_worker` entry point.
//!
//! Reads one JSON request from stdin, runs the scan in its own runtime and
//! writes exactly one JSON response to stdout. All logging goes to stderr,
//! where the parent picks it up and re-emits it under the worker's hash
//! prefix. Panics anywhere inside the scan are trapped and reported as a
//! structured `worker_error` result so the parent never loses the slot.

use std::io::Read;
use std::panic::AssertUnwindSafe;

use truespec_core::scan::{run_worker, ScanResult, ScanStatus, WorkerInput, WorkerOutput};

use crate::commands::init_logging;

pub fn worker_main() {
    init_logging(true);

    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        emit(error_output("unknown", format!("read input: {e}")));
        std::process::exit(1);
    }

    let input: WorkerInput = match serde_json::from_str(&raw) {
        Ok(input) => input,
        Err(e) => {
            emit(error_output("unknown", format!("decode input: {e}")));
            std::process::exit(1);
        }
    };
    let info_hash = input.info_hash.clone();

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let runtime = tokio::runtime::Runtime::new()?;
        Ok::<WorkerOutput, std::io::Error>(runtime.block_on(run_worker(input)))
    }));

    let output = match outcome {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => error_output(&info_hash, format!("start runtime: {e}")),
        Err(panic) => error_output(&info_hash, format!("panic: {}", panic_message(&panic))),
    };

    emit(output);
}

/// The single stdout write of the process.
fn emit(output: WorkerOutput) {
    match serde_json::to_string(&output) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error encoding worker output: {e}");
            std::process::exit(1);
        }
    }
}

fn error_output(info_hash: &str, message: String) -> WorkerOutput {
    WorkerOutput {
        result: ScanResult::failure(info_hash, ScanStatus::WorkerError, message),
        downloaded: 0,
        uploaded: 0,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
