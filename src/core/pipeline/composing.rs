use nix::sys::signal::Signal;

use crate::{
    constants::{
        COMPILE_TIMED_OUT_MSG, MEMORY_EXCEEDED_MSG, ORPHANED_MSG, OUTPUT_EXCEEDED_MSG,
        TIMED_OUT_MSG,
    },
    core::domain::{EngineReport, ExecutionOutcome, ExecutionResult},
};

/// Reduces the engine's raw outcomes to the two channels returned to callers.
pub fn compose(report: &EngineReport) -> ExecutionResult {
    if let Some(compile) = report.compile.as_ref().filter(|o| !o.succeeded()) {
        return ExecutionResult {
            output_string: String::new(),
            error_string: compile_diagnostics(compile),
        };
    }

    let Some(run) = &report.run else {
        return ExecutionResult::default();
    };

    let error_string = if run.stderr.is_empty() {
        synthesized_error(run).unwrap_or_default()
    } else {
        run.stderr.clone()
    };

    ExecutionResult {
        output_string: run.stdout.clone(),
        error_string,
    }
}

fn compile_diagnostics(outcome: &ExecutionOutcome) -> String {
    if !outcome.stderr.is_empty() {
        return outcome.stderr.clone();
    }
    // some toolchains print diagnostics on stdout
    if !outcome.stdout.is_empty() {
        return outcome.stdout.clone();
    }
    if outcome.timed_out {
        return COMPILE_TIMED_OUT_MSG.to_string();
    }
    match outcome.exit_code {
        Some(code) => format!("compilation failed with exit code {}", code),
        None => termination_message(outcome)
            .unwrap_or_else(|| "compilation failed".to_string()),
    }
}

fn synthesized_error(outcome: &ExecutionOutcome) -> Option<String> {
    if outcome.timed_out {
        return Some(TIMED_OUT_MSG.to_string());
    }
    if outcome.memory_exceeded {
        return Some(MEMORY_EXCEEDED_MSG.to_string());
    }
    if outcome.truncated {
        return Some(OUTPUT_EXCEEDED_MSG.to_string());
    }
    if outcome.orphaned {
        return Some(ORPHANED_MSG.to_string());
    }
    termination_message(outcome)
}

fn termination_message(outcome: &ExecutionOutcome) -> Option<String> {
    if let Some(signal) = outcome.signal {
        let name = Signal::try_from(signal)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| signal.to_string());
        return Some(format!("process terminated by signal {}", name));
    }
    match outcome.exit_code {
        Some(0) | None => None,
        Some(code) => Some(format!("process exited with code {}", code)),
    }
}
