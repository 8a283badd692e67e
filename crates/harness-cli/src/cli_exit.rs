//! Typed exit codes: `0` clean, `1` usage error, `2` runtime error, `3`
//! conflict. Grounded on `sdlc-cli::cmd::run::RunExit` — a
//! `std::error::Error` impl carrying its own exit code, downcast out of
//! the `anyhow::Error` chain in `main` rather than calling
//! `std::process::exit` from library code.

use harness_core::HarnessError;
use harness_engine::EngineError;

#[derive(Debug)]
pub enum CliExit {
    Usage(String),
    Runtime(String),
    Conflict(String),
}

impl CliExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliExit::Usage(_) => 1,
            CliExit::Runtime(_) => 2,
            CliExit::Conflict(_) => 3,
        }
    }
}

impl std::fmt::Display for CliExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliExit::Usage(m) | CliExit::Runtime(m) | CliExit::Conflict(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for CliExit {}

impl From<HarnessError> for CliExit {
    fn from(e: HarnessError) -> Self {
        match e.kind() {
            "conflict" => CliExit::Conflict(e.to_string()),
            "invariant_violation" | "not_found" | "unauthorized" => CliExit::Usage(e.to_string()),
            _ => CliExit::Runtime(e.to_string()),
        }
    }
}

impl From<EngineError> for CliExit {
    fn from(e: EngineError) -> Self {
        match e.kind() {
            "conflict" => CliExit::Conflict(e.to_string()),
            "invariant_violation" | "not_found" | "unauthorized" => CliExit::Usage(e.to_string()),
            _ => CliExit::Runtime(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_to_their_numeric_values() {
        assert_eq!(CliExit::Usage("x".into()).exit_code(), 1);
        assert_eq!(CliExit::Runtime("x".into()).exit_code(), 2);
        assert_eq!(CliExit::Conflict("x".into()).exit_code(), 3);
    }

    #[test]
    fn run_already_active_maps_to_conflict() {
        let exit: CliExit = HarnessError::RunAlreadyActive.into();
        assert_eq!(exit.exit_code(), 3);
    }
}
