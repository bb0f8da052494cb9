//! Property-based tests for provisionctl
//!
//! These tests verify:
//! - Exit code classification is total and conservative
//! - Step statuses only move forward
//! - CSV fields survive quoting
//! - Retry delays never shrink between attempts

use proptest::prelude::*;
use strum::IntoEnumIterator;

use provisionctl::exit_codes::{
    self, Category, SUCCESS_EQUIVALENT_CODES, SPAWN_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use provisionctl::retry::RetryPolicy;
use provisionctl::step_state::{is_valid_transition, RunLedger};
use provisionctl::store::csv_escape;
use provisionctl::types::{StepStatus, ToolKind};

fn tool_kind_strategy() -> impl Strategy<Value = ToolKind> {
    prop_oneof![
        Just(ToolKind::PackageManagerTool),
        Just(ToolKind::InstallerPackage),
    ]
}

fn status_strategy() -> impl Strategy<Value = StepStatus> {
    prop_oneof![
        Just(StepStatus::Pending),
        Just(StepStatus::Running),
        Just(StepStatus::Success),
        Just(StepStatus::Failed),
        Just(StepStatus::Skipped),
    ]
}

// =============================================================================
// Exit code classification
// =============================================================================

proptest! {
    /// Non-zero codes are Success only when allow-listed
    #[test]
    fn success_requires_allow_list(code in any::<i32>(), kind in tool_kind_strategy()) {
        let info = exit_codes::classify(code, kind);
        if info.is_success() && code != 0 {
            prop_assert!(SUCCESS_EQUIVALENT_CODES.contains(&(kind, code)));
        }
        prop_assert_eq!(info.code, code);
    }

    /// Codes absent from the table are Unknown, never guessed
    #[test]
    fn unmapped_codes_are_unknown(code in any::<i32>(), kind in tool_kind_strategy()) {
        prop_assume!(code != 0);
        prop_assume!(exit_codes::table(kind).iter().all(|row| row.code != code));
        let info = exit_codes::classify(code, kind);
        prop_assert_eq!(info.category, Category::Unknown);
        prop_assert_eq!(info.description, "Unknown exit code");
    }

    /// Every description carries the numeric code
    #[test]
    fn description_includes_code(code in any::<i32>(), kind in proptest::option::of(tool_kind_strategy())) {
        let text = exit_codes::describe(code, kind);
        prop_assert!(text.contains(&code.to_string()));
    }

    /// Step classification without a table only accepts zero
    #[test]
    fn untabled_steps_only_succeed_on_zero(code in any::<i32>()) {
        let info = exit_codes::classify_step_exit(code, None);
        prop_assert_eq!(info.is_success(), code == 0);
    }
}

#[test]
fn synthetic_codes_are_fatal_for_every_table() {
    for code in [TIMEOUT_EXIT_CODE, SPAWN_FAILURE_EXIT_CODE] {
        for kind in [None, Some(ToolKind::PackageManagerTool), Some(ToolKind::InstallerPackage)] {
            assert_eq!(exit_codes::classify_step_exit(code, kind).category, Category::Fatal);
        }
    }
}

// =============================================================================
// Step status transitions
// =============================================================================

proptest! {
    /// Terminal statuses have no outgoing edges
    #[test]
    fn terminal_statuses_are_final(from in status_strategy(), to in status_strategy()) {
        if from.is_terminal() {
            prop_assert!(!is_valid_transition(from, to));
        }
    }

    /// Any sequence of requested transitions leaves the ledger on a path
    /// through the allowed edges, and a finished step never changes again
    #[test]
    fn ledger_only_moves_forward(requests in proptest::collection::vec(status_strategy(), 0..12)) {
        let mut ledger = RunLedger::new(["Step"]);
        let mut current = StepStatus::Pending;
        for to in requests {
            let accepted = ledger.transition("Step", to).is_ok();
            prop_assert_eq!(accepted, is_valid_transition(current, to));
            if accepted {
                current = to;
            }
            prop_assert_eq!(ledger.status("Step"), Some(current));
        }
    }
}

#[test]
fn status_names_roundtrip() {
    for status in StepStatus::iter() {
        let parsed: StepStatus = status.to_string().parse().expect("Should parse");
        assert_eq!(status, parsed);
    }
}

// =============================================================================
// CSV quoting
// =============================================================================

/// Undo `csv_escape` for a single field
fn csv_unescape(field: &str) -> String {
    match field.strip_prefix('"').and_then(|f| f.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => field.to_string(),
    }
}

proptest! {
    /// Escaped fields decode back to the original text
    #[test]
    fn csv_escape_roundtrip(field in ".*") {
        prop_assert_eq!(csv_unescape(&csv_escape(&field)), field);
    }

    /// An unquoted field never contains a delimiter or line break
    #[test]
    fn csv_escape_quotes_delimiters(field in ".*") {
        let escaped = csv_escape(&field);
        if !escaped.starts_with('"') {
            prop_assert!(!escaped.contains([',', '\n', '\r', '"']));
        }
    }
}

// =============================================================================
// Retry delays
// =============================================================================

proptest! {
    /// Delays never shrink from one attempt to the next
    #[test]
    fn retry_delay_is_monotonic(
        max in 1u32..10,
        delay in 0u64..3600,
        exponential in any::<bool>(),
        attempt in 1u32..100,
    ) {
        let policy = RetryPolicy::new(max, delay, exponential, false).unwrap();
        prop_assert!(policy.delay_for(attempt) <= policy.delay_for(attempt + 1));
        if !exponential {
            prop_assert_eq!(policy.delay_for(attempt).as_secs(), delay);
        }
    }

    /// Zero attempts is rejected, anything else is accepted
    #[test]
    fn retry_policy_requires_an_attempt(max in 0u32..5) {
        prop_assert_eq!(RetryPolicy::new(max, 0, false, false).is_ok(), max > 0);
    }
}
