//! Guard predicate evaluation.
//!
//! A guard of the form `{var: value}` is true when `var`'s current
//! assignment equals `value` textually. A guard of the form `{var: "N+"}`
//! is true when the numeric tail of the chosen value is >= N, which only
//! makes sense for domains whose values are optimization-level-shaped
//! strings like `-O0`..`-O3`/`-Ofast`.

use crate::error::ScoutError;
use crate::model::{Assignment, Guard, Value};

/// `-Ofast` is treated as tail `4` for `"N+"` guard purposes, i.e. it sorts
/// above `-O3`.
const OFAST_TAIL: u32 = 4;

/// Extracts the numeric tail of a domain value for `"N+"` guard purposes.
/// Returns an error if the value has no digit tail and isn't `-Ofast`-shaped.
pub fn numeric_suffix(value: &str) -> Result<u32, ScoutError> {
    if value.ends_with("fast") {
        return Ok(OFAST_TAIL);
    }
    let digits: String = value.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(ScoutError::Config(format!(
            "non-numeric, non-fast suffix used in a guarded domain: '{}'",
            value
        )));
    }
    let reversed: String = digits.chars().rev().collect();
    reversed
        .parse()
        .map_err(|_| ScoutError::Config(format!("could not parse numeric suffix of '{}'", value)))
}

/// Parses a guard's `"N+"` threshold string (e.g. `"3+"` -> `3`).
pub fn parse_threshold(raw: &str) -> Result<u32, ScoutError> {
    let trimmed = raw
        .strip_suffix('+')
        .ok_or_else(|| ScoutError::Config(format!("guard threshold '{}' must end in '+'", raw)))?;
    trimmed
        .parse()
        .map_err(|_| ScoutError::Config(format!("guard threshold '{}' is not numeric", raw)))
}

/// Evaluates a guard against the assignment built so far. The referenced
/// variable must already be assigned (guards may only reference variables
/// that lexically precede them — enforced by the Space Compiler's
/// topological ordering), otherwise this is a false.
pub fn evaluate(guard: &Guard, assignment: &Assignment) -> Result<bool, ScoutError> {
    match guard {
        Guard::Equals { var, value } => {
            Ok(assignment.active_value(var) == Some(value))
        }
        Guard::AtLeast { var, threshold } => match assignment.active_value(var) {
            Some(Value::Str(s)) => Ok(numeric_suffix(s)? >= *threshold),
            _ => Ok(false),
        },
    }
}
