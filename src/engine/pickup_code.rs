use crate::error::OrderError;

pub const PICKUP_CODE_LEN: usize = 6;

/// Keeps digits only and left-pads with zeros to six characters. Longer
/// inputs are left as they are so they never match a six-digit code.
pub fn normalize_code(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    format!("{digits:0>width$}", width = PICKUP_CODE_LEN)
}

/// Checks the code typed by the driver against the order's stored one.
pub fn verify_pickup_code(expected: Option<&str>, entered: &str) -> Result<(), OrderError> {
    let expected = expected
        .filter(|code| code.chars().any(|c| c.is_ascii_digit()))
        .ok_or(OrderError::MissingPickupCode)?;

    if !entered.chars().any(|c| c.is_ascii_digit()) {
        return Err(OrderError::CodeMismatch);
    }

    if normalize_code(entered) == normalize_code(expected) {
        Ok(())
    } else {
        Err(OrderError::CodeMismatch)
    }
}
