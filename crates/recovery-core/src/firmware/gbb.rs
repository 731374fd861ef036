use crate::error::{RecoveryError, Result};

/// Parse a GBB flags hex string (`0x39`, `39`, `0X39`) into its value.
pub fn gbb_to_int(hex: &str) -> Result<u64> {
    let lowered = hex.trim().to_lowercase();
    let digits = lowered.strip_prefix("0x").unwrap_or(&lowered);
    if digits.is_empty() {
        return Err(RecoveryError::usage(format!("gbb flags {hex:?}: empty value")));
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(RecoveryError::usage(format!(
            "gbb flags {hex:?}: not a hex value"
        )));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| RecoveryError::usage(format!("gbb flags {hex:?}: {e}")))
}

/// Canonical hex form used when printing GBB flags.
pub fn hex_format(value: u64) -> String {
    format!("0x{value:08x}")
}
