//! Line-oriented serial protocol between the bridge and the power-monitoring controller.
//!
//! - Inbound telemetry: `DATA:<power>,<daily>,<total>,<c1>,<c2>,<c3>,<threshold>`
//! - Outbound command: `TOGGLE:<id>:<ON|OFF>`

use thiserror::Error;

use super::{command::ComponentId, telemetry::TelemetryRecord};

/// Prefix of telemetry frames.
pub const TELEMETRY_PREFIX: &'static str = "DATA:";

/// Fields needed by one telemetry frame. Extra fields are ignored.
pub const TELEMETRY_FIELDS: usize = 7;

/// Result of decoding one inbound line.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Telemetry(TelemetryRecord),
    /// The line is not a telemetry frame.
    Ignored,
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("telemetry frame has {count} fields, need at least {min}", min = TELEMETRY_FIELDS)]
    TooFewFields { count: usize },
}

/// Decode one inbound line (without the line terminator).
pub fn decode_telemetry(line: &str) -> Result<Decoded, DecodeError> {
    let body = match line.strip_prefix(TELEMETRY_PREFIX) {
        None => return Ok(Decoded::Ignored),
        Some(body) => body,
    };

    // `split` keeps empty trailing fields: "1,2," gives 3 fields.
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < TELEMETRY_FIELDS {
        return Err(DecodeError::TooFewFields {
            count: fields.len(),
        });
    }

    Ok(Decoded::Telemetry(TelemetryRecord {
        power: parse_float_or_zero(fields[0]),
        daily_energy: parse_float_or_zero(fields[1]),
        total_energy: parse_float_or_zero(fields[2]),
        component1: fields[3] == "ON",
        component2: fields[4] == "ON",
        component3: fields[5] == "ON",
        threshold_level: parse_int_or_zero(fields[6]),
    }))
}

/// Encode a toggle command frame (without the line terminator).
pub fn encode_toggle(id: ComponentId, state: bool) -> String {
    format!(
        "TOGGLE:{}:{}",
        id.get(),
        match state {
            false => "OFF",
            true => "ON",
        }
    )
}

/// Parse the leading decimal number of `field`, giving `0.0` when there is none or it is not
/// finite.
///
/// Leading whitespace is skipped and anything after the number is ignored, so `"230.5W"` gives
/// `230.5`. The decimal separator is always `.`.
pub fn parse_float_or_zero(field: &str) -> f64 {
    match float_prefix(field.trim_start()).parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Parse the leading decimal integer of `field`, giving `0` when there is none or it does not fit
/// in `i32`.
///
/// `"4.5"` gives `4`.
pub fn parse_int_or_zero(field: &str) -> i32 {
    let field = field.trim_start();
    let bytes = field.as_bytes();
    let start = sign_len(bytes);
    let end = start + digits_len(&bytes[start..]);
    match end > start {
        false => 0,
        true => field[..end].parse::<i32>().unwrap_or(0),
    }
}

/// The longest `[+-]digits[.digits][(e|E)[+-]digits]` prefix. Empty if there are no digits.
fn float_prefix(field: &str) -> &str {
    let bytes = field.as_bytes();
    let mut end = sign_len(bytes);
    let int_digits = digits_len(&bytes[end..]);
    end += int_digits;

    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = digits_len(&bytes[end + 1..]);
        if int_digits + frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }
    if int_digits + frac_digits == 0 {
        return "";
    }

    if let Some(b'e' | b'E') = bytes.get(end) {
        let exp_start = end + 1;
        let exp_sign = sign_len(&bytes[exp_start..]);
        let exp_digits = digits_len(&bytes[exp_start + exp_sign..]);
        if exp_digits > 0 {
            end = exp_start + exp_sign + exp_digits;
        }
    }
    &field[..end]
}

fn sign_len(bytes: &[u8]) -> usize {
    match bytes.first() {
        Some(b'+' | b'-') => 1,
        _ => 0,
    }
}

fn digits_len(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}
