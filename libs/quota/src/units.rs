//! Conversion between user-facing quantity strings and internal units.
//!
//! Memory follows docker's notation (`512m`, `1g`, `1.5g`, bare numbers are
//! bytes) and is stored in whole MB; amounts that are not a whole number of
//! MB are rejected rather than rounded. CPU is given in cores (`0.5`, `2`) and stored
//! in millicores. In both directions `-1` and the empty string mean auto.

use crate::{Configured, QuotaError};

const KIB: u128 = 1024;
const MIB: u128 = 1024 * KIB;

/// Parses a docker-style memory string into MB.
pub fn parse_memory(input: &str) -> Result<Configured, QuotaError> {
    let trimmed = input.trim();
    if let Some(auto) = parse_auto(trimmed)? {
        return Ok(auto);
    }

    let lower = trimmed.to_ascii_lowercase();
    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (number, suffix) = lower.split_at(split);

    let multiplier: u128 = match suffix {
        "" | "b" => 1,
        "k" | "kb" => KIB,
        "m" | "mb" => MIB,
        "g" | "gb" => MIB * 1024,
        "t" | "tb" => MIB * 1024 * 1024,
        _ => return Err(QuotaError::quantity(input, "unknown memory unit")),
    };

    let (whole, frac) = parse_decimal(input, number)?;
    let frac_bytes = match frac {
        Some((digits, scale)) => digits * multiplier / scale,
        None => 0,
    };
    let bytes = whole
        .checked_mul(multiplier)
        .and_then(|b| b.checked_add(frac_bytes))
        .ok_or_else(|| QuotaError::quantity(input, "value too large"))?;

    if bytes % MIB != 0 {
        return Err(QuotaError::quantity(input, "memory must be a whole number of MB"));
    }
    let mb = bytes / MIB;
    let mb = u64::try_from(mb).map_err(|_| QuotaError::quantity(input, "value too large"))?;
    Ok(Configured::Fixed(mb))
}

/// Renders MB the way [`parse_memory`] reads it back.
pub fn format_memory(value: Configured) -> String {
    match value {
        Configured::Auto => "-1".to_string(),
        Configured::Fixed(mb) => memory_string(mb),
    }
}

/// `1024` → `"1g"`, `512` → `"512m"`.
pub fn memory_string(mb: u64) -> String {
    if mb > 0 && mb % 1024 == 0 {
        format!("{}g", mb / 1024)
    } else {
        format!("{mb}m")
    }
}

/// Parses a core count (`"0.5"`, `"2"`) into millicores.
pub fn parse_cpus(input: &str) -> Result<Configured, QuotaError> {
    let trimmed = input.trim();
    if let Some(auto) = parse_auto(trimmed)? {
        return Ok(auto);
    }

    let (whole, frac) = parse_decimal(input, trimmed)?;
    let millis_frac = match frac {
        Some((digits, scale)) => {
            let scaled = digits * 1000;
            if scaled % scale != 0 {
                return Err(QuotaError::quantity(input, "CPU precision is limited to millicores"));
            }
            scaled / scale
        }
        None => 0,
    };

    let millis = whole
        .checked_mul(1000)
        .and_then(|m| m.checked_add(millis_frac))
        .and_then(|m| u64::try_from(m).ok())
        .ok_or_else(|| QuotaError::quantity(input, "value too large"))?;
    Ok(Configured::Fixed(millis))
}

/// Renders millicores the way [`parse_cpus`] reads it back.
pub fn format_cpus(value: Configured) -> String {
    match value {
        Configured::Auto => "-1".to_string(),
        Configured::Fixed(millis) => cpus_string(millis),
    }
}

/// `500` → `"0.5"`, `2000` → `"2"`, `1250` → `"1.25"`.
pub fn cpus_string(millis: u64) -> String {
    let whole = millis / 1000;
    let frac = millis % 1000;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:03}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

fn parse_auto(trimmed: &str) -> Result<Option<Configured>, QuotaError> {
    if trimmed.is_empty() || trimmed == "-1" {
        return Ok(Some(Configured::Auto));
    }
    if trimmed.starts_with('-') {
        let raw = trimmed.parse::<i64>().unwrap_or(i64::MIN);
        return Err(QuotaError::NegativeValue(raw));
    }
    Ok(None)
}

/// Splits `"12.345"` into `12` and `Some((345, 1000))`.
fn parse_decimal(input: &str, number: &str) -> Result<(u128, Option<(u128, u128)>), QuotaError> {
    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (number, None),
    };
    if whole.is_empty() && frac.map_or(true, str::is_empty) {
        return Err(QuotaError::quantity(input, "missing number"));
    }
    let whole_value = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<u128>()
            .map_err(|_| QuotaError::quantity(input, "not a number"))?
    };

    let frac = match frac {
        None | Some("") => None,
        Some(digits) => {
            if digits.len() > 18 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(QuotaError::quantity(input, "not a number"));
            }
            let value = digits
                .parse::<u128>()
                .map_err(|_| QuotaError::quantity(input, "not a number"))?;
            Some((value, 10u128.pow(digits.len() as u32)))
        }
    };

    Ok((whole_value, frac))
}
