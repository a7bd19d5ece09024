//! Exact arithmetic over Kubernetes resource quantity strings
//!
//! Quantities such as `250m`, `1.5Gi` or `12e6` are parsed into a `Decimal`
//! so that sums across containers stay exact. CPU totals are rounded to
//! milli-units; memory totals must come out as whole bytes.

use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::{Error, Result};

pub fn from_quantity(quantity: &Quantity) -> Result<Decimal> {
    parse(&quantity.0)
}

/// Parse a quantity string (binary SI, decimal SI or exponent suffix)
pub fn parse(input: &str) -> Result<Decimal> {
    let invalid = || Error::QuantityError(input.to_string());
    let s = input.trim();

    let (negative, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let number_end = body
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(body.len());
    let (number, suffix) = body.split_at(number_end);
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return Err(invalid());
    }
    let value = Decimal::from_str(number).map_err(|_| invalid())?;

    let factor = match suffix {
        "" => Decimal::ONE,
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        "n" => decimal(-9)?,
        "u" => decimal(-6)?,
        "m" => decimal(-3)?,
        "k" => decimal(3)?,
        "M" => decimal(6)?,
        "G" => decimal(9)?,
        "T" => decimal(12)?,
        "P" => decimal(15)?,
        "E" => decimal(18)?,
        exp if exp.starts_with(['e', 'E']) => {
            let power: i32 = exp[1..].parse().map_err(|_| invalid())?;
            decimal(power).map_err(|_| invalid())?
        }
        _ => return Err(invalid()),
    };

    let amount = value.checked_mul(factor).ok_or_else(invalid)?;
    Ok(if negative { -amount } else { amount })
}

/// Value rounded half away from zero to the nearest thousandth, expressed in
/// thousandths
pub fn to_milli_rounded(value: Decimal) -> i64 {
    let saturated = if value.is_sign_negative() { i64::MIN } else { i64::MAX };
    value
        .checked_mul(Decimal::ONE_THOUSAND)
        .map(|milli| milli.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|milli| milli.to_i64())
        .unwrap_or(saturated)
}

/// The value as an integer, if it is one and fits in an i64
pub fn as_exact_i64(value: Decimal) -> Option<i64> {
    if !value.fract().is_zero() {
        return None;
    }
    value.to_i64()
}

fn binary(shift: u32) -> Decimal {
    Decimal::from(1u64 << shift)
}

fn decimal(power: i32) -> Result<Decimal> {
    Decimal::from_scientific(&format!("1e{}", power))
        .map_err(|e| Error::QuantityError(format!("1e{}: {}", power, e)))
}
