//! Merge operators, keyed by `(UpdatePolicy, ValueType)`.

use super::StoreLimits;
use backfill_primitives::{UpdatePolicy, ValueType};
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use std::str::FromStr;

/// Combines the value stored under a key with an incoming one.
///
/// Returns the value to store, or `None` to keep the stored one.
pub type Operator =
    fn(Option<&[u8]>, &[u8], &StoreLimits) -> Result<Option<Vec<u8>>, OperatorError>;

/// Failure of a single [`Operator`] application.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperatorError {
    /// The policy is only defined for numeric types.
    #[error("policy {policy} does not support value type {value_type}")]
    Unsupported {
        /// Store policy.
        policy: UpdatePolicy,
        /// Store value type.
        value_type: ValueType,
    },
    /// Concatenation exceeds the append limit.
    #[error("appended value is {size} bytes, limit is {limit}")]
    AppendLimit {
        /// Resulting size.
        size: usize,
        /// Limit.
        limit: usize,
    },
    /// A value is not a valid number of the store's type.
    #[error("invalid number {value:?}: {cause}")]
    InvalidNumber {
        /// Lossy rendering of the value.
        value: String,
        /// Parse or arithmetic failure.
        cause: String,
    },
}

/// Returns the operator of a store with the given policy and value type.
pub fn operator_for(policy: UpdatePolicy, value_type: ValueType) -> Result<Operator, OperatorError> {
    use UpdatePolicy as P;
    use ValueType as V;

    let op: Operator = match (policy, value_type) {
        (P::Set, _) => set,
        (P::SetIfNotExists, _) => set_if_not_exists,
        (P::Append, _) => append,

        (P::Add, V::Int64) => add::<i64>,
        (P::Add, V::Float64) => add::<f64>,
        (P::Add, V::BigInt) => add::<BigInt>,
        (P::Add, V::BigDecimal) => add::<BigDecimal>,

        (P::Min, V::Int64) => min::<i64>,
        (P::Min, V::Float64) => min::<f64>,
        (P::Min, V::BigInt) => min::<BigInt>,
        (P::Min, V::BigDecimal) => min::<BigDecimal>,

        (P::Max, V::Int64) => max::<i64>,
        (P::Max, V::Float64) => max::<f64>,
        (P::Max, V::BigInt) => max::<BigInt>,
        (P::Max, V::BigDecimal) => max::<BigDecimal>,

        (P::Add | P::Min | P::Max, V::String | V::Bytes | V::Proto) => {
            return Err(OperatorError::Unsupported { policy, value_type })
        }
    };
    Ok(op)
}

fn set(_: Option<&[u8]>, new: &[u8], _: &StoreLimits) -> Result<Option<Vec<u8>>, OperatorError> {
    Ok(Some(new.to_vec()))
}

fn set_if_not_exists(
    prev: Option<&[u8]>,
    new: &[u8],
    _: &StoreLimits,
) -> Result<Option<Vec<u8>>, OperatorError> {
    Ok(prev.is_none().then(|| new.to_vec()))
}

fn append(
    prev: Option<&[u8]>,
    new: &[u8],
    limits: &StoreLimits,
) -> Result<Option<Vec<u8>>, OperatorError> {
    let prev = prev.unwrap_or_default();
    let size = prev.len() + new.len();
    if size > limits.append_limit {
        return Err(OperatorError::AppendLimit { size, limit: limits.append_limit })
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(prev);
    out.extend_from_slice(new);
    Ok(Some(out))
}

fn add<T: Numeric>(
    prev: Option<&[u8]>,
    new: &[u8],
    _: &StoreLimits,
) -> Result<Option<Vec<u8>>, OperatorError> {
    let new = T::decode(new)?;
    let sum = match prev {
        Some(prev) => T::decode(prev)?.checked_sum(new)?,
        None => new,
    };
    Ok(Some(sum.encode()))
}

fn min<T: Numeric>(
    prev: Option<&[u8]>,
    new: &[u8],
    _: &StoreLimits,
) -> Result<Option<Vec<u8>>, OperatorError> {
    let new = T::decode(new)?;
    match prev {
        Some(prev) if T::decode(prev)? <= new => Ok(None),
        _ => Ok(Some(new.encode())),
    }
}

fn max<T: Numeric>(
    prev: Option<&[u8]>,
    new: &[u8],
    _: &StoreLimits,
) -> Result<Option<Vec<u8>>, OperatorError> {
    let new = T::decode(new)?;
    match prev {
        Some(prev) if T::decode(prev)? >= new => Ok(None),
        _ => Ok(Some(new.encode())),
    }
}

/// Numeric value types, stored as decimal text.
trait Numeric: Sized + PartialOrd {
    fn parse(s: &str) -> Result<Self, String>;

    fn checked_sum(self, other: Self) -> Result<Self, OperatorError>;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self, OperatorError> {
        let invalid = |cause: String| OperatorError::InvalidNumber {
            value: String::from_utf8_lossy(bytes).into_owned(),
            cause,
        };
        let s = std::str::from_utf8(bytes).map_err(|err| invalid(err.to_string()))?;
        Self::parse(s.trim()).map_err(invalid)
    }
}

impl Numeric for i64 {
    fn parse(s: &str) -> Result<Self, String> {
        s.parse().map_err(|err: std::num::ParseIntError| err.to_string())
    }

    fn checked_sum(self, other: Self) -> Result<Self, OperatorError> {
        self.checked_add(other).ok_or_else(|| OperatorError::InvalidNumber {
            value: format!("{self} + {other}"),
            cause: "int64 overflow".to_string(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Numeric for f64 {
    fn parse(s: &str) -> Result<Self, String> {
        s.parse().map_err(|err: std::num::ParseFloatError| err.to_string())
    }

    fn checked_sum(self, other: Self) -> Result<Self, OperatorError> {
        Ok(self + other)
    }

    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Numeric for BigInt {
    fn parse(s: &str) -> Result<Self, String> {
        Self::from_str(s).map_err(|err| err.to_string())
    }

    fn checked_sum(self, other: Self) -> Result<Self, OperatorError> {
        Ok(self + other)
    }

    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Numeric for BigDecimal {
    fn parse(s: &str) -> Result<Self, String> {
        Self::from_str(s).map_err(|err| err.to_string())
    }

    fn checked_sum(self, other: Self) -> Result<Self, OperatorError> {
        Ok(self + other)
    }

    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}
