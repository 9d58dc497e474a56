//! Raw event normalization.
//!
//! Each [`EventKind`] has one row in [`KIND_TABLE`]: its contract event name,
//! its routing topic, and the function that turns raw arguments into
//! [`EventFields`]. Adding a kind means adding an enum variant and a row;
//! the exhaustive `match` in [`EventKind::entry`] keeps the two in step.

use serde_json::Value;

use crate::error::StreamError;
use crate::topic;
use crate::types::{sequence_hint, EventFields, EventKind, NormalizedEvent, RawEvent};

/// Decimal digits of 2^256 - 1.
const UINT256_MAX: &str =
    "115792089237316195423570985008687907853269984665640564039457584007913129639935";

/// Static description of one event kind.
pub struct KindEntry {
    pub kind: EventKind,
    /// Routing topic the kind is published on.
    pub topic: &'static str,
    /// Turns the raw `args` object into a typed payload.
    pub normalize: fn(&Value) -> Result<EventFields, String>,
}

/// Kind → topic + normalizer mapping.
pub static KIND_TABLE: [KindEntry; 2] = [
    KindEntry {
        kind: EventKind::Transfer,
        topic: topic::TRANSFER,
        normalize: normalize_transfer,
    },
    KindEntry {
        kind: EventKind::Approval,
        topic: topic::APPROVAL,
        normalize: normalize_approval,
    },
];

impl EventKind {
    /// This kind's row in [`KIND_TABLE`].
    pub fn entry(self) -> &'static KindEntry {
        match self {
            Self::Transfer => &KIND_TABLE[0],
            Self::Approval => &KIND_TABLE[1],
        }
    }

    /// Routing topic for events of this kind.
    pub fn topic(self) -> &'static str {
        self.entry().topic
    }
}

/// Normalize a raw event that was delivered for `kind`.
///
/// Normalization is pure: the same raw event always yields the same
/// `(position, sequence_hint)` pair.
pub fn normalize(kind: EventKind, raw: &RawEvent) -> Result<NormalizedEvent, StreamError> {
    let malformed = |reason: String| StreamError::Malformed {
        kind,
        position: raw.block_number,
        reason,
    };

    if raw.event_name != kind.name() {
        return Err(malformed(format!(
            "event name '{}' does not match listener kind",
            raw.event_name
        )));
    }
    if raw.tx_hash.is_empty() {
        return Err(malformed("missing transaction hash".into()));
    }

    let fields = (kind.entry().normalize)(&raw.args).map_err(malformed)?;

    Ok(NormalizedEvent {
        kind,
        position: raw.block_number,
        sequence_hint: sequence_hint(&raw.tx_hash, raw.log_index),
        fields,
    })
}

fn normalize_transfer(args: &Value) -> Result<EventFields, String> {
    Ok(EventFields::Transfer {
        from: address_arg(args, "from")?,
        to: address_arg(args, "to")?,
        amount: amount_arg(args)?,
    })
}

fn normalize_approval(args: &Value) -> Result<EventFields, String> {
    Ok(EventFields::Approval {
        owner: address_arg(args, "owner")?,
        spender: address_arg(args, "spender")?,
        amount: amount_arg(args)?,
    })
}

fn address_arg(args: &Value, name: &str) -> Result<String, String> {
    let raw = args
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing field '{name}'"))?;
    let hex = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| format!("field '{name}' is not 0x-prefixed"))?;
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("field '{name}' is not a 20-byte address"));
    }
    Ok(format!("0x{hex}"))
}

/// Accepts `value` (contract parameter name) or `amount`, as a decimal string
/// or a JSON integer.
fn amount_arg(args: &Value) -> Result<String, String> {
    let value = args
        .get("value")
        .or_else(|| args.get("amount"))
        .ok_or_else(|| "missing field 'value'".to_string())?;

    let digits = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        other => return Err(format!("amount has unsupported type: {other}")),
    };
    canonical_uint256(&digits).ok_or_else(|| format!("amount '{digits}' is not a uint256"))
}

fn canonical_uint256(digits: &str) -> Option<String> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let trimmed = digits.trim_start_matches('0');
    let canonical = if trimmed.is_empty() { "0" } else { trimmed };
    let fits = canonical.len() < UINT256_MAX.len()
        || (canonical.len() == UINT256_MAX.len() && canonical <= UINT256_MAX);
    fits.then(|| canonical.to_string())
}
