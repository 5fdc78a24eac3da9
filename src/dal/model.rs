use crate::dal::{Collection, Record};
use crate::error::{QuarryError, Result};
use crate::types::Value;

/// Explicit codec between a Rust type and its stored `Record`.
///
/// The schema returned by [`Model::collection`] is the mapping description
/// (field names, types, defaults, identity); `to_record`/`from_record` are
/// the encode and decode halves.
pub trait Model: Sized {
    fn collection() -> Collection;

    fn id(&self) -> Value;

    fn to_record(&self) -> Record;

    fn from_record(record: &Record) -> Result<Self>;
}

/// Decode helper for `from_record` implementations.
pub fn required<'a>(record: &'a Record, field: &str) -> Result<&'a Value> {
    match record.get(field) {
        Some(v) if !v.is_null() => Ok(v),
        _ => Err(QuarryError::InvalidValue(format!(
            "record {}: missing field {:?}",
            record.id, field
        ))),
    }
}
