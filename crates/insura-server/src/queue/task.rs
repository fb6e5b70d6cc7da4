//! Typed queue payloads.
//!
//! Entries are flat string maps. Every task carries a [`KIND_FIELD`] tag so a
//! consumer never mistakes one task type for another; ids travel as decimal
//! strings.

use super::KIND_FIELD;
use super::broker::Fields;

/// Payload could not be decoded. Never retried; the entry is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("expected task kind {expected}, found {found:?}")]
    KindMismatch {
        expected: &'static str,
        found: Option<String>,
    },

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("field {field} is not a valid id: {value:?}")]
    InvalidId { field: &'static str, value: String },
}

/// A task that can travel through a stream.
pub trait StreamTask: Sized + Send + Sync + 'static {
    const KIND: &'static str;

    /// Task fields, without the kind tag.
    fn to_fields(&self) -> Fields;

    /// Decode from fields whose kind tag has already been checked.
    fn from_fields(fields: &Fields) -> Result<Self, PayloadError>;

    fn encode(&self) -> Fields {
        let mut fields = self.to_fields();
        fields.insert(KIND_FIELD.to_string(), Self::KIND.to_string());
        fields
    }

    fn decode(fields: &Fields) -> Result<Self, PayloadError> {
        match fields.get(KIND_FIELD) {
            Some(kind) if kind == Self::KIND => Self::from_fields(fields),
            found => Err(PayloadError::KindMismatch {
                expected: Self::KIND,
                found: found.cloned(),
            }),
        }
    }
}

/// Read a positive decimal id.
pub fn id_field(fields: &Fields, field: &'static str) -> Result<i64, PayloadError> {
    let value = fields.get(field).ok_or(PayloadError::MissingField(field))?;
    match value.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(PayloadError::InvalidId {
            field,
            value: value.clone(),
        }),
    }
}

/// Issue a policy for a paid order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnderwritingTask {
    pub order_id: i64,
    pub user_id: i64,
    pub product_id: i64,
}

impl StreamTask for UnderwritingTask {
    const KIND: &'static str = "underwriting";

    fn to_fields(&self) -> Fields {
        Fields::from([
            ("order_id".to_string(), self.order_id.to_string()),
            ("user_id".to_string(), self.user_id.to_string()),
            ("product_id".to_string(), self.product_id.to_string()),
        ])
    }

    fn from_fields(fields: &Fields) -> Result<Self, PayloadError> {
        Ok(Self {
            order_id: id_field(fields, "order_id")?,
            user_id: id_field(fields, "user_id")?,
            product_id: id_field(fields, "product_id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underwriting_task_fields() {
        let task = UnderwritingTask {
            order_id: 42,
            user_id: 7,
            product_id: 3,
        };
        let fields = task.encode();
        assert_eq!(fields.get("order_id").map(String::as_str), Some("42"));
        assert_eq!(fields.get(KIND_FIELD).map(String::as_str), Some("underwriting"));
        assert_eq!(UnderwritingTask::decode(&fields), Ok(task));
    }

    #[test]
    fn test_rejects_untagged_and_bad_ids() {
        let mut fields = UnderwritingTask {
            order_id: 42,
            user_id: 7,
            product_id: 3,
        }
        .to_fields();
        assert!(matches!(
            UnderwritingTask::decode(&fields),
            Err(PayloadError::KindMismatch { found: None, .. })
        ));

        fields.insert(KIND_FIELD.to_string(), "underwriting".to_string());
        fields.insert("user_id".to_string(), "seven".to_string());
        assert_eq!(
            UnderwritingTask::decode(&fields),
            Err(PayloadError::InvalidId {
                field: "user_id",
                value: "seven".to_string()
            })
        );

        fields.remove("product_id");
        fields.insert("user_id".to_string(), "7".to_string());
        assert_eq!(
            UnderwritingTask::decode(&fields),
            Err(PayloadError::MissingField("product_id"))
        );
    }
}
