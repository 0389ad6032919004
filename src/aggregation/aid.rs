//! AID values as seen by the trackers

use super::{Error, Result};
use crate::{
    hash::{self, Hash},
    value::{DataType, Value},
};

/// An anonymization ID value, reduced to 64 bits
pub type Aid = u64;

/// How AIDs of a given type are turned into seed material
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct AidDescriptor {
    data_type: DataType,
}

impl AidDescriptor {
    /// The descriptor for an AID column type, if such AIDs are supported
    pub fn from_data_type(data_type: DataType) -> Option<AidDescriptor> {
        match data_type {
            DataType::Integer | DataType::Text => Some(AidDescriptor { data_type }),
            _ => None,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Text AIDs are hashed when made, so the AID is already seed-grade
    pub fn is_hash(&self) -> bool {
        matches!(self.data_type, DataType::Text)
    }

    /// Make an AID out of a value, NULLs have no AID
    pub fn make_aid(&self, value: &Value) -> Result<Option<Aid>> {
        match (self.data_type, value) {
            (_, Value::Null) => Ok(None),
            (DataType::Integer, Value::Integer(i)) => Ok(Some(*i as u64)),
            (DataType::Text, Value::Text(s)) => Ok(Some(hash::hash_string(s))),
            (data_type, value) => Err(Error::invalid_aid(value, data_type)),
        }
    }

    /// The hash folded into seeds for this AID
    pub fn seed_hash(&self, aid: Aid) -> Hash {
        if self.is_hash() {
            aid
        } else {
            hash::hash_u64(aid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors() {
        let integer = AidDescriptor::from_data_type(DataType::Integer).unwrap();
        let text = AidDescriptor::from_data_type(DataType::Text).unwrap();
        assert!(AidDescriptor::from_data_type(DataType::Float).is_none());
        assert!(!integer.is_hash());
        assert!(text.is_hash());
        assert_eq!(integer.make_aid(&Value::integer(7)).unwrap(), Some(7));
        assert_eq!(integer.make_aid(&Value::null()).unwrap(), None);
        assert_eq!(
            text.make_aid(&Value::text("alice")).unwrap(),
            Some(hash::hash_string("alice"))
        );
        assert!(integer.make_aid(&Value::text("alice")).is_err());
        // Raw AIDs are hashed, hashed AIDs are used directly
        assert_eq!(integer.seed_hash(7), hash::hash_u64(7));
        assert_eq!(text.seed_hash(7), 7);
    }
}
