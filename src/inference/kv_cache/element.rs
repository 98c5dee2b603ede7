//! Element types a KV cache can hold

use crate::error::{Error, Result};
use half::f16;
use numr::dtype::DType;

/// Closed set of cache element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvElement {
    F32,
    F16,
}

impl KvElement {
    /// Map a declared input type onto a cache element, or reject it on
    /// behalf of `cache`.
    pub fn from_dtype(dtype: DType, cache: &'static str) -> Result<Self> {
        match dtype {
            DType::F32 => Ok(KvElement::F32),
            DType::F16 => Ok(KvElement::F16),
            _ => Err(Error::UnsupportedDType { cache, dtype }),
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            KvElement::F32 => DType::F32,
            KvElement::F16 => DType::F16,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            KvElement::F32 => std::mem::size_of::<f32>(),
            KvElement::F16 => std::mem::size_of::<f16>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_dtype() {
        assert_eq!(KvElement::from_dtype(DType::F16, "test").unwrap(), KvElement::F16);
        assert_eq!(KvElement::F32.dtype(), DType::F32);
        assert_eq!(KvElement::F16.size_in_bytes(), 2);
        assert!(matches!(
            KvElement::from_dtype(DType::BF16, "combined"),
            Err(Error::UnsupportedDType { cache: "combined", .. })
        ));
    }
}
