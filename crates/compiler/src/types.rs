//! Semantic types and runtime error codes.
//!
//! Flap's only runtime shape is the universal map (a count word followed by
//! key/value pairs of doubles), but the compiler tracks a semantic type per
//! expression so that scalar arithmetic stays in floating-point registers
//! and never reifies a one-entry map. These types exist at compile time
//! only.

/// Compile-time semantic type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    #[default]
    Unknown,
    Number,
    String,
    List,
    Map,
    /// A raw code or data address (lambda value, rodata pointer)
    Address,
    Lambda,
    /// Either a success value or an encoded 4-character error code
    Result,
    // C FFI types, only produced by casts and manifest signatures
    CInt8,
    CUInt8,
    CInt16,
    CUInt16,
    CInt32,
    CUInt32,
    CInt64,
    CUInt64,
    CFloat32,
    CFloat64,
    CString,
    CPointer,
}

impl ValueType {
    /// Contextual type keywords as they appear in `as` casts and FFI
    /// manifests. These are not reserved words; an identifier `int32` only
    /// means a type where a type is expected.
    pub fn from_name(name: &str) -> Option<ValueType> {
        Some(match name {
            "number" => ValueType::Number,
            "string" => ValueType::String,
            "list" => ValueType::List,
            "map" => ValueType::Map,
            "int8" => ValueType::CInt8,
            "uint8" => ValueType::CUInt8,
            "int16" => ValueType::CInt16,
            "uint16" => ValueType::CUInt16,
            "int32" | "int" => ValueType::CInt32,
            "uint32" | "uint" => ValueType::CUInt32,
            "int64" => ValueType::CInt64,
            "uint64" => ValueType::CUInt64,
            "float32" => ValueType::CFloat32,
            "float64" | "double" => ValueType::CFloat64,
            "cstring" => ValueType::CString,
            "pointer" | "ptr" => ValueType::CPointer,
            "void" => ValueType::Unknown,
            _ => return None,
        })
    }

    /// True for the C FFI family.
    pub fn is_c(self) -> bool {
        matches!(
            self,
            ValueType::CInt8
                | ValueType::CUInt8
                | ValueType::CInt16
                | ValueType::CUInt16
                | ValueType::CInt32
                | ValueType::CUInt32
                | ValueType::CInt64
                | ValueType::CUInt64
                | ValueType::CFloat32
                | ValueType::CFloat64
                | ValueType::CString
                | ValueType::CPointer
        )
    }

    /// C integer types that marshal through a general-purpose register.
    pub fn is_c_int(self) -> bool {
        matches!(
            self,
            ValueType::CInt8
                | ValueType::CUInt8
                | ValueType::CInt16
                | ValueType::CUInt16
                | ValueType::CInt32
                | ValueType::CUInt32
                | ValueType::CInt64
                | ValueType::CUInt64
        )
    }

    /// Types that reify as a pointer to the universal map layout.
    pub fn is_heap(self) -> bool {
        matches!(
            self,
            ValueType::String | ValueType::List | ValueType::Map | ValueType::Lambda
        )
    }
}

// ---------------------------------------------------------------------------
// Runtime error codes
// ---------------------------------------------------------------------------

/// A 4-character runtime error code carried inside a Result value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub [u8; 4]);

pub const ERR_DIV0: ErrorCode = ErrorCode(*b"dv0 ");
pub const ERR_INDEX: ErrorCode = ErrorCode(*b"idx ");
pub const ERR_KEY: ErrorCode = ErrorCode(*b"key ");
pub const ERR_TYPE: ErrorCode = ErrorCode(*b"typ ");
pub const ERR_NIL: ErrorCode = ErrorCode(*b"nil ");
pub const ERR_MEM: ErrorCode = ErrorCode(*b"mem ");
pub const ERR_ARG: ErrorCode = ErrorCode(*b"arg ");
pub const ERR_IO: ErrorCode = ErrorCode(*b"io  ");
pub const ERR_NET: ErrorCode = ErrorCode(*b"net ");
pub const ERR_PARSE: ErrorCode = ErrorCode(*b"prs ");

/// Quiet-NaN high word marking an error Result. The low word holds the
/// 4-character code, which is never zero, so canonical NaNs produced by
/// ordinary float arithmetic (payload 0) are not mistaken for errors.
pub const ERROR_NAN_HIGH: u32 = 0x7ff8_0000;

impl ErrorCode {
    /// Bit pattern of the double encoding this error.
    pub fn to_bits(self) -> u64 {
        ((ERROR_NAN_HIGH as u64) << 32) | u32::from_le_bytes(self.0) as u64
    }

    /// Decode an error from a double's bit pattern, if it is one.
    pub fn from_bits(bits: u64) -> Option<ErrorCode> {
        if is_error_bits(bits) {
            Some(ErrorCode(((bits & 0xffff_ffff) as u32).to_le_bytes()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        // Codes are fixed ASCII constants
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

/// True when a double's bits encode an error Result.
pub fn is_error_bits(bits: u64) -> bool {
    (bits >> 32) as u32 == ERROR_NAN_HIGH && (bits & 0xffff_ffff) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [ERR_DIV0, ERR_INDEX, ERR_KEY, ERR_TYPE, ERR_NIL, ERR_MEM, ERR_ARG, ERR_IO, ERR_NET, ERR_PARSE] {
            let bits = code.to_bits();
            assert!(is_error_bits(bits));
            assert_eq!(ErrorCode::from_bits(bits), Some(code));
            // The encoding is a NaN when viewed as a double
            assert!(f64::from_bits(bits).is_nan());
        }
    }

    #[test]
    fn test_canonical_nan_is_not_an_error() {
        let canonical = f64::NAN.to_bits();
        assert!(ErrorCode::from_bits(canonical).is_none() || (canonical & 0xffff_ffff) != 0);
        assert!(!is_error_bits(0x7ff8_0000_0000_0000));
    }

    #[test]
    fn test_pointers_are_not_errors() {
        // Heap addresses stay far below the NaN range
        assert!(!is_error_bits(0x0000_7f3a_1234_5678));
        assert!(!is_error_bits(0x0000_0000_0040_1000));
    }

    #[test]
    fn test_code_strings() {
        assert_eq!(ERR_DIV0.as_str(), "dv0 ");
        assert_eq!(ERR_IO.as_str(), "io  ");
    }

    #[test]
    fn test_type_names() {
        assert_eq!(ValueType::from_name("int32"), Some(ValueType::CInt32));
        assert_eq!(ValueType::from_name("cstring"), Some(ValueType::CString));
        assert_eq!(ValueType::from_name("flapjack"), None);
        assert!(ValueType::CUInt64.is_c_int());
        assert!(!ValueType::CFloat64.is_c_int());
        assert!(ValueType::CFloat64.is_c());
        assert!(ValueType::List.is_heap());
        assert!(!ValueType::Number.is_heap());
    }
}
