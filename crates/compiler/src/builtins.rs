//! Builtin functions
//!
//! Builtins are resolved by name before lambdas and FFI functions, and
//! lower to dedicated code: the print family calls emitted runtime helpers,
//! `exit` flushes and terminates, and the atomic family lowers to
//! architecture-atomic instruction sequences.

use crate::types::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Print a value followed by a newline
    Println,
    /// Print a value with no trailing newline
    Print,
    /// Terminate the process with the given status
    Exit,
    // Math; lower to libm calls or sign-bit arithmetic
    Sqrt,
    Floor,
    Ceil,
    Abs,
    /// `atomic_add(list, index, delta)` -> previous value
    AtomicAdd,
    /// `atomic_cas(list, index, expected, new)` -> 1 on success else 0
    AtomicCas,
    /// `atomic_load(list, index)` -> value with acquire ordering
    AtomicLoad,
    /// `atomic_store(list, index, value)` with release ordering
    AtomicStore,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        Some(match name {
            "println" => Builtin::Println,
            "print" => Builtin::Print,
            "exit" => Builtin::Exit,
            "sqrt" => Builtin::Sqrt,
            "floor" => Builtin::Floor,
            "ceil" => Builtin::Ceil,
            "abs" => Builtin::Abs,
            "atomic_add" => Builtin::AtomicAdd,
            "atomic_cas" => Builtin::AtomicCas,
            "atomic_load" => Builtin::AtomicLoad,
            "atomic_store" => Builtin::AtomicStore,
            _ => return None,
        })
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Println
            | Builtin::Print
            | Builtin::Exit
            | Builtin::Sqrt
            | Builtin::Floor
            | Builtin::Ceil
            | Builtin::Abs => 1,
            Builtin::AtomicLoad => 2,
            Builtin::AtomicAdd | Builtin::AtomicStore => 3,
            Builtin::AtomicCas => 4,
        }
    }

    /// Semantic type of the call result.
    pub fn result_type(self) -> ValueType {
        match self {
            Builtin::Println | Builtin::Print | Builtin::Exit | Builtin::AtomicStore => {
                ValueType::Unknown
            }
            Builtin::Sqrt
            | Builtin::Floor
            | Builtin::Ceil
            | Builtin::Abs
            | Builtin::AtomicAdd
            | Builtin::AtomicCas
            | Builtin::AtomicLoad => ValueType::Number,
        }
    }

    /// libm symbol for the math family.
    pub fn libm_symbol(self) -> Option<&'static str> {
        match self {
            Builtin::Sqrt => Some("sqrt"),
            Builtin::Floor => Some("floor"),
            Builtin::Ceil => Some("ceil"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(Builtin::lookup("println"), Some(Builtin::Println));
        assert_eq!(Builtin::lookup("atomic_cas"), Some(Builtin::AtomicCas));
        assert_eq!(Builtin::lookup("nope"), None);
    }

    #[test]
    fn test_arity() {
        assert_eq!(Builtin::Println.arity(), 1);
        assert_eq!(Builtin::Sqrt.arity(), 1);
        assert_eq!(Builtin::AtomicAdd.arity(), 3);
        assert_eq!(Builtin::AtomicCas.arity(), 4);
    }

    #[test]
    fn test_libm_symbols() {
        assert_eq!(Builtin::Sqrt.libm_symbol(), Some("sqrt"));
        assert_eq!(Builtin::Abs.libm_symbol(), None);
        assert_eq!(Builtin::Println.libm_symbol(), None);
    }
}
