//! Value types and constants.

use serde::{Deserialize, Serialize};

/// Type of a global, constant-pool entry or constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ptr,
    Array { elem: Box<Type>, len: u64 },
    Struct { fields: Vec<Type> },
}

impl Type {
    pub fn array(elem: Type, len: u64) -> Self {
        Type::Array {
            elem: Box::new(elem),
            len,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Type::I1 | Type::I8 | Type::I16 | Type::I32 | Type::I64
        )
    }
}

/// A constant value whose bit pattern can be written into memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    /// Integer of type `ty`; truncated to the type's width when stored.
    Int { ty: Type, value: i64 },
    F32(f32),
    F64(f64),
    /// Null pointer.
    Null,
    /// All-zero value of the given type.
    Zero(Type),
    Array { elem: Type, elems: Vec<Constant> },
    Struct(Vec<Constant>),
    /// Raw bytes, typed as `[i8 x len]`.
    Bytes(Vec<u8>),
}

impl Constant {
    pub fn int(ty: Type, value: i64) -> Self {
        Constant::Int { ty, value }
    }

    pub fn i32(value: i32) -> Self {
        Constant::int(Type::I32, value as i64)
    }

    pub fn i64(value: i64) -> Self {
        Constant::int(Type::I64, value)
    }

    pub fn ty(&self) -> Type {
        match self {
            Constant::Int { ty, .. } => ty.clone(),
            Constant::F32(_) => Type::F32,
            Constant::F64(_) => Type::F64,
            Constant::Null => Type::Ptr,
            Constant::Zero(ty) => ty.clone(),
            Constant::Array { elem, elems } => Type::array(elem.clone(), elems.len() as u64),
            Constant::Struct(fields) => Type::Struct {
                fields: fields.iter().map(Constant::ty).collect(),
            },
            Constant::Bytes(bytes) => Type::array(Type::I8, bytes.len() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_types() {
        assert_eq!(Constant::i32(7).ty(), Type::I32);
        assert_eq!(Constant::Null.ty(), Type::Ptr);
        assert_eq!(Constant::Bytes(vec![1, 2, 3]).ty(), Type::array(Type::I8, 3));
        assert_eq!(
            Constant::Struct(vec![Constant::i64(1), Constant::F32(0.5)]).ty(),
            Type::Struct {
                fields: vec![Type::I64, Type::F32]
            }
        );
    }

    #[test]
    fn test_type_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            ty: Type,
            value: Constant,
        }

        let holder: Holder = toml::from_str(
            r#"
ty = { array = { elem = "i16", len = 4 } }
value = { int = { ty = "i8", value = -1 } }
"#,
        )
        .unwrap();
        assert_eq!(holder.ty, Type::array(Type::I16, 4));
        assert_eq!(holder.value, Constant::int(Type::I8, -1));
    }
}
