use super::{PrimitiveKind, TypeHandle, TypeInfo, ValueTypeDescriptor};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallConv {
    Default,
    VarArg,
    C,
    StdCall,
    ThisCall,
    FastCall,
}

/// Element of a method signature as far as argument passing is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigType {
    Primitive(PrimitiveKind),
    Struct(TypeHandle),
}

impl SigType {
    pub const VOID: Self = Self::Primitive(PrimitiveKind::Void);

    pub fn descriptor(self, type_info: impl FnOnce(TypeHandle) -> std::sync::Arc<TypeInfo>) -> ValueTypeDescriptor {
        match self {
            Self::Primitive(p) => ValueTypeDescriptor::Primitive(p),
            Self::Struct(h) => ValueTypeDescriptor::of_type(h, &type_info(h)),
        }
    }

    pub fn is_void(self) -> bool {
        self == Self::VOID
    }
}

impl Display for SigType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primitive(p) => write!(f, "{}", p),
            Self::Struct(h) => write!(f, "valuetype#{}", h.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub call_conv: CallConv,
    pub has_this: bool,
    /// `ByRef` when the receiver is a value type, `Object` otherwise.
    pub this_kind: PrimitiveKind,
    pub params: Vec<SigType>,
    /// For vararg call sites, how many of `params` are declared (the rest follow the sentinel).
    pub fixed_params: Option<usize>,
    pub ret: SigType,
    /// Whether a hidden instantiation argument is passed.
    pub generic_context: bool,
}

impl MethodSignature {
    pub fn static_method(params: Vec<SigType>, ret: SigType) -> Self {
        Self {
            call_conv: CallConv::Default,
            has_this: false,
            this_kind: PrimitiveKind::Object,
            params,
            fixed_params: None,
            ret,
            generic_context: false,
        }
    }

    pub fn instance_method(params: Vec<SigType>, ret: SigType) -> Self {
        Self {
            has_this: true,
            ..Self::static_method(params, ret)
        }
    }

    pub fn with_value_type_receiver(mut self) -> Self {
        self.this_kind = PrimitiveKind::ByRef;
        self
    }

    pub fn with_generic_context(mut self) -> Self {
        self.generic_context = true;
        self
    }

    pub fn with_call_conv(mut self, call_conv: CallConv) -> Self {
        self.call_conv = call_conv;
        self
    }

    pub fn is_vararg(&self) -> bool {
        self.call_conv == CallConv::VarArg
    }

    /// Number of IL-visible arguments, receiver included.
    pub fn il_arg_count(&self) -> usize {
        self.params.len() + self.has_this as usize
    }
}

impl Display for MethodSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.has_this {
            write!(f, "instance ")?;
        }
        if self.is_vararg() {
            write!(f, "vararg ")?;
        }
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, "->{}", self.ret)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureParseError {
    #[error("signature is missing '->'")]
    MissingArrow,
    #[error("unknown type name '{0}'")]
    UnknownType(String),
}

/// Parses the compact textual form used by the command line, e.g. `i4,i8->i8`.
impl FromStr for MethodSignature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (params, ret) = s.split_once("->").ok_or(SignatureParseError::MissingArrow)?;
        let parse = |name: &str| {
            PrimitiveKind::from_short_name(name.trim())
                .map(SigType::Primitive)
                .ok_or_else(|| SignatureParseError::UnknownType(name.trim().to_string()))
        };
        let params = params
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::static_method(params, parse(ret)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_compact_signature() {
        let sig: MethodSignature = "i4, i8 -> i8".parse().unwrap();
        assert_eq!(
            sig.params,
            vec![
                SigType::Primitive(PrimitiveKind::I4),
                SigType::Primitive(PrimitiveKind::I8)
            ]
        );
        assert_eq!(sig.ret, SigType::Primitive(PrimitiveKind::I8));
        assert_eq!(sig.to_string(), "i4,i8->i8");
        assert_eq!("->void".parse::<MethodSignature>().unwrap().params.len(), 0);
        assert!(matches!(
            "i4->foo".parse::<MethodSignature>(),
            Err(SignatureParseError::UnknownType(_))
        ));
    }
}
