//! Frame identities and the conversion from raw sample-source frames.
//!
//! A [`FrameIdentity`] is the key the call tree merges on and the value the
//! method dictionary interns, so equality and hashing are purely structural.
//! Sample sources report frames as [`RawFrame`]s keyed by a per-recording
//! [`FrameId`]; [`FrameCache`] turns each id into one shared
//! `Arc<FrameIdentity>` so a recording with millions of samples only
//! normalizes every distinct frame once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DictionaryError;

/// Identifier of a frame inside a single recording.
pub type FrameId = u64;

/// Marker that separates a synthetic lambda class from its host class name.
const LAMBDA_MARKER: &str = "$$Lambda$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Managed,
    Native,
    Kernel,
}

impl FrameKind {
    pub fn prefix(self) -> char {
        match self {
            FrameKind::Managed => 'J',
            FrameKind::Native => 'N',
            FrameKind::Kernel => 'K',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameIdentity {
    Managed {
        declaring_type: String,
        member: String,
        signature: String,
    },
    Native {
        symbol: String,
    },
    Kernel {
        symbol: String,
    },
}

impl FrameIdentity {
    pub fn managed(
        declaring_type: impl Into<String>,
        member: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        FrameIdentity::Managed {
            declaring_type: declaring_type.into(),
            member: member.into(),
            signature: signature.into(),
        }
    }

    pub fn native(symbol: impl Into<String>) -> Self {
        FrameIdentity::Native {
            symbol: symbol.into(),
        }
    }

    pub fn kernel(symbol: impl Into<String>) -> Self {
        FrameIdentity::Kernel {
            symbol: symbol.into(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            FrameIdentity::Managed { .. } => FrameKind::Managed,
            FrameIdentity::Native { .. } => FrameKind::Native,
            FrameIdentity::Kernel { .. } => FrameKind::Kernel,
        }
    }
}

impl fmt::Display for FrameIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = self.kind().prefix();
        match self {
            FrameIdentity::Managed {
                declaring_type,
                member,
                signature,
            } => write!(f, "{prefix}{declaring_type}.{member}{signature}"),
            FrameIdentity::Native { symbol } | FrameIdentity::Kernel { symbol } => {
                write!(f, "{prefix}{symbol}")
            }
        }
    }
}

/// A frame exactly as the sample source reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Slash- or dot-separated declaring type. Empty for native and kernel frames.
    #[serde(default)]
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub kernel: bool,
}

impl From<&RawFrame> for FrameIdentity {
    fn from(raw: &RawFrame) -> Self {
        if raw.type_name.is_empty() {
            if raw.kernel {
                FrameIdentity::kernel(raw.name.clone())
            } else {
                FrameIdentity::native(raw.name.clone())
            }
        } else {
            FrameIdentity::managed(
                raw.type_name.replace('/', "."),
                raw.name.clone(),
                raw.signature.clone(),
            )
        }
    }
}

/// Maps the frame ids of one recording to shared identities.
#[derive(Default)]
pub struct FrameCache {
    frames: HashMap<FrameId, Arc<FrameIdentity>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `id`, consulting `lookup` only the first time the id is seen.
    pub fn resolve<F>(&mut self, id: FrameId, lookup: F) -> Option<Arc<FrameIdentity>>
    where
        F: FnOnce(FrameId) -> Option<RawFrame>,
    {
        if let Some(frame) = self.frames.get(&id) {
            return Some(frame.clone());
        }
        let frame = Arc::new(FrameIdentity::from(&lookup(id)?));
        self.frames.insert(id, frame.clone());
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A declaring type split into its package and simple name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub package: String,
    pub name: String,
}

/// Split a dotted type name; a lambda suffix stays attached to the simple name.
pub fn split_type_name(declaring_type: &str) -> QualifiedName {
    let (base, lambda) = match declaring_type.find(LAMBDA_MARKER) {
        Some(at) => declaring_type.split_at(at),
        None => (declaring_type, ""),
    };
    match base.rsplit_once('.') {
        Some((package, name)) => QualifiedName {
            package: package.to_string(),
            name: format!("{name}{lambda}"),
        },
        None => QualifiedName {
            package: String::new(),
            name: format!("{base}{lambda}"),
        },
    }
}

/// One parameter or return type from a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    Primitive { name: &'static str, array_depth: u32 },
    Class { class: QualifiedName, array_depth: u32 },
}

fn primitive_name(code: char) -> Option<&'static str> {
    Some(match code {
        'Z' => "boolean",
        'B' => "byte",
        'C' => "char",
        'S' => "short",
        'I' => "int",
        'J' => "long",
        'F' => "float",
        'D' => "double",
        'V' => "void",
        _ => return None,
    })
}

/// Parsed form of a `(params)return` method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub params: Vec<TypeDescriptor>,
    pub return_type: TypeDescriptor,
}

fn malformed(signature: &str, reason: impl Into<String>) -> DictionaryError {
    DictionaryError::MalformedSignature {
        signature: signature.to_string(),
        reason: reason.into(),
    }
}

/// Read one type starting at the front of `rest`, returning it and the remainder.
fn parse_type<'a>(
    signature: &str,
    rest: &'a str,
) -> Result<(TypeDescriptor, &'a str), DictionaryError> {
    let trimmed = rest.trim_start_matches('[');
    let array_depth = (rest.len() - trimmed.len()) as u32;
    let mut chars = trimmed.chars();
    let code = chars
        .next()
        .ok_or_else(|| malformed(signature, "missing type after array marker"))?;
    if let Some(name) = primitive_name(code) {
        return Ok((TypeDescriptor::Primitive { name, array_depth }, chars.as_str()));
    }
    if code != 'L' {
        return Err(malformed(signature, format!("unknown type code {code:?}")));
    }
    let body = chars.as_str();
    let (path, remainder) = body
        .split_once(';')
        .ok_or_else(|| malformed(signature, "unterminated class type"))?;
    if path.is_empty() {
        return Err(malformed(signature, "empty class type"));
    }
    let class = match path.rsplit_once('/') {
        Some((package, name)) => QualifiedName {
            package: package.replace('/', "."),
            name: name.to_string(),
        },
        None => QualifiedName {
            package: String::new(),
            name: path.to_string(),
        },
    };
    Ok((TypeDescriptor::Class { class, array_depth }, remainder))
}

/// Parse a method descriptor such as `(I[Ljava/lang/String;)V`.
pub fn parse_signature(signature: &str) -> Result<MethodSignature, DictionaryError> {
    let body = signature
        .strip_prefix('(')
        .ok_or_else(|| malformed(signature, "missing '('"))?;
    let (mut params_str, return_str) = body
        .split_once(')')
        .ok_or_else(|| malformed(signature, "missing ')'"))?;

    let mut params = Vec::new();
    while !params_str.is_empty() {
        let (param, rest) = parse_type(signature, params_str)?;
        params.push(param);
        params_str = rest;
    }

    if return_str.is_empty() {
        return Err(malformed(signature, "missing return type"));
    }
    let (return_type, trailing) = parse_type(signature, return_str)?;
    if !trailing.is_empty() {
        return Err(malformed(
            signature,
            format!("trailing data after return type: {trailing:?}"),
        ));
    }
    Ok(MethodSignature {
        params,
        return_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(type_name: &str, name: &str, signature: &str, kernel: bool) -> RawFrame {
        RawFrame {
            type_name: type_name.to_string(),
            name: name.to_string(),
            signature: signature.to_string(),
            kernel,
        }
    }

    #[test]
    fn test_raw_frame_normalization() {
        let managed = FrameIdentity::from(&raw("java/util/HashMap", "get", "(Ljava/lang/Object;)Ljava/lang/Object;", false));
        assert_eq!(
            managed,
            FrameIdentity::managed(
                "java.util.HashMap",
                "get",
                "(Ljava/lang/Object;)Ljava/lang/Object;"
            )
        );
        assert_eq!(
            FrameIdentity::from(&raw("", "__memmove_avx", "", false)),
            FrameIdentity::native("__memmove_avx")
        );
        assert_eq!(
            FrameIdentity::from(&raw("", "do_syscall_64", "", true)),
            FrameIdentity::kernel("do_syscall_64")
        );
    }

    #[test]
    fn test_display_prefixes() {
        assert_eq!(
            FrameIdentity::managed("a.B", "run", "()V").to_string(),
            "Ja.B.run()V"
        );
        assert_eq!(FrameIdentity::kernel("schedule").to_string(), "Kschedule");
        assert_eq!(FrameIdentity::native("malloc").to_string(), "Nmalloc");
    }

    #[test]
    fn test_frame_cache_resolves_each_id_once() {
        let mut cache = FrameCache::new();
        let mut lookups = 0;
        let mut lookup = |id: FrameId| {
            lookups += 1;
            Some(raw("", &format!("sym{id}"), "", false))
        };
        let a = cache.resolve(7, &mut lookup).unwrap();
        let b = cache.resolve(7, &mut lookup).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(lookups, 1);
        assert!(cache.resolve(8, |_| None).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_split_type_name() {
        assert_eq!(
            split_type_name("java.lang.Thread"),
            QualifiedName {
                package: "java.lang".into(),
                name: "Thread".into()
            }
        );
        assert_eq!(
            split_type_name("Main"),
            QualifiedName {
                package: String::new(),
                name: "Main".into()
            }
        );
        // The dotted lambda suffix must not be mistaken for a package boundary.
        assert_eq!(
            split_type_name("org.app.Handler$$Lambda$12/0x0000000800c0b000.0x1"),
            QualifiedName {
                package: "org.app".into(),
                name: "Handler$$Lambda$12/0x0000000800c0b000.0x1".into()
            }
        );
    }

    #[test]
    fn test_parse_signature_positional() {
        let sig = parse_signature("(IJ[[Ljava/lang/String;Z)Ljava/util/List;").unwrap();
        assert_eq!(
            sig.params,
            vec![
                TypeDescriptor::Primitive {
                    name: "int",
                    array_depth: 0
                },
                TypeDescriptor::Primitive {
                    name: "long",
                    array_depth: 0
                },
                TypeDescriptor::Class {
                    class: QualifiedName {
                        package: "java.lang".into(),
                        name: "String".into()
                    },
                    array_depth: 2
                },
                TypeDescriptor::Primitive {
                    name: "boolean",
                    array_depth: 0
                },
            ]
        );
        assert_eq!(
            sig.return_type,
            TypeDescriptor::Class {
                class: QualifiedName {
                    package: "java.util".into(),
                    name: "List".into()
                },
                array_depth: 0
            }
        );
    }

    #[test]
    fn test_parse_signature_no_params_void() {
        let sig = parse_signature("()V").unwrap();
        assert!(sig.params.is_empty());
        assert_eq!(
            sig.return_type,
            TypeDescriptor::Primitive {
                name: "void",
                array_depth: 0
            }
        );
    }

    #[test]
    fn test_parse_signature_rejects_malformed() {
        for bad in ["", "V", "(I", "(I)", "(Q)V", "(Ljava/lang/String)V", "()VV", "([)V", "(L;)V"] {
            let err = parse_signature(bad).unwrap_err();
            let DictionaryError::MalformedSignature { signature, .. } = err;
            assert_eq!(signature, bad);
        }
    }
}
