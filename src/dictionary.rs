//! Append-only interning of frames and package names.
//!
//! Indices are positions in the arena and never change once assigned.
//! [`MethodDictionary::export_delta`] hands out everything appended since the
//! previous export so each snapshot only carries vocabulary the collector has
//! not seen yet.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DictionaryError;
use crate::frame::{parse_signature, split_type_name, FrameIdentity, TypeDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRef {
    pub package: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeValue {
    Primitive(&'static str),
    Class(ClassRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    pub value: TypeValue,
    pub array_depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Native,
    Kernel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictionaryEntry {
    Managed {
        class: ClassRef,
        method: String,
        params: Vec<TypeRef>,
        return_type: TypeRef,
    },
    Symbol {
        kind: SymbolKind,
        path: String,
    },
}

/// Entries appended since the previous export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DictionaryDelta {
    /// Index of `entries[0]`.
    pub first_entry: u32,
    pub entries: Vec<DictionaryEntry>,
    /// Index of `packages[0]`.
    pub first_package: u32,
    pub packages: Vec<String>,
}

impl DictionaryDelta {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.packages.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MethodDictionary {
    frames: Vec<Arc<FrameIdentity>>,
    frame_ids: HashMap<Arc<FrameIdentity>, u32>,
    packages: Vec<String>,
    package_ids: HashMap<String, u32>,
    exported_frames: usize,
    exported_packages: usize,
}

impl MethodDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `frame`, assigning the next free one on first sight. Ids never change.
    pub fn intern_frame(&mut self, frame: &Arc<FrameIdentity>) -> u32 {
        if let Some(&id) = self.frame_ids.get(frame) {
            return id;
        }
        let id = self.frames.len() as u32;
        self.frames.push(frame.clone());
        self.frame_ids.insert(frame.clone(), id);
        id
    }

    /// Same as [`Self::intern_frame`] for package names, in their own id space.
    pub fn intern_package(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.package_ids.get(name) {
            return id;
        }
        let id = self.packages.len() as u32;
        self.packages.push(name.to_string());
        self.package_ids.insert(name.to_string(), id);
        id
    }

    pub fn frame_id(&self, frame: &FrameIdentity) -> Option<u32> {
        self.frame_ids.get(frame).copied()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Export frames and packages added since the last successful export.
    ///
    /// Frame entries are built first because building them can intern new
    /// packages, which then ship in this same delta. On error the cursors
    /// stay where they were.
    pub fn export_delta(&mut self) -> Result<DictionaryDelta, DictionaryError> {
        let pending: Vec<Arc<FrameIdentity>> = self.frames[self.exported_frames..].to_vec();
        let mut entries = Vec::with_capacity(pending.len());
        for frame in &pending {
            entries.push(self.entry_for(frame)?);
        }

        let delta = DictionaryDelta {
            first_entry: self.exported_frames as u32,
            entries,
            first_package: self.exported_packages as u32,
            packages: self.packages[self.exported_packages..].to_vec(),
        };
        self.exported_frames = self.frames.len();
        self.exported_packages = self.packages.len();
        Ok(delta)
    }

    fn entry_for(&mut self, frame: &FrameIdentity) -> Result<DictionaryEntry, DictionaryError> {
        match frame {
            FrameIdentity::Managed {
                declaring_type,
                member,
                signature,
            } => {
                let parsed = parse_signature(signature)?;
                let declaring = split_type_name(declaring_type);
                let class = ClassRef {
                    package: self.intern_package(&declaring.package),
                    name: declaring.name,
                };
                let params = parsed
                    .params
                    .into_iter()
                    .map(|param| self.type_ref(param))
                    .collect();
                let return_type = self.type_ref(parsed.return_type);
                Ok(DictionaryEntry::Managed {
                    class,
                    method: member.clone(),
                    params,
                    return_type,
                })
            }
            FrameIdentity::Native { symbol } => Ok(DictionaryEntry::Symbol {
                kind: SymbolKind::Native,
                path: symbol.clone(),
            }),
            FrameIdentity::Kernel { symbol } => Ok(DictionaryEntry::Symbol {
                kind: SymbolKind::Kernel,
                path: symbol.clone(),
            }),
        }
    }

    fn type_ref(&mut self, descriptor: TypeDescriptor) -> TypeRef {
        match descriptor {
            TypeDescriptor::Primitive { name, array_depth } => TypeRef {
                value: TypeValue::Primitive(name),
                array_depth,
            },
            TypeDescriptor::Class { class, array_depth } => TypeRef {
                value: TypeValue::Class(ClassRef {
                    package: self.intern_package(&class.package),
                    name: class.name,
                }),
                array_depth,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed(class: &str, method: &str, sig: &str) -> Arc<FrameIdentity> {
        Arc::new(FrameIdentity::managed(class, method, sig))
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut dict = MethodDictionary::new();
        let a = managed("app.Main", "run", "()V");
        let same = managed("app.Main", "run", "()V");
        let b = Arc::new(FrameIdentity::native("memcpy"));

        assert_eq!(dict.intern_frame(&a), 0);
        assert_eq!(dict.intern_frame(&b), 1);
        assert_eq!(dict.intern_frame(&same), 0);
        assert_eq!(dict.frame_count(), 2);
        assert_eq!(dict.intern_package("java.lang"), 0);
        assert_eq!(dict.intern_package("java.lang"), 0);
        assert_eq!(dict.frame_id(&FrameIdentity::native("memcpy")), Some(1));
    }

    #[test]
    fn test_second_export_is_empty() {
        let mut dict = MethodDictionary::new();
        dict.intern_frame(&managed("app.Main", "run", "()V"));
        let first = dict.export_delta().unwrap();
        assert_eq!(first.entries.len(), 1);
        assert!(dict.export_delta().unwrap().is_empty());
    }

    #[test]
    fn test_deltas_reconstruct_dictionary() {
        let mut dict = MethodDictionary::new();
        let mut entries = Vec::new();
        let mut packages = Vec::new();
        let batches = [
            vec![
                managed("a.b.C", "one", "()V"),
                Arc::new(FrameIdentity::kernel("schedule")),
            ],
            vec![managed("a.b.C", "one", "()V"), managed("x.Y", "two", "(I)J")],
            vec![],
            vec![managed("a.b.C", "three", "(Lx/Y;)V")],
        ];
        for batch in &batches {
            for frame in batch {
                dict.intern_frame(frame);
            }
            let delta = dict.export_delta().unwrap();
            assert_eq!(delta.first_entry as usize, entries.len());
            assert_eq!(delta.first_package as usize, packages.len());
            entries.extend(delta.entries);
            packages.extend(delta.packages);
        }
        assert_eq!(entries.len(), dict.frame_count());
        assert_eq!(packages, vec!["a.b".to_string(), "x".to_string()]);
    }

    #[test]
    fn test_structured_managed_entry() {
        let mut dict = MethodDictionary::new();
        dict.intern_frame(&managed(
            "org.app.Handler$$Lambda$12/0x0000000800c0b000",
            "accept",
            "(J[Ljava/lang/Object;)[[I",
        ));
        let delta = dict.export_delta().unwrap();
        // The parameter package is interned while the entry is built and
        // still shows up in this delta.
        assert_eq!(delta.packages, vec!["org.app", "java.lang"]);
        assert_eq!(
            delta.entries[0],
            DictionaryEntry::Managed {
                class: ClassRef {
                    package: 0,
                    name: "Handler$$Lambda$12/0x0000000800c0b000".into()
                },
                method: "accept".into(),
                params: vec![
                    TypeRef {
                        value: TypeValue::Primitive("long"),
                        array_depth: 0
                    },
                    TypeRef {
                        value: TypeValue::Class(ClassRef {
                            package: 1,
                            name: "Object".into()
                        }),
                        array_depth: 1
                    },
                ],
                return_type: TypeRef {
                    value: TypeValue::Primitive("int"),
                    array_depth: 2
                },
            }
        );
    }

    #[test]
    fn test_symbol_entries() {
        let mut dict = MethodDictionary::new();
        dict.intern_frame(&Arc::new(FrameIdentity::native("/usr/lib/libc.so.6`memcpy")));
        dict.intern_frame(&Arc::new(FrameIdentity::kernel("do_syscall_64")));
        let delta = dict.export_delta().unwrap();
        assert_eq!(
            delta.entries,
            vec![
                DictionaryEntry::Symbol {
                    kind: SymbolKind::Native,
                    path: "/usr/lib/libc.so.6`memcpy".into()
                },
                DictionaryEntry::Symbol {
                    kind: SymbolKind::Kernel,
                    path: "do_syscall_64".into()
                },
            ]
        );
        assert!(delta.packages.is_empty());
    }

    #[test]
    fn test_malformed_signature_fails_without_advancing() {
        let mut dict = MethodDictionary::new();
        dict.intern_frame(&managed("app.Main", "ok", "()V"));
        dict.intern_frame(&managed("app.Main", "broken", "(Q)V"));
        let err = dict.export_delta().unwrap_err();
        assert!(matches!(
            err,
            DictionaryError::MalformedSignature { ref signature, .. } if signature == "(Q)V"
        ));
        // Nothing was consumed, so a retry reports the same failure.
        assert!(dict.export_delta().is_err());
    }
}
