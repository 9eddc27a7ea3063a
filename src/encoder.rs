//! Wire encoding for snapshots, timelines and session metadata.
//!
//! Messages are written field by field with `protobuf`'s
//! [`CodedOutputStream`]; nested messages are encoded into their own buffer
//! and embedded as length-delimited fields. Every upload is framed as
//! `gzip(varint(len) ++ message)`.
//!
//! | message          | fields |
//! |------------------|--------|
//! | SnapshotFile     | 1 info, 2 time profiles, 3 memory profiles, 4 dictionary |
//! | ThreadProfile    | 1 thread, 2 value, 3 samples, 4 nodes |
//! | Node             | 1 name index, 2 value, 3 samples, 4 children |
//! | DictionarySlice  | 1 entries, 2 packages |
//! | TimelineFile     | 1 started_at, 2 stopped_at, 3 events, 4 live |
//! | CreateSession    | 1 format, 2 kind, 3 interval_ms, 4 configs, 5 versions, 6 hardware, 7 os, 8 runtime, 9 timeline data, 10 categories |

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use protobuf::CodedOutputStream;

use crate::calltree::{CallTree, CallTreeNode, ThreadForest};
use crate::collector::{CategoryGroup, CollectedData, CollectorData};
use crate::dictionary::{
    ClassRef, DictionaryDelta, DictionaryEntry, MethodDictionary, SymbolKind, TypeRef, TypeValue,
};
use crate::error::EncodeError;
use crate::sample::SampleKind;

/// Version of the session metadata layout understood by the collector.
pub const FORMAT_VERSION: u32 = 3;

type Stream<'a> = CodedOutputStream<'a>;

/// Encode one message into a fresh buffer.
fn message<F>(write: F) -> protobuf::Result<Vec<u8>>
where
    F: FnOnce(&mut Stream<'_>) -> protobuf::Result<()>,
{
    let mut buf = Vec::new();
    {
        let mut os = CodedOutputStream::vec(&mut buf);
        write(&mut os)?;
        os.flush()?;
    }
    Ok(buf)
}

/// Length-prefix `message` and gzip it.
pub fn frame(message: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let mut prefixed = Vec::with_capacity(message.len() + 10);
    {
        let mut os = CodedOutputStream::vec(&mut prefixed);
        os.write_raw_varint64(message.len() as u64)?;
        os.write_raw_bytes(message)?;
        os.flush()?;
    }
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&prefixed)?;
    Ok(gz.finish()?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub samples: u64,
    pub time_ms: u64,
}

/// Serialize one window. Frames are interned into `dictionary` as they are
/// written and the resulting delta is embedded, so the returned payload
/// only references indices that are in this or an earlier snapshot.
pub fn encode_snapshot(
    info: SnapshotInfo,
    time: &ThreadForest,
    memory: &ThreadForest,
    dictionary: &mut MethodDictionary,
) -> Result<Vec<u8>, EncodeError> {
    let time_profiles = thread_profiles(time, dictionary)?;
    let memory_profiles = thread_profiles(memory, dictionary)?;
    let delta = dictionary.export_delta()?;
    let dictionary_slice = encode_delta(&delta)?;

    let info = message(|os| {
        os.write_uint64(1, info.samples)?;
        os.write_uint64(2, info.time_ms)
    })?;
    let body = message(|os| {
        os.write_bytes(1, &info)?;
        for profile in &time_profiles {
            os.write_bytes(2, profile)?;
        }
        for profile in &memory_profiles {
            os.write_bytes(3, profile)?;
        }
        os.write_bytes(4, &dictionary_slice)
    })?;
    frame(&body)
}

fn thread_profiles(
    forest: &ThreadForest,
    dictionary: &mut MethodDictionary,
) -> protobuf::Result<Vec<Vec<u8>>> {
    forest
        .threads()
        .map(|(thread, tree)| thread_profile(thread, tree, dictionary))
        .collect()
}

fn thread_profile(
    thread: &str,
    tree: &CallTree,
    dictionary: &mut MethodDictionary,
) -> protobuf::Result<Vec<u8>> {
    let nodes = tree
        .sorted_roots()
        .into_iter()
        .map(|root| node(root, dictionary))
        .collect::<protobuf::Result<Vec<_>>>()?;
    message(|os| {
        os.write_string(1, thread)?;
        os.write_uint64(2, tree.cumulative_value())?;
        os.write_uint64(3, tree.cumulative_samples())?;
        for node in &nodes {
            os.write_bytes(4, node)?;
        }
        Ok(())
    })
}

fn node(node: &CallTreeNode, dictionary: &mut MethodDictionary) -> protobuf::Result<Vec<u8>> {
    let name = dictionary.intern_frame(node.frame());
    let children = node
        .sorted_children()
        .into_iter()
        .map(|child| self::node(child, dictionary))
        .collect::<protobuf::Result<Vec<_>>>()?;
    message(|os| {
        os.write_uint32(1, name)?;
        os.write_uint64(2, node.cumulative_value())?;
        os.write_uint32(3, node.sample_count())?;
        for child in &children {
            os.write_bytes(4, child)?;
        }
        Ok(())
    })
}

fn encode_delta(delta: &DictionaryDelta) -> protobuf::Result<Vec<u8>> {
    let entries = delta
        .entries
        .iter()
        .map(entry)
        .collect::<protobuf::Result<Vec<_>>>()?;
    message(|os| {
        for entry in &entries {
            os.write_bytes(1, entry)?;
        }
        for package in &delta.packages {
            os.write_string(2, package)?;
        }
        Ok(())
    })
}

fn class_ref(class: &ClassRef) -> protobuf::Result<Vec<u8>> {
    message(|os| {
        os.write_uint32(1, class.package)?;
        os.write_string(2, &class.name)
    })
}

fn type_ref(type_ref: &TypeRef) -> protobuf::Result<Vec<u8>> {
    let class = match &type_ref.value {
        TypeValue::Class(class) => Some(class_ref(class)?),
        TypeValue::Primitive(_) => None,
    };
    message(|os| {
        match (&type_ref.value, &class) {
            (TypeValue::Primitive(name), _) => os.write_string(1, name)?,
            (TypeValue::Class(_), Some(class)) => os.write_bytes(2, class)?,
            (TypeValue::Class(_), None) => {}
        }
        if type_ref.array_depth > 0 {
            os.write_uint32(3, type_ref.array_depth)?;
        }
        Ok(())
    })
}

fn entry(entry: &DictionaryEntry) -> protobuf::Result<Vec<u8>> {
    match entry {
        DictionaryEntry::Managed {
            class,
            method,
            params,
            return_type,
        } => {
            let class = class_ref(class)?;
            let params = params
                .iter()
                .map(type_ref)
                .collect::<protobuf::Result<Vec<_>>>()?;
            let return_type = type_ref(return_type)?;
            let managed = message(|os| {
                os.write_bytes(1, &class)?;
                os.write_string(2, method)?;
                for param in &params {
                    os.write_bytes(3, param)?;
                }
                os.write_bytes(4, &return_type)
            })?;
            message(|os| os.write_bytes(1, &managed))
        }
        DictionaryEntry::Symbol { kind, path } => {
            let kind = match kind {
                SymbolKind::Native => 1,
                SymbolKind::Kernel => 2,
            };
            let other = message(|os| {
                os.write_enum(1, kind)?;
                os.write_string(2, path)
            })?;
            message(|os| os.write_bytes(2, &other))
        }
    }
}

/// Serialize everything the collectors buffered between two instants (ms since the epoch).
pub fn encode_timeline(
    started_at_ms: u64,
    stopped_at_ms: u64,
    data: &CollectedData,
) -> Result<Vec<u8>, EncodeError> {
    let events = data
        .events
        .iter()
        .map(|event| {
            let metadata = event
                .metadata
                .iter()
                .map(|(key, value)| {
                    message(|os| {
                        os.write_string(1, key)?;
                        os.write_string(2, value)
                    })
                })
                .collect::<protobuf::Result<Vec<_>>>()?;
            message(|os| {
                os.write_string(1, &event.data_id)?;
                os.write_uint64(2, event.time_ms)?;
                os.write_uint64(3, event.duration_ms)?;
                for entry in &metadata {
                    os.write_bytes(4, entry)?;
                }
                Ok(())
            })
        })
        .collect::<protobuf::Result<Vec<_>>>()?;
    let live = data
        .live
        .iter()
        .map(|series| {
            message(|os| {
                os.write_string(1, &series.data_id)?;
                for value in &series.values {
                    os.write_double(2, *value)?;
                }
                Ok(())
            })
        })
        .collect::<protobuf::Result<Vec<_>>>()?;

    let body = message(|os| {
        os.write_uint64(1, started_at_ms)?;
        os.write_uint64(2, stopped_at_ms)?;
        for event in &events {
            os.write_bytes(3, event)?;
        }
        for series in &live {
            os.write_bytes(4, series)?;
        }
        Ok(())
    })?;
    frame(&body)
}

/// What the collector is told about a session when it is created.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
    pub kind: SampleKind,
    pub interval: Duration,
    /// Configuration files shipped for reference, by file name.
    pub files: BTreeMap<String, String>,
    pub versions: BTreeMap<String, String>,
    pub hardware: Option<String>,
    pub os: Option<String>,
    pub runtime: Option<String>,
    pub timeline: Vec<CollectorData>,
    pub categories: Vec<CategoryGroup>,
}

fn key_value(key: &str, value: &str) -> protobuf::Result<Vec<u8>> {
    message(|os| {
        os.write_string(1, key)?;
        os.write_string(2, value)
    })
}

pub fn encode_session_metadata(metadata: &SessionMetadata) -> Result<Vec<u8>, EncodeError> {
    let files = metadata
        .files
        .iter()
        .map(|(name, contents)| key_value(name, contents))
        .collect::<protobuf::Result<Vec<_>>>()?;
    let versions = metadata
        .versions
        .iter()
        .map(|(name, version)| key_value(name, version))
        .collect::<protobuf::Result<Vec<_>>>()?;
    let timeline = metadata
        .timeline
        .iter()
        .map(|data| {
            message(|os| {
                os.write_string(1, &data.id)?;
                os.write_string(2, &data.name)?;
                os.write_string(3, &data.description)?;
                if let Some(formatter) = &data.formatter {
                    os.write_string(4, formatter.id())?;
                }
                Ok(())
            })
        })
        .collect::<protobuf::Result<Vec<_>>>()?;
    let categories = metadata
        .categories
        .iter()
        .map(|category| {
            message(|os| {
                os.write_string(1, &category.name)?;
                for data_id in &category.types {
                    os.write_string(2, data_id)?;
                }
                os.write_bool(3, category.default)
            })
        })
        .collect::<protobuf::Result<Vec<_>>>()?;

    let body = message(|os| {
        os.write_uint32(1, FORMAT_VERSION)?;
        os.write_string(2, metadata.kind.as_str())?;
        os.write_uint64(3, metadata.interval.as_millis() as u64)?;
        for file in &files {
            os.write_bytes(4, file)?;
        }
        for version in &versions {
            os.write_bytes(5, version)?;
        }
        if let Some(hardware) = &metadata.hardware {
            os.write_string(6, hardware)?;
        }
        if let Some(os_name) = &metadata.os {
            os.write_string(7, os_name)?;
        }
        if let Some(runtime) = &metadata.runtime {
            os.write_string(8, runtime)?;
        }
        for data in &timeline {
            os.write_bytes(9, data)?;
        }
        for category in &categories {
            os.write_bytes(10, category)?;
        }
        Ok(())
    })?;
    frame(&body)
}
