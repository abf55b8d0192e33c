//! External-data references inside an ONNX graph.
//!
//! Initializers stored outside the graph carry a `location` entry naming
//! their file relative to the graph's directory. The entry is a
//! `StringStringEntryProto { key = 1, value = 2 }`, so on the wire it reads
//! `0x0a 0x08 "location" 0x12 <varint len> <bytes>`.
//!
//! ORT resolves those names itself when the graph is committed, so the
//! weights file handed to `load` must be exactly the one the graph names.

use std::path::{Path, PathBuf};

const LOCATION_ENTRY: &[u8] = b"\x0a\x08location\x12";

#[derive(Debug, thiserror::Error)]
pub enum WeightsMismatch {
    #[error("{graph} stores its weights inline; {weights} would be ignored")]
    Unused { graph: PathBuf, weights: PathBuf },

    #[error("{graph} reads its weights from {referenced}, not {weights}")]
    Elsewhere {
        graph: PathBuf,
        referenced: PathBuf,
        weights: PathBuf,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &b) in bytes.iter().take(10).enumerate() {
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Distinct `location` values in `graph`, in order of first appearance.
pub fn referenced_locations(graph: &[u8]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut rest = graph;
    while let Some(at) = rest
        .windows(LOCATION_ENTRY.len())
        .position(|w| w == LOCATION_ENTRY)
    {
        rest = &rest[at + LOCATION_ENTRY.len()..];
        let Some((len, used)) = read_varint(rest) else {
            continue;
        };
        let Some(value) = usize::try_from(len)
            .ok()
            .and_then(|len| rest.get(used..used.checked_add(len)?))
        else {
            continue;
        };
        if let Ok(name) = std::str::from_utf8(value) {
            if !name.is_empty() && !found.iter().any(|f| f == name) {
                found.push(name.to_owned());
            }
        }
    }
    found
}

fn canonical(path: &Path) -> Result<PathBuf, WeightsMismatch> {
    path.canonicalize().map_err(|source| WeightsMismatch::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Check that loading `graph` reads its weights from `weights`.
///
/// A self-contained graph passes only when both paths name the same file.
pub fn check_weights_file(graph: &Path, weights: &Path) -> Result<(), WeightsMismatch> {
    let bytes = std::fs::read(graph).map_err(|source| WeightsMismatch::Io {
        path: graph.to_path_buf(),
        source,
    })?;
    let locations = referenced_locations(&bytes);
    let weights_canonical = canonical(weights)?;

    if locations.is_empty() {
        return if canonical(graph)? == weights_canonical {
            Ok(())
        } else {
            Err(WeightsMismatch::Unused {
                graph: graph.to_path_buf(),
                weights: weights.to_path_buf(),
            })
        };
    }

    let base = graph.parent().unwrap_or_else(|| Path::new(""));
    for location in locations {
        let referenced = base.join(&location);
        let same = referenced
            .canonicalize()
            .is_ok_and(|p| p == weights_canonical);
        if !same {
            return Err(WeightsMismatch::Elsewhere {
                graph: graph.to_path_buf(),
                referenced,
                weights: weights.to_path_buf(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location_entry(name: &str) -> Vec<u8> {
        let mut out = LOCATION_ENTRY.to_vec();
        out.push(u8::try_from(name.len()).expect("short name"));
        out.extend_from_slice(name.as_bytes());
        out
    }

    fn graph_bytes(locations: &[&str]) -> Vec<u8> {
        let mut out = b"\x08\x07\x12\x07pytorch".to_vec();
        for loc in locations {
            out.extend_from_slice(b"\x0a\x06weight");
            out.extend(location_entry(loc));
            out.extend_from_slice(b"\x1a\x0e\x0a\x06offset\x12\x040");
        }
        out
    }

    #[test]
    fn finds_each_location_once() {
        let bytes = graph_bytes(&["net.onnx.data", "net.onnx.data", "extra.bin"]);
        assert_eq!(
            referenced_locations(&bytes),
            vec!["net.onnx.data".to_string(), "extra.bin".to_string()]
        );
    }

    #[test]
    fn truncated_entry_is_skipped() {
        let mut bytes = LOCATION_ENTRY.to_vec();
        bytes.push(40);
        bytes.extend_from_slice(b"short");
        assert!(referenced_locations(&bytes).is_empty());
        assert!(referenced_locations(b"no external data here").is_empty());
    }

    #[test]
    fn multi_byte_length_is_decoded() {
        let name = "w".repeat(200);
        let mut bytes = LOCATION_ENTRY.to_vec();
        bytes.extend_from_slice(&[0xc8, 0x01]);
        bytes.extend_from_slice(name.as_bytes());
        assert_eq!(referenced_locations(&bytes), vec![name]);
    }

    #[test]
    fn matching_pair_passes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let graph = dir.path().join("net.onnx");
        let weights = dir.path().join("net.onnx.data");
        std::fs::write(&graph, graph_bytes(&["net.onnx.data"])).expect("write");
        std::fs::write(&weights, [0u8; 16]).expect("write");
        check_weights_file(&graph, &weights).expect("pair matches");
    }

    #[test]
    fn mismatched_weights_name_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let graph = dir.path().join("net.onnx");
        let referenced = dir.path().join("net.onnx.data");
        let weights = dir.path().join("finetuned.bin");
        std::fs::write(&graph, graph_bytes(&["net.onnx.data"])).expect("write");
        std::fs::write(&referenced, [0u8; 16]).expect("write");
        std::fs::write(&weights, [1u8; 16]).expect("write");
        let err = check_weights_file(&graph, &weights).expect_err("other file");
        assert!(matches!(err, WeightsMismatch::Elsewhere { .. }));
    }

    #[test]
    fn same_name_in_another_directory_is_rejected() {
        let graph_dir = tempfile::tempdir().expect("tempdir");
        let weights_dir = tempfile::tempdir().expect("tempdir");
        let graph = graph_dir.path().join("net.onnx");
        let weights = weights_dir.path().join("net.onnx.data");
        std::fs::write(&graph, graph_bytes(&["net.onnx.data"])).expect("write");
        std::fs::write(&weights, [0u8; 16]).expect("write");
        let err = check_weights_file(&graph, &weights).expect_err("not beside graph");
        assert!(matches!(err, WeightsMismatch::Elsewhere { .. }));
    }

    #[test]
    fn inline_graph_needs_the_same_path_twice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let graph = dir.path().join("net.onnx");
        let weights = dir.path().join("net.onnx.data");
        std::fs::write(&graph, graph_bytes(&[])).expect("write");
        std::fs::write(&weights, [0u8; 16]).expect("write");
        check_weights_file(&graph, &graph).expect("self-contained");
        let err = check_weights_file(&graph, &weights).expect_err("weights unused");
        assert!(matches!(err, WeightsMismatch::Unused { .. }));
    }
}
