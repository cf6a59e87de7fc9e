//! Node and value persistence
//!
//! Nodes are kept in a text file, one `<hex id> <ip:port>` per line. Values
//! are kept in a directory with one file per key, named by the key's hex and
//! holding the storage export blob for that key.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use ringdht_crypto::identity::write_atomic;
use ringdht_crypto::InfoHash;
use tracing::{debug, info, warn};

use crate::error::DhtResult;
use crate::node::NodeExport;

/// Write `nodes` to `path`, replacing it atomically
pub fn save_nodes(path: &Path, nodes: &[NodeExport]) -> DhtResult<()> {
    let mut out = String::new();
    for node in nodes {
        out.push_str(&format!("{} {}\n", node.id.to_hex(), node.addr));
    }
    write_atomic(path, out.as_bytes())?;
    info!("Saved {} nodes to {}", nodes.len(), path.display());
    Ok(())
}

/// Read nodes written by [`save_nodes`]; a missing file yields no nodes
pub fn load_nodes(path: &Path) -> DhtResult<Vec<NodeExport>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No node file at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut nodes = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_node_line(line) {
            Some(node) => nodes.push(node),
            None => warn!("{}:{}: skipping malformed node line", path.display(), number + 1),
        }
    }
    debug!("Loaded {} nodes from {}", nodes.len(), path.display());
    Ok(nodes)
}

fn parse_node_line(line: &str) -> Option<NodeExport> {
    let mut parts = line.split_whitespace();
    let id = InfoHash::from_hex(parts.next()?).ok()?;
    let addr: SocketAddr = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(NodeExport { id, addr })
}

/// Replace the content of `dir` with one file per key
pub fn save_values(dir: &Path, values: &[(InfoHash, Vec<u8>)]) -> DhtResult<()> {
    fs::create_dir_all(dir)?;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let stale = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| InfoHash::from_hex(n).is_ok());
        if stale && path.is_file() {
            fs::remove_file(&path)?;
        }
    }
    for (key, blob) in values {
        write_atomic(&dir.join(key.to_hex()), blob)?;
    }
    info!("Saved values under {} keys to {}", values.len(), dir.display());
    Ok(())
}

/// Read the blobs written by [`save_values`]; a missing directory yields none
pub fn load_values(dir: &Path) -> DhtResult<Vec<(InfoHash, Vec<u8>)>> {
    if !dir.is_dir() {
        debug!("No value directory at {}", dir.display());
        return Ok(Vec::new());
    }
    let mut values = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let key = match path.file_name().and_then(|n| n.to_str()).map(InfoHash::from_hex) {
            Some(Ok(key)) => key,
            _ => {
                debug!("Ignoring {}", path.display());
                continue;
            }
        };
        match fs::read(&path) {
            Ok(blob) => values.push((key, blob)),
            Err(e) => warn!("Cannot read {}: {}", path.display(), e),
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DhtStorage;
    use crate::value::{TypeStore, Value, ValueType};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_nodes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.txt");
        let nodes = vec![
            NodeExport {
                id: InfoHash::get(b"a"),
                addr: "192.0.2.1:4222".parse().unwrap(),
            },
            NodeExport {
                id: InfoHash::get(b"b"),
                addr: "[2001:db8::2]:4223".parse().unwrap(),
            },
        ];
        save_nodes(&path, &nodes).unwrap();
        assert_eq!(load_nodes(&path).unwrap(), nodes);
    }

    #[test]
    fn test_load_nodes_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.txt");
        let good = InfoHash::get(b"good");
        let content = format!(
            "# bootstrap\nnot-hex 1.2.3.4:5\n{} 198.51.100.7:4222\n{} nowhere\n\n",
            good.to_hex(),
            good.to_hex()
        );
        fs::write(&path, content).unwrap();

        let nodes = load_nodes(&path).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, good);
    }

    #[test]
    fn test_missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_nodes(&dir.path().join("none")).unwrap().is_empty());
        assert!(load_values(&dir.path().join("none")).unwrap().is_empty());
    }

    #[test]
    fn test_values_round_trip_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let now = Instant::now();
        let types = TypeStore::new();
        let key = InfoHash::get(b"key");

        let mut storage = DhtStorage::new();
        storage.insert(key, Arc::new(Value::new(ValueType::USER_DATA, b"one".to_vec()).with_id(1)), now);
        storage.insert(key, Arc::new(Value::new(ValueType::USER_DATA, b"two".to_vec()).with_id(2)), now);
        save_values(dir.path(), &storage.export_values(now)).unwrap();
        assert!(dir.path().join(key.to_hex()).is_file());

        let mut restored = DhtStorage::new();
        let blobs = load_values(dir.path()).unwrap();
        assert_eq!(restored.import_values(&blobs, now, &types), 2);
        assert_eq!(restored.get_values(&key, None).len(), 2);
    }

    #[test]
    fn test_save_values_drops_stale_keys() {
        let dir = tempfile::tempdir().unwrap();
        let old = InfoHash::get(b"old");
        save_values(dir.path(), &[(old, vec![0, 0])]).unwrap();
        save_values(dir.path(), &[]).unwrap();
        assert!(!dir.path().join(old.to_hex()).exists());
    }
}
