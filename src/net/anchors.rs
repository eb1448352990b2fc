//! Anchor persistence
//!
//! Up to two most-recently-used outbound peers are written out on shutdown
//! and re-dialed once on startup, so a restart cannot be captured by a
//! fully fresh (attacker-supplied) peer set. The file is deleted after
//! reading regardless of whether the reconnects succeed; a stale anchor
//! file must never be replayed twice.

use super::types::NetAddress;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Maximum anchors persisted across a restart.
pub const MAX_ANCHORS: usize = 2;

const ANCHOR_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct AnchorEntry {
    services: u64,
    ip: [u8; 16],
    port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnchorFile {
    version: u32,
    count: usize,
    anchors: Vec<AnchorEntry>,
}

/// Write the selected anchors. Called from the orderly shutdown path only.
pub fn save_anchors<P: AsRef<Path>>(path: P, anchors: &[NetAddress]) -> std::io::Result<()> {
    let entries: Vec<AnchorEntry> = anchors
        .iter()
        .take(MAX_ANCHORS)
        .map(|addr| AnchorEntry {
            services: addr.services,
            ip: addr.ip,
            port: addr.port,
        })
        .collect();
    let file = AnchorFile {
        version: ANCHOR_FILE_VERSION,
        count: entries.len(),
        anchors: entries,
    };
    let data = serde_json::to_vec_pretty(&file)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    super::connman::atomic_write(path.as_ref(), &data)
}

/// Read and delete the anchor file. Corrupt or missing files yield an
/// empty list; the delete happens regardless.
pub fn load_and_delete_anchors<P: AsRef<Path>>(path: P) -> Vec<NetAddress> {
    let path = path.as_ref();
    let anchors = match std::fs::read(path) {
        Ok(data) => match serde_json::from_slice::<AnchorFile>(&data) {
            Ok(file) => {
                let mut anchors: Vec<NetAddress> = file
                    .anchors
                    .into_iter()
                    .map(|entry| NetAddress {
                        services: entry.services,
                        ip: entry.ip,
                        port: entry.port,
                    })
                    .collect();
                anchors.truncate(MAX_ANCHORS);
                debug!("loaded {} anchors", anchors.len());
                anchors
            }
            Err(err) => {
                warn!("corrupt anchor file, ignoring: {err}");
                Vec::new()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            warn!("failed to read anchor file: {err}");
            Vec::new()
        }
    };

    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to delete anchor file: {err}");
        }
    }
    anchors
}
