//! Related-device lookup over captured packets.

use std::sync::Arc;

use rusqlite::{params, ErrorCode};
use tokio_util::sync::CancellationToken;

use crate::error::{MergeError, Result};
use crate::storage::database::DatabaseHandle;

const RELATED_MACS_SQL: &str = "SELECT sourcemac FROM packets WHERE destmac = ?1 \
     UNION SELECT destmac FROM packets WHERE sourcemac = ?1";

/// Addresses that exchanged packets with a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatedMacs {
    /// Valid, distinct peer addresses.
    pub related: Vec<String>,
    /// Peer values that were blank or not a MAC address.
    pub rejected: Vec<String>,
}

impl DatabaseHandle {
    /// Find every address seen talking to `mac`, in either direction.
    ///
    /// Cancelling `cancel` interrupts the running statement.
    pub async fn related_macs(
        self: Arc<Self>,
        mac: &str,
        cancel: CancellationToken,
    ) -> Result<RelatedMacs> {
        if !is_valid_mac(mac) {
            return Err(MergeError::InvalidMac(mac.to_string()));
        }

        let interrupt = self.conn().get_interrupt_handle();
        let mac = mac.to_string();
        let token = cancel.clone();
        let query = tokio::task::spawn_blocking(move || {
            if token.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            self.related_macs_blocking(&mac)
        });

        tokio::select! {
            res = query => match res {
                Ok(Err(MergeError::Engine { source, .. }))
                    if source.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) =>
                {
                    Err(MergeError::Cancelled)
                }
                Ok(res) => res,
                Err(e) => Err(MergeError::Task(e.to_string())),
            },
            _ = cancel.cancelled() => {
                interrupt.interrupt();
                Err(MergeError::Cancelled)
            }
        }
    }

    /// Blocking form of [`DatabaseHandle::related_macs`].
    pub fn related_macs_blocking(&self, mac: &str) -> Result<RelatedMacs> {
        if !is_valid_mac(mac) {
            return Err(MergeError::InvalidMac(mac.to_string()));
        }

        let conn = self.conn();
        let mut stmt = conn
            .prepare(RELATED_MACS_SQL)
            .map_err(|e| MergeError::engine("preparing related mac query", e))?;
        let peers = stmt
            .query_map(params![mac], |row| row.get::<_, Option<String>>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| MergeError::engine("querying related macs", e))?;

        let mut found = RelatedMacs::default();
        for peer in peers {
            match peer {
                Some(addr) if is_valid_mac(&addr) => found.related.push(addr),
                Some(addr) => {
                    tracing::debug!(addr = %addr, "ignored invalid mac");
                    found.rejected.push(addr);
                }
                None => found.rejected.push(String::new()),
            }
        }
        Ok(found)
    }
}

/// Whether `s` is a hardware address: EUI-48, EUI-64 or a 20-octet
/// InfiniBand address. Octets are separated by `:` or `-`, or written as
/// dot-separated groups of four hex digits (`0123.4567.89ab`).
pub fn is_valid_mac(s: &str) -> bool {
    let (sep, width) = if s.contains('.') {
        ('.', 4)
    } else if s.contains(':') {
        (':', 2)
    } else {
        ('-', 2)
    };
    let groups: Vec<&str> = s.split(sep).collect();
    matches!(groups.len() * width / 2, 6 | 8 | 20)
        && groups
            .iter()
            .all(|g| g.len() == width && g.chars().all(|c| c.is_ascii_hexdigit()))
}
