//! WAL entry types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{EntryId, TransactionId};
use chrono::{DateTime, Utc};

/// Fixed bytes before the location string:
/// id (8) + type (4) + transaction id (8) + timestamp (8) + location length (4).
const PREFIX_SIZE: usize = 32;

/// Fixed bytes between the location string and the payload:
/// offset (8) + data length (4).
const MIDDLE_SIZE: usize = 12;

/// 100ns ticks per second.
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Type of WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum WalEntryType {
    /// Write bytes to a location at an offset.
    Write = 0,
    /// Delete a location.
    Delete = 1,
    /// Commit a transaction.
    Commit = 2,
    /// Roll back a transaction.
    Rollback = 3,
}

impl WalEntryType {
    /// Converts a stored discriminant to an entry type.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Write),
            1 => Some(Self::Delete),
            2 => Some(Self::Commit),
            3 => Some(Self::Rollback),
            _ => None,
        }
    }

    /// Returns the stored discriminant.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns true for entries that end a transaction.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }
}

/// A single entry of the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Monotonic entry identifier.
    pub id: EntryId,
    /// What the entry records.
    pub entry_type: WalEntryType,
    /// Owning transaction.
    pub transaction_id: TransactionId,
    /// Creation time in 100ns ticks since the Unix epoch.
    pub timestamp: i64,
    /// Target location for Write/Delete entries.
    pub location: Option<String>,
    /// Write offset.
    pub offset: u64,
    /// Write payload.
    pub data: Vec<u8>,
}

impl WalEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(
        id: EntryId,
        entry_type: WalEntryType,
        transaction_id: TransactionId,
        location: Option<String>,
        offset: u64,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id,
            entry_type,
            transaction_id,
            timestamp: now_ticks(),
            location,
            offset,
            data,
        }
    }

    /// Returns the creation time, if the stored tick count is representable.
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.timestamp.div_euclid(TICKS_PER_SECOND);
        let nanos = (self.timestamp.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        DateTime::from_timestamp(secs, nanos)
    }

    /// Serializes the entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a field does not fit its on-disk width.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let location = self.location.as_deref().unwrap_or("").as_bytes();
        let location_len = i32::try_from(location.len())
            .map_err(|_| CoreError::invalid_operation("WAL location too long"))?;
        let data_len = i32::try_from(self.data.len())
            .map_err(|_| CoreError::invalid_operation("WAL payload exceeds 2 GiB"))?;
        let id = i64::try_from(self.id.as_u64())
            .map_err(|_| CoreError::invalid_operation("WAL entry id overflow"))?;
        let txid = i64::try_from(self.transaction_id.as_u64())
            .map_err(|_| CoreError::invalid_operation("transaction id overflow"))?;
        let offset = i64::try_from(self.offset)
            .map_err(|_| CoreError::invalid_operation("WAL offset overflow"))?;

        let mut buf =
            Vec::with_capacity(PREFIX_SIZE + location.len() + MIDDLE_SIZE + self.data.len());
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&self.entry_type.as_i32().to_le_bytes());
        buf.extend_from_slice(&txid.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&location_len.to_le_bytes());
        buf.extend_from_slice(location);
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Decodes one entry from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` ends inside the entry (a torn write),
    /// otherwise the entry and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns a WAL corruption error for structurally invalid entries:
    /// unknown type, negative lengths or ids, or a non-UTF-8 location.
    pub fn decode(buf: &[u8]) -> CoreResult<Option<(Self, usize)>> {
        let mut reader = Reader { buf, pos: 0 };

        let Some(prefix) = reader.take(PREFIX_SIZE) else {
            return Ok(None);
        };
        let id = i64_at(prefix, 0);
        let raw_type = i32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]);
        let txid = i64_at(prefix, 12);
        let timestamp = i64_at(prefix, 20);
        let location_len = i32::from_le_bytes([prefix[28], prefix[29], prefix[30], prefix[31]]);

        let entry_type = WalEntryType::from_i32(raw_type)
            .ok_or_else(|| CoreError::wal_corruption(format!("unknown entry type {raw_type}")))?;
        let id = u64::try_from(id)
            .map_err(|_| CoreError::wal_corruption(format!("negative entry id {id}")))?;
        let txid = u64::try_from(txid)
            .map_err(|_| CoreError::wal_corruption(format!("negative transaction id {txid}")))?;
        let location_len = usize::try_from(location_len).map_err(|_| {
            CoreError::wal_corruption(format!("negative location length {location_len}"))
        })?;

        let Some(location_bytes) = reader.take(location_len) else {
            return Ok(None);
        };
        let location = if location_len == 0 {
            None
        } else {
            Some(
                std::str::from_utf8(location_bytes)
                    .map_err(|_| CoreError::wal_corruption("location is not UTF-8"))?
                    .to_string(),
            )
        };

        let Some(middle) = reader.take(MIDDLE_SIZE) else {
            return Ok(None);
        };
        let offset = i64_at(middle, 0);
        let data_len = i32::from_le_bytes([middle[8], middle[9], middle[10], middle[11]]);
        let offset = u64::try_from(offset)
            .map_err(|_| CoreError::wal_corruption(format!("negative offset {offset}")))?;
        let data_len = usize::try_from(data_len)
            .map_err(|_| CoreError::wal_corruption(format!("negative data length {data_len}")))?;

        let Some(data) = reader.take(data_len) else {
            return Ok(None);
        };

        let entry = Self {
            id: EntryId::new(id),
            entry_type,
            transaction_id: TransactionId::new(txid),
            timestamp,
            location,
            offset,
            data: data.to_vec(),
        };
        Ok(Some((entry, reader.pos)))
    }
}

/// Result of parsing a whole log buffer.
#[derive(Debug, Default)]
pub struct ParsedLog {
    /// Complete entries in log order.
    pub entries: Vec<WalEntry>,
    /// Bytes covered by complete entries; anything after is a torn tail.
    pub valid_len: usize,
}

/// Parses every complete entry in `buf`, stopping at a torn tail.
pub fn parse_log(buf: &[u8]) -> CoreResult<ParsedLog> {
    let mut parsed = ParsedLog::default();
    while parsed.valid_len < buf.len() {
        match WalEntry::decode(&buf[parsed.valid_len..])? {
            Some((entry, used)) => {
                parsed.entries.push(entry);
                parsed.valid_len += used;
            }
            None => break,
        }
    }
    Ok(parsed)
}

/// Current time in 100ns ticks since the Unix epoch.
fn now_ticks() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() / 100
}

fn i64_at(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(raw)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_entry(id: u64, tx: u64, location: &str, data: &[u8]) -> WalEntry {
        WalEntry::new(
            EntryId::new(id),
            WalEntryType::Write,
            TransactionId::new(tx),
            Some(location.to_string()),
            0,
            data.to_vec(),
        )
    }

    #[test]
    fn entry_type_roundtrip() {
        for t in [
            WalEntryType::Write,
            WalEntryType::Delete,
            WalEntryType::Commit,
            WalEntryType::Rollback,
        ] {
            assert_eq!(WalEntryType::from_i32(t.as_i32()), Some(t));
        }
        assert_eq!(WalEntryType::from_i32(9), None);
    }

    #[test]
    fn layout_is_little_endian_and_ordered() {
        let entry = WalEntry {
            id: EntryId::new(1),
            entry_type: WalEntryType::Write,
            transaction_id: TransactionId::new(2),
            timestamp: 3,
            location: Some("ab".into()),
            offset: 4,
            data: vec![0xEE],
        };
        let bytes = entry.encode().unwrap();

        assert_eq!(bytes.len(), PREFIX_SIZE + 2 + MIDDLE_SIZE + 1);
        assert_eq!(&bytes[0..8], &1i64.to_le_bytes());
        assert_eq!(&bytes[8..12], &0i32.to_le_bytes());
        assert_eq!(&bytes[12..20], &2i64.to_le_bytes());
        assert_eq!(&bytes[20..28], &3i64.to_le_bytes());
        assert_eq!(&bytes[28..32], &2i32.to_le_bytes());
        assert_eq!(&bytes[32..34], b"ab");
        assert_eq!(&bytes[34..42], &4i64.to_le_bytes());
        assert_eq!(&bytes[42..46], &1i32.to_le_bytes());
        assert_eq!(bytes[46], 0xEE);
    }

    #[test]
    fn commit_without_location_roundtrips() {
        let entry = WalEntry::new(
            EntryId::new(7),
            WalEntryType::Commit,
            TransactionId::new(3),
            None,
            0,
            Vec::new(),
        );
        let bytes = entry.encode().unwrap();
        let (decoded, used) = WalEntry::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(used, bytes.len());
        assert!(decoded.created_at().is_some());
    }

    #[test]
    fn torn_tail_is_end_of_log() {
        let mut buf = write_entry(1, 1, "a.data", b"hello").encode().unwrap();
        let second = write_entry(2, 1, "b.data", b"world").encode().unwrap();
        buf.extend_from_slice(&second[..second.len() - 2]);

        let parsed = parse_log(&buf).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.valid_len, buf.len() - (second.len() - 2));
    }

    #[test]
    fn unknown_type_is_corruption() {
        let mut bytes = write_entry(1, 1, "a", b"x").encode().unwrap();
        bytes[8..12].copy_from_slice(&42i32.to_le_bytes());
        assert!(matches!(
            WalEntry::decode(&bytes),
            Err(CoreError::WalCorruption { .. })
        ));
    }

    #[test]
    fn negative_length_is_corruption() {
        let mut bytes = write_entry(1, 1, "", b"x").encode().unwrap();
        bytes[PREFIX_SIZE + 8..PREFIX_SIZE + 12].copy_from_slice(&(-5i32).to_le_bytes());
        assert!(matches!(
            parse_log(&bytes),
            Err(CoreError::WalCorruption { .. })
        ));
    }
}
