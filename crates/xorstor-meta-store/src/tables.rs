//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: file path relative to the chunk root, Value: 16-byte placement record
pub const PLACEMENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("placements");

// Reserved key in PLACEMENTS holding the 8-byte format version.
// Paths never start with a NUL byte.
pub const FORMAT_VERSION_KEY: &[u8] = b"\x00xorstor.format-version";
