use redb::TableDefinition;

/// Table for storing events.
/// Key: global stamp
/// Value: serialized Event as bytes
pub const EVENTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

/// Index of each aggregate's history.
/// Key: (aggregate ID, version)
/// Value: stamp of the event in EVENTS_TABLE
pub const AGGREGATES_TABLE: TableDefinition<(&str, u64), u64> = TableDefinition::new("aggregates");

/// Table for storing projection watermarks.
/// Key: projection scope
/// Value: stamp of the last applied event
pub const WATERMARKS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("watermarks");

/// Table for storing projection documents.
/// Key: (projection scope, document key)
/// Value: serialized JSON document as bytes
pub const DOCUMENTS_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("documents");
