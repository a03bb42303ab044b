//! redb table definitions.
//!
//! Both tables use `&str` keys and `&[u8]` values holding JSON.

use redb::TableDefinition;

/// Service specs keyed by service id.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Terminal deployment records keyed by deployment id. Append-only.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");
