//! Entity definitions: one declarative mapping table per entity type.
//!
//! An [`EntityDef`] ties an [`EntityType`] to the remote module it is
//! fetched from, the local table it is stored in, and the ordered
//! [`FieldSpec`] table that the generic mapper consumes. The migration
//! layer derives table columns from the same tables, so adding a row to a
//! mapping table is the only change needed to mirror a new remote field.

mod accounts;
mod contacts;
mod intern_roles;

use serde_json::Value;

use crate::error::MappingError;
use crate::mapping::{self, FieldKind, FieldSpec};
use crate::models::{EntityType, MappedRecord};

pub use accounts::ACCOUNT_FIELDS;
pub use contacts::CONTACT_FIELDS;
pub use intern_roles::INTERN_ROLE_FIELDS;

/// Remote field every entity is sorted and filtered by.
pub const MODIFIED_FIELD: &str = "Modified_Time";

/// Local column holding the mapped modification time.
pub const MODIFIED_COLUMN: &str = "modified_time";

/// Static description of one synchronized entity type.
#[derive(Debug)]
pub struct EntityDef {
    pub entity: EntityType,
    /// Remote module name, e.g. `Contacts`.
    pub module: &'static str,
    /// Local table name.
    pub table: &'static str,
    pub fields: &'static [FieldSpec],
}

static CONTACTS: EntityDef = EntityDef {
    entity: EntityType::Contacts,
    module: "Contacts",
    table: "contacts",
    fields: CONTACT_FIELDS,
};

static ACCOUNTS: EntityDef = EntityDef {
    entity: EntityType::Accounts,
    module: "Accounts",
    table: "accounts",
    fields: ACCOUNT_FIELDS,
};

static INTERN_ROLES: EntityDef = EntityDef {
    entity: EntityType::InternRoles,
    module: "Intern_Roles",
    table: "intern_roles",
    fields: INTERN_ROLE_FIELDS,
};

/// Look up the definition for an entity type.
pub fn definition(entity: EntityType) -> &'static EntityDef {
    match entity {
        EntityType::Contacts => &CONTACTS,
        EntityType::Accounts => &ACCOUNTS,
        EntityType::InternRoles => &INTERN_ROLES,
    }
}

/// All definitions in `sync all` order.
pub fn all() -> [&'static EntityDef; 3] {
    EntityType::ALL.map(definition)
}

impl EntityDef {
    /// Map one remote record of this entity.
    pub fn map(&self, record: &Value) -> Result<MappedRecord, MappingError> {
        mapping::map_record(self.fields, record)
    }

    /// Remote field list sent with every fetch.
    pub fn fetch_fields(&self) -> Vec<&'static str> {
        mapping::source_fields(self.fields)
    }

    /// Non-identifier columns with their SQL types, in table order.
    pub fn columns(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.fields
            .iter()
            .filter(|f| f.kind != FieldKind::Identifier)
            .map(|f| (f.column, f.kind.sql_type()))
    }

    /// Field kind mapped to `column`, if any.
    pub fn column_kind(&self, column: &str) -> Option<FieldKind> {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .map(|f| f.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_table_has_one_identifier_mapped_to_id() {
        for def in all() {
            let ids: Vec<_> = def
                .fields
                .iter()
                .filter(|f| f.kind == FieldKind::Identifier)
                .collect();
            assert_eq!(ids.len(), 1, "{}", def.table);
            assert_eq!(ids[0].column, "id");
            assert_eq!(ids[0].source, "id");
        }
    }

    #[test]
    fn columns_are_unique_per_table() {
        for def in all() {
            let mut seen = HashSet::new();
            for spec in def.fields {
                assert!(
                    seen.insert(spec.column),
                    "duplicate column {} in {}",
                    spec.column,
                    def.table
                );
            }
        }
    }

    #[test]
    fn every_table_carries_the_modification_time() {
        for def in all() {
            assert_eq!(def.column_kind(MODIFIED_COLUMN), Some(FieldKind::DateTime));
            assert!(def.fetch_fields().contains(&MODIFIED_FIELD));
        }
    }

    #[test]
    fn contact_account_lookup_is_a_soft_reference() {
        let contacts = definition(EntityType::Contacts);
        assert_eq!(contacts.column_kind("account_id"), Some(FieldKind::LookupId));
        let roles = definition(EntityType::InternRoles);
        assert_eq!(roles.column_kind("company_id"), Some(FieldKind::LookupId));
        assert_eq!(roles.column_kind("contact_id"), Some(FieldKind::LookupId));
    }
}
