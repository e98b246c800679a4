// 公钥目录

use rusqlite::{params, OptionalExtension, Row};

use super::{from_millis, Database, StoreError};
use crate::models::PublicKeyEntry;

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<PublicKeyEntry> {
    Ok(PublicKeyEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        public_key: row.get(2)?,
        created_at: from_millis(row.get(3)?),
    })
}

impl Database {
    pub fn insert_public_key(&self, entry: &PublicKeyEntry) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO public_keys (id, name, public_key, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.id,
                    entry.name,
                    entry.public_key,
                    entry.created_at.timestamp_millis()
                ],
            )
            .map_err(|e| StoreError::from_insert(e, &format!("public key '{}'", entry.name)))?;
        Ok(())
    }

    pub fn get_public_key(&self, id: &str) -> Result<Option<PublicKeyEntry>, StoreError> {
        let entry = self
            .conn()
            .query_row(
                "SELECT id, name, public_key, created_at FROM public_keys WHERE id = ?1 OR name = ?1",
                params![id],
                key_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list_public_keys(&self) -> Result<Vec<PublicKeyEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, public_key, created_at FROM public_keys ORDER BY created_at, name",
        )?;
        let keys = stmt
            .query_map([], key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn delete_public_key(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM public_keys WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str, name: &str) -> PublicKeyEntry {
        PublicKeyEntry {
            id: id.to_string(),
            name: name.to_string(),
            public_key: format!("ssh-ed25519 AAAAC3Nza{} {}@laptop", id, name),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_public_key_catalogue() {
        let db = Database::open_in_memory().unwrap();
        db.insert_public_key(&entry("k1", "alice")).unwrap();
        db.insert_public_key(&entry("k2", "bob")).unwrap();

        assert_eq!(db.list_public_keys().unwrap().len(), 2);
        assert_eq!(db.get_public_key("bob").unwrap().unwrap().id, "k2");

        assert!(matches!(
            db.insert_public_key(&entry("k3", "alice")),
            Err(StoreError::InvalidInput(_))
        ));

        assert!(db.delete_public_key("k1").unwrap());
        assert!(db.get_public_key("k1").unwrap().is_none());
    }
}
