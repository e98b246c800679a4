// 主机记录与指纹

use rusqlite::{params, OptionalExtension, Row};

use super::{from_millis, Database, StoreError};
use crate::models::{AuthType, Host};
use crate::ssh::{HostTrustStore, SshError};

const HOST_COLUMNS: &str = "id, name, hostname, port, username, auth_type, password_encrypted, \
     private_key_encrypted, passphrase_encrypted, fingerprint, created_at";

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    let auth_type: String = row.get(5)?;
    Ok(Host {
        id: row.get(0)?,
        name: row.get(1)?,
        hostname: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        auth_type: AuthType::parse(&auth_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown auth type '{}'", auth_type).into(),
            )
        })?,
        password_encrypted: row.get(6)?,
        private_key_encrypted: row.get(7)?,
        passphrase_encrypted: row.get(8)?,
        fingerprint: row.get(9)?,
        created_at: from_millis(row.get(10)?),
    })
}

impl Database {
    /// 新增主机（名称唯一；凭据与认证方式不匹配时由 CHECK 约束拒绝）
    pub fn insert_host(&self, host: &Host) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO hosts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    HOST_COLUMNS
                ),
                params![
                    host.id,
                    host.name,
                    host.hostname,
                    host.port,
                    host.username,
                    host.auth_type.as_str(),
                    host.password_encrypted,
                    host.private_key_encrypted,
                    host.passphrase_encrypted,
                    host.fingerprint,
                    host.created_at.timestamp_millis(),
                ],
            )
            .map_err(|e| StoreError::from_insert(e, &format!("host '{}'", host.name)))?;
        Ok(())
    }

    pub fn get_host(&self, id: &str) -> Result<Option<Host>, StoreError> {
        let host = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM hosts WHERE id = ?1", HOST_COLUMNS),
                params![id],
                host_from_row,
            )
            .optional()?;
        Ok(host)
    }

    /// 按 ID 或名称查找主机
    pub fn find_host(&self, id_or_name: &str) -> Result<Option<Host>, StoreError> {
        let host = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM hosts WHERE id = ?1 OR name = ?1 ORDER BY id = ?1 DESC LIMIT 1",
                    HOST_COLUMNS
                ),
                params![id_or_name],
                host_from_row,
            )
            .optional()?;
        Ok(host)
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM hosts ORDER BY name",
            HOST_COLUMNS
        ))?;
        let hosts = stmt
            .query_map([], host_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(hosts)
    }

    /// 删除主机，引用它的任务 host_id 置空
    pub fn delete_host(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn get_fingerprint(&self, host_id: &str) -> Result<Option<String>, StoreError> {
        let fingerprint = self
            .conn()
            .query_row(
                "SELECT fingerprint FROM hosts WHERE id = ?1",
                params![host_id],
                |r| r.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(fingerprint.flatten())
    }

    /// 仅在尚无指纹时写入
    pub fn set_fingerprint_if_absent(
        &self,
        host_id: &str,
        fingerprint: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE hosts SET fingerprint = ?2 WHERE id = ?1 AND fingerprint IS NULL",
            params![host_id, fingerprint],
        )?;
        Ok(changed == 1)
    }
}

impl HostTrustStore for Database {
    fn get_fingerprint(&self, host_id: &str) -> Result<Option<String>, SshError> {
        Database::get_fingerprint(self, host_id)
            .map_err(|e| SshError::Config(format!("Host trust store: {}", e)))
    }

    fn set_fingerprint_if_absent(
        &self,
        host_id: &str,
        fingerprint: &str,
    ) -> Result<bool, SshError> {
        Database::set_fingerprint_if_absent(self, host_id, fingerprint)
            .map_err(|e| SshError::Config(format!("Host trust store: {}", e)))
    }
}
