use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use tracing::debug;

use hiiapp_types::error::StoreError;
use hiiapp_types::store::{DocPath, Document, Query, Write};

use crate::{Database, Result};

/// Outcome of an applied batch.
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// Server timestamp assigned to every write in the batch (epoch µs).
    pub update_time: i64,
    pub collections: Vec<String>,
}

impl Database {
    pub fn get_document(&self, path: &DocPath) -> Result<Option<Document>> {
        self.with_conn(|conn| load_document(conn, path))
    }

    /// Run a query over one collection. Filtering and ordering happen in
    /// memory on the collection's documents.
    pub fn query_documents(&self, query: &Query) -> Result<Vec<Document>> {
        let documents = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, data FROM documents WHERE collection = ?1")?;
            let rows = stmt
                .query_map([&query.collection], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, data)| -> Result<Document> {
                    Ok(Document { id, data: parse_data(&data)? })
                })
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(query.apply(documents))
    }

    /// Apply all writes atomically with one server timestamp.
    pub fn commit(&self, writes: &[Write]) -> Result<CommitResult> {
        if writes.is_empty() {
            return Err(StoreError::InvalidArgument("empty batch".into()).into());
        }

        self.with_conn_mut(|conn| {
            // Stamped under the connection lock so timestamps follow commit order
            let update_time = self.next_timestamp();
            let tx = conn.transaction()?;
            let mut collections = BTreeSet::new();

            for write in writes {
                let path = write.path();
                let existing = load_document(&tx, path)?;

                let data = match write {
                    Write::Create { fields, .. } => {
                        if existing.is_some() {
                            return Err(StoreError::AlreadyExists(path.to_string()).into());
                        }
                        fields.resolve(update_time)
                    }
                    Write::Set { fields, merge: false, .. } => fields.resolve(update_time),
                    Write::Set { fields, merge: true, .. } => {
                        let mut data = existing.map(|d| d.data).unwrap_or_default();
                        data.extend(fields.resolve(update_time));
                        data
                    }
                    Write::Update { fields, .. } => {
                        let Some(existing) = existing else {
                            return Err(StoreError::NotFound(path.to_string()).into());
                        };
                        let mut data = existing.data;
                        data.extend(fields.resolve(update_time));
                        data
                    }
                };

                tx.execute(
                    "INSERT OR REPLACE INTO documents (collection, id, data, update_time)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        path.collection(),
                        path.id(),
                        Value::Object(data).to_string(),
                        update_time
                    ],
                )?;
                collections.insert(path.collection().to_string());
            }

            tx.commit()?;
            debug!("Committed {} write(s) at {}", writes.len(), update_time);

            Ok(CommitResult {
                update_time,
                collections: collections.into_iter().collect(),
            })
        })
    }
}

fn load_document(conn: &Connection, path: &DocPath) -> Result<Option<Document>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
            params![path.collection(), path.id()],
            |row| row.get(0),
        )
        .optional()?;

    match data {
        Some(data) => Ok(Some(Document {
            id: path.id().to_string(),
            data: parse_data(&data)?,
        })),
        None => Ok(None),
    }
}

fn parse_data(data: &str) -> Result<Map<String, Value>> {
    Ok(serde_json::from_str(data)?)
}
