use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            collection  TEXT NOT NULL,
            id          TEXT NOT NULL,
            data        TEXT NOT NULL,
            update_time INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        );

        CREATE TABLE IF NOT EXISTS accounts (
            id            TEXT PRIMARY KEY,
            email         TEXT UNIQUE,
            password      TEXT,
            phone_number  TEXT UNIQUE,
            display_name  TEXT,
            photo_url     TEXT,
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS federated_links (
            provider    TEXT NOT NULL,
            subject     TEXT NOT NULL,
            account_id  TEXT NOT NULL REFERENCES accounts(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (provider, subject)
        );

        CREATE TABLE IF NOT EXISTS challenges (
            id          TEXT PRIMARY KEY,
            nonce       TEXT NOT NULL,
            difficulty  INTEGER NOT NULL,
            expires_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS phone_verifications (
            id            TEXT PRIMARY KEY,
            phone_number  TEXT NOT NULL,
            code_hash     TEXT NOT NULL,
            expires_at    INTEGER NOT NULL,
            attempts      INTEGER NOT NULL DEFAULT 0
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
