use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::models::{AccountRow, ChallengeRow, VerificationRow};
use crate::{Database, Result};

const ACCOUNT_COLUMNS: &str =
    "id, email, password, phone_number, display_name, photo_url, created_at";

impl Database {
    // -- Accounts --

    pub fn create_account(
        &self,
        id: &str,
        email: Option<&str>,
        password_hash: Option<&str>,
        phone_number: Option<&str>,
        display_name: Option<&str>,
        photo_url: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts (id, email, password, phone_number, display_name, photo_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, email, password_hash, phone_number, display_name, photo_url],
            )?;
            Ok(())
        })
    }

    pub fn get_account_by_id(&self, id: &str) -> Result<Option<AccountRow>> {
        self.with_conn(|conn| query_account(conn, "id", id))
    }

    pub fn get_account_by_email(&self, email: &str) -> Result<Option<AccountRow>> {
        self.with_conn(|conn| query_account(conn, "email", email))
    }

    pub fn get_account_by_phone(&self, phone_number: &str) -> Result<Option<AccountRow>> {
        self.with_conn(|conn| query_account(conn, "phone_number", phone_number))
    }

    /// Overwrite only the profile fields that are given.
    pub fn update_account_profile(
        &self,
        id: &str,
        display_name: Option<&str>,
        photo_url: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts
                 SET display_name = COALESCE(?2, display_name),
                     photo_url = COALESCE(?3, photo_url)
                 WHERE id = ?1",
                params![id, display_name, photo_url],
            )?;
            Ok(())
        })
    }

    // -- Federated links --

    pub fn find_federated_link(&self, provider: &str, subject: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let account_id: Option<String> = conn
                .query_row(
                    "SELECT account_id FROM federated_links WHERE provider = ?1 AND subject = ?2",
                    params![provider, subject],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(account_id)
        })
    }

    pub fn link_federated(&self, provider: &str, subject: &str, account_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO federated_links (provider, subject, account_id) VALUES (?1, ?2, ?3)",
                params![provider, subject, account_id],
            )?;
            Ok(())
        })
    }

    // -- Challenges --

    pub fn insert_challenge(&self, challenge: &ChallengeRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO challenges (id, nonce, difficulty, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![challenge.id, challenge.nonce, challenge.difficulty, challenge.expires_at],
            )?;
            Ok(())
        })
    }

    /// Remove and return a challenge. A challenge can be taken at most once.
    pub fn take_challenge(&self, id: &str) -> Result<Option<ChallengeRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row = tx
                .query_row(
                    "SELECT id, nonce, difficulty, expires_at FROM challenges WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(ChallengeRow {
                            id: row.get(0)?,
                            nonce: row.get(1)?,
                            difficulty: row.get(2)?,
                            expires_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            if row.is_some() {
                tx.execute("DELETE FROM challenges WHERE id = ?1", [id])?;
            }
            tx.commit()?;
            Ok(row)
        })
    }

    /// Drop challenges that expired before `now` (unix seconds).
    pub fn purge_expired_challenges(&self, now: i64) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM challenges WHERE expires_at < ?1", [now])?))
    }

    // -- Phone verifications --

    pub fn insert_verification(&self, verification: &VerificationRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO phone_verifications (id, phone_number, code_hash, expires_at, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    verification.id,
                    verification.phone_number,
                    verification.code_hash,
                    verification.expires_at,
                    verification.attempts
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_verification(&self, id: &str) -> Result<Option<VerificationRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, phone_number, code_hash, expires_at, attempts
                     FROM phone_verifications WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(VerificationRow {
                            id: row.get(0)?,
                            phone_number: row.get(1)?,
                            code_hash: row.get(2)?,
                            expires_at: row.get(3)?,
                            attempts: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Record a failed attempt and return the new attempt count.
    pub fn record_failed_attempt(&self, id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE phone_verifications SET attempts = attempts + 1 WHERE id = ?1",
                [id],
            )?;
            let attempts: Option<u32> = conn
                .query_row(
                    "SELECT attempts FROM phone_verifications WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(attempts.unwrap_or(0))
        })
    }

    pub fn delete_verification(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM phone_verifications WHERE id = ?1", [id])?;
            Ok(())
        })
    }
}

fn query_account(conn: &Connection, column: &str, value: &str) -> Result<Option<AccountRow>> {
    // column names are fixed by the callers above, never user input
    let sql = format!("SELECT {} FROM accounts WHERE {} = ?1", ACCOUNT_COLUMNS, column);
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt.query_row([value], account_from_row).optional()?;
    Ok(row)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        email: row.get(1)?,
        password: row.get(2)?,
        phone_number: row.get(3)?,
        display_name: row.get(4)?,
        photo_url: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_email_is_a_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        db.create_account("a1", Some("x@example.com"), Some("hash"), None, None, None)
            .unwrap();
        let err = db
            .create_account("a2", Some("x@example.com"), Some("hash"), None, None, None)
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert!(!crate::DbError::LockPoisoned.is_unique_violation());
    }

    #[test]
    fn account_lookup_by_each_key() {
        let db = Database::open_in_memory().unwrap();
        db.create_account("a1", Some("x@example.com"), Some("hash"), None, Some("X"), None)
            .unwrap();
        db.create_account("a2", None, None, Some("+15550001111"), None, None)
            .unwrap();

        assert_eq!(db.get_account_by_email("x@example.com").unwrap().unwrap().id, "a1");
        assert_eq!(db.get_account_by_phone("+15550001111").unwrap().unwrap().id, "a2");
        assert!(db.get_account_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn profile_update_keeps_unspecified_fields() {
        let db = Database::open_in_memory().unwrap();
        db.create_account("a1", Some("x@example.com"), None, None, Some("X"), Some("p.png"))
            .unwrap();
        db.update_account_profile("a1", Some("Xavier"), None).unwrap();

        let row = db.get_account_by_id("a1").unwrap().unwrap();
        assert_eq!(row.display_name.as_deref(), Some("Xavier"));
        assert_eq!(row.photo_url.as_deref(), Some("p.png"));
    }

    #[test]
    fn challenge_is_single_use() {
        let db = Database::open_in_memory().unwrap();
        db.insert_challenge(&ChallengeRow {
            id: "c1".into(),
            nonce: "ab".into(),
            difficulty: 4,
            expires_at: 100,
        })
        .unwrap();
        assert!(db.take_challenge("c1").unwrap().is_some());
        assert!(db.take_challenge("c1").unwrap().is_none());
    }

    #[test]
    fn failed_attempts_accumulate() {
        let db = Database::open_in_memory().unwrap();
        db.insert_verification(&VerificationRow {
            id: "v1".into(),
            phone_number: "+15550001111".into(),
            code_hash: "h".into(),
            expires_at: 100,
            attempts: 0,
        })
        .unwrap();
        assert_eq!(db.record_failed_attempt("v1").unwrap(), 1);
        assert_eq!(db.record_failed_attempt("v1").unwrap(), 2);
        db.delete_verification("v1").unwrap();
        assert!(db.get_verification("v1").unwrap().is_none());
    }
}
