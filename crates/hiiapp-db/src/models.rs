/// Database row types. These map directly to SQLite rows.
/// Distinct from hiiapp-types API models to keep the DB layer independent.

pub struct AccountRow {
    pub id: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub created_at: String,
}

pub struct ChallengeRow {
    pub id: String,
    pub nonce: String,
    pub difficulty: u32,
    /// Unix seconds.
    pub expires_at: i64,
}

pub struct VerificationRow {
    pub id: String,
    pub phone_number: String,
    pub code_hash: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub attempts: u32,
}
