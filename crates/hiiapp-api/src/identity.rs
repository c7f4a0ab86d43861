use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hiiapp_db::models::{AccountRow, ChallengeRow, VerificationRow};
use hiiapp_db::{Database, DbError};
use hiiapp_types::api::{
    AuthSession, AuthUser, Claims, FederatedClaims, FederatedCredential, LoginRequest,
    PhoneCodeRequest, PhoneConfirmRequest, ProfileUpdate, RegisterRequest, VerificationHandle,
};
use hiiapp_types::challenge::{self, ChallengeTicket};
use hiiapp_types::error::AuthError;

const MIN_PASSWORD_LEN: usize = 6;

pub struct IdentityConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    /// Federated issuer name -> shared secret its id tokens are signed with.
    pub federated_issuers: HashMap<String, String>,
    /// Leading zero bits a challenge solution must produce.
    pub challenge_difficulty: u32,
    pub challenge_ttl: Duration,
    pub code_ttl: Duration,
    pub max_code_attempts: u32,
}

impl IdentityConfig {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            token_ttl: Duration::days(30),
            federated_issuers: HashMap::new(),
            challenge_difficulty: 12,
            challenge_ttl: Duration::minutes(10),
            code_ttl: Duration::minutes(5),
            max_code_attempts: 5,
        }
    }
}

/// Delivers one-time codes to a phone number.
pub trait CodeSender: Send + Sync {
    fn send_code(&self, phone_number: &str, code: &str);
}

/// Writes codes to the log. Development delivery only.
pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send_code(&self, phone_number: &str, code: &str) {
        info!("Verification code for {}: {}", phone_number, code);
    }
}

/// Keeps every sent code in memory so a caller can read it back.
#[derive(Default)]
pub struct MemoryCodeSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl MemoryCodeSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_code_for(&self, phone_number: &str) -> Option<String> {
        let sent = self.sent.lock().ok()?;
        sent.iter()
            .rev()
            .find(|(number, _)| number == phone_number)
            .map(|(_, code)| code.clone())
    }
}

impl CodeSender for MemoryCodeSender {
    fn send_code(&self, phone_number: &str, code: &str) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((phone_number.to_string(), code.to_string()));
        }
    }
}

/// Account store and session issuer. All methods block (SQLite, Argon2);
/// async callers run them on `spawn_blocking`.
#[derive(Clone)]
pub struct IdentityService {
    db: Arc<Database>,
    config: Arc<IdentityConfig>,
    code_sender: Arc<dyn CodeSender>,
}

impl IdentityService {
    pub fn new(db: Arc<Database>, config: IdentityConfig, code_sender: Arc<dyn CodeSender>) -> Self {
        Self {
            db,
            config: Arc::new(config),
            code_sender,
        }
    }

    // -- Password accounts --

    pub fn register(&self, req: &RegisterRequest) -> Result<AuthSession, AuthError> {
        let email = normalize_email(&req.email)?;
        if req.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        if self.db.get_account_by_email(&email).map_err(internal)?.is_some() {
            return Err(AuthError::EmailAlreadyInUse);
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .to_string();

        let id = Uuid::new_v4().to_string();
        // A concurrent registration can pass the lookup above; the unique
        // index decides
        self.db
            .create_account(&id, Some(&email), Some(&password_hash), None, None, None)
            .map_err(|e| {
                if e.is_unique_violation() {
                    AuthError::EmailAlreadyInUse
                } else {
                    internal(e)
                }
            })?;

        info!("Registered account {} for {}", id, email);
        self.session_for(&id)
    }

    pub fn sign_in(&self, req: &LoginRequest) -> Result<AuthSession, AuthError> {
        let email = normalize_email(&req.email)?;
        let account = self
            .db
            .get_account_by_email(&email)
            .map_err(internal)?
            .ok_or(AuthError::UserNotFound)?;

        // Accounts created through a federated provider have no password
        let stored = account.password.as_deref().ok_or(AuthError::WrongPassword)?;
        let parsed_hash = PasswordHash::new(stored).map_err(|e| AuthError::Internal(e.to_string()))?;
        Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .map_err(|_| AuthError::WrongPassword)?;

        debug!("Password sign-in for {}", account.id);
        self.issue_session(account)
    }

    // -- Federated --

    pub fn sign_in_federated(&self, credential: &FederatedCredential) -> Result<AuthSession, AuthError> {
        let secret = self
            .config
            .federated_issuers
            .get(&credential.provider)
            .ok_or(AuthError::InvalidCredential)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[credential.provider.as_str()]);
        let claims = decode::<FederatedClaims>(
            &credential.id_token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            warn!("Rejected {} id token: {}", credential.provider, e);
            AuthError::InvalidCredential
        })?
        .claims;

        if let Some(account_id) = self
            .db
            .find_federated_link(&claims.iss, &claims.sub)
            .map_err(internal)?
        {
            return self.session_for(&account_id);
        }

        let email = claims.email.as_deref().map(str::to_lowercase);
        let existing = match &email {
            Some(email) => self.db.get_account_by_email(email).map_err(internal)?,
            None => None,
        };

        let account_id = match existing {
            Some(account) => account.id,
            None => {
                let id = Uuid::new_v4().to_string();
                self.db
                    .create_account(
                        &id,
                        email.as_deref(),
                        None,
                        None,
                        claims.name.as_deref(),
                        claims.picture.as_deref(),
                    )
                    .map_err(internal)?;
                info!("Created account {} from {} sign-in", id, claims.iss);
                id
            }
        };

        self.db
            .link_federated(&claims.iss, &claims.sub, &account_id)
            .map_err(internal)?;
        self.session_for(&account_id)
    }

    // -- Phone --

    pub fn issue_challenge(&self) -> Result<ChallengeTicket, AuthError> {
        let now = Utc::now();
        self.db.purge_expired_challenges(now.timestamp()).map_err(internal)?;

        let nonce: [u8; 16] = rand::random();
        let ticket = ChallengeTicket {
            id: Uuid::new_v4().to_string(),
            nonce: hex::encode(nonce),
            difficulty: self.config.challenge_difficulty,
            expires_at: now + self.config.challenge_ttl,
        };
        self.db
            .insert_challenge(&ChallengeRow {
                id: ticket.id.clone(),
                nonce: ticket.nonce.clone(),
                difficulty: ticket.difficulty,
                expires_at: ticket.expires_at.timestamp(),
            })
            .map_err(internal)?;

        debug!("Issued challenge {}", ticket.id);
        Ok(ticket)
    }

    /// First phone sign-in phase: check the solved challenge and send a code.
    pub fn request_phone_code(&self, req: &PhoneCodeRequest) -> Result<VerificationHandle, AuthError> {
        let challenge = self
            .db
            .take_challenge(&req.challenge.challenge_id)
            .map_err(internal)?
            .ok_or(AuthError::ChallengeFailed)?;
        if challenge.expires_at < Utc::now().timestamp()
            || !challenge::verify(&challenge.nonce, req.challenge.counter, challenge.difficulty)
        {
            warn!("Challenge {} failed verification", challenge.id);
            return Err(AuthError::ChallengeFailed);
        }

        let phone_number = req.phone_number.trim();
        if !is_e164(phone_number) {
            return Err(AuthError::InvalidPhoneNumber);
        }

        let code = format!("{:06}", rand::rng().random_range(0..1_000_000u32));
        let verification = VerificationRow {
            id: Uuid::new_v4().to_string(),
            phone_number: phone_number.to_string(),
            code_hash: hash_code(&code),
            expires_at: (Utc::now() + self.config.code_ttl).timestamp(),
            attempts: 0,
        };
        self.db.insert_verification(&verification).map_err(internal)?;

        self.code_sender.send_code(phone_number, &code);
        info!("Sent verification code to {}", phone_number);

        Ok(VerificationHandle {
            verification_id: verification.id,
        })
    }

    /// Second phone sign-in phase. A verification is consumed on success,
    /// on expiry and once the attempt limit is reached.
    pub fn confirm_phone_code(&self, req: &PhoneConfirmRequest) -> Result<AuthSession, AuthError> {
        let verification = self
            .db
            .get_verification(&req.verification_id)
            .map_err(internal)?
            .ok_or(AuthError::MissingVerification)?;

        if verification.expires_at < Utc::now().timestamp() {
            self.db.delete_verification(&verification.id).map_err(internal)?;
            return Err(AuthError::CodeExpired);
        }

        if hash_code(req.code.trim()) != verification.code_hash {
            let attempts = self.db.record_failed_attempt(&verification.id).map_err(internal)?;
            warn!("Wrong code for {} (attempt {})", verification.phone_number, attempts);
            if attempts >= self.config.max_code_attempts {
                self.db.delete_verification(&verification.id).map_err(internal)?;
            }
            return Err(AuthError::InvalidVerificationCode);
        }

        self.db.delete_verification(&verification.id).map_err(internal)?;

        let account = match self
            .db
            .get_account_by_phone(&verification.phone_number)
            .map_err(internal)?
        {
            Some(account) => account,
            None => {
                let id = Uuid::new_v4().to_string();
                self.db
                    .create_account(&id, None, None, Some(&verification.phone_number), None, None)
                    .map_err(internal)?;
                info!("Created account {} for {}", id, verification.phone_number);
                self.account(&id)?
            }
        };
        self.issue_session(account)
    }

    // -- Sessions & profile --

    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidCredential)
    }

    pub fn user(&self, uid: &str) -> Result<AuthUser, AuthError> {
        Ok(to_auth_user(self.account(uid)?))
    }

    pub fn update_profile(&self, uid: &str, update: &ProfileUpdate) -> Result<AuthUser, AuthError> {
        self.db
            .update_account_profile(uid, update.display_name.as_deref(), update.photo_url.as_deref())
            .map_err(internal)?;
        self.user(uid)
    }

    fn account(&self, uid: &str) -> Result<AccountRow, AuthError> {
        self.db
            .get_account_by_id(uid)
            .map_err(internal)?
            .ok_or(AuthError::UserNotFound)
    }

    fn session_for(&self, uid: &str) -> Result<AuthSession, AuthError> {
        let account = self.account(uid)?;
        self.issue_session(account)
    }

    fn issue_session(&self, account: AccountRow) -> Result<AuthSession, AuthError> {
        let token = self.create_token(&account.id, Utc::now() + self.config.token_ttl)?;
        Ok(AuthSession {
            token,
            user: to_auth_user(account),
        })
    }

    fn create_token(&self, uid: &str, expires_at: DateTime<Utc>) -> Result<String, AuthError> {
        let claims = Claims {
            sub: uid.to_string(),
            exp: expires_at.timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

fn to_auth_user(account: AccountRow) -> AuthUser {
    AuthUser {
        uid: account.id,
        email: account.email,
        display_name: account.display_name,
        photo_url: account.photo_url,
        phone_number: account.phone_number,
    }
}

fn internal(err: DbError) -> AuthError {
    error!("Identity store error: {}", err);
    AuthError::Internal(err.to_string())
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.contains(char::is_whitespace) =>
        {
            Ok(email)
        }
        _ => Err(AuthError::InvalidEmail),
    }
}

fn is_e164(phone_number: &str) -> bool {
    let Some(digits) = phone_number.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiiapp_types::challenge::ChallengeSolution;

    fn service_with(sender: Arc<MemoryCodeSender>) -> IdentityService {
        let mut config = IdentityConfig::new("test-secret");
        config.challenge_difficulty = 4;
        config
            .federated_issuers
            .insert("google".into(), "google-secret".into());
        IdentityService::new(Arc::new(Database::open_in_memory().unwrap()), config, sender)
    }

    fn service() -> IdentityService {
        service_with(Arc::new(MemoryCodeSender::new()))
    }

    fn register(service: &IdentityService, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        service.register(&RegisterRequest {
            email: email.into(),
            password: password.into(),
        })
    }

    #[test]
    fn register_then_sign_in_yields_same_identity() {
        let service = service();
        let registered = register(&service, "X@Example.com", "secret1").unwrap();
        assert_eq!(registered.user.email.as_deref(), Some("x@example.com"));

        let signed_in = service
            .sign_in(&LoginRequest {
                email: "x@example.com".into(),
                password: "secret1".into(),
            })
            .unwrap();
        assert_eq!(signed_in.user.uid, registered.user.uid);
        assert_eq!(service.verify_token(&signed_in.token).unwrap().sub, registered.user.uid);
    }

    #[test]
    fn concurrent_registrations_for_one_address() {
        let service = service();
        let outcomes: Vec<Result<AuthSession, AuthError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| register(&service, "race@example.com", "secret1")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        for outcome in outcomes.iter().filter(|o| o.is_err()) {
            assert!(matches!(outcome, Err(AuthError::EmailAlreadyInUse)));
        }
    }

    #[test]
    fn password_rules_and_errors() {
        let service = service();
        assert!(matches!(register(&service, "x@example.com", "12345"), Err(AuthError::WeakPassword)));
        assert!(matches!(register(&service, "not-an-address", "secret1"), Err(AuthError::InvalidEmail)));

        register(&service, "x@example.com", "secret1").unwrap();
        assert!(matches!(
            register(&service, "x@example.com", "secret2"),
            Err(AuthError::EmailAlreadyInUse)
        ));

        let wrong = service.sign_in(&LoginRequest {
            email: "x@example.com".into(),
            password: "nope123".into(),
        });
        assert!(matches!(wrong, Err(AuthError::WrongPassword)));

        let missing = service.sign_in(&LoginRequest {
            email: "y@example.com".into(),
            password: "secret1".into(),
        });
        assert!(matches!(missing, Err(AuthError::UserNotFound)));
    }

    #[test]
    fn phone_flow_signs_in_and_is_single_use() {
        let sender = Arc::new(MemoryCodeSender::new());
        let service = service_with(sender.clone());

        let ticket = service.issue_challenge().unwrap();
        let handle = service
            .request_phone_code(&PhoneCodeRequest {
                phone_number: "+15550001111".into(),
                challenge: ticket.solve(),
            })
            .unwrap();
        let code = sender.last_code_for("+15550001111").unwrap();
        assert_eq!(code.len(), 6);

        let confirm = PhoneConfirmRequest {
            verification_id: handle.verification_id.clone(),
            code,
        };
        let session = service.confirm_phone_code(&confirm).unwrap();
        assert_eq!(session.user.phone_number.as_deref(), Some("+15550001111"));

        assert!(matches!(
            service.confirm_phone_code(&confirm),
            Err(AuthError::MissingVerification)
        ));
    }

    #[test]
    fn challenge_must_be_solved_and_fresh() {
        let service = service();
        let ticket = service.issue_challenge().unwrap();
        let solution = ticket.solve();

        let bogus = PhoneCodeRequest {
            phone_number: "+15550001111".into(),
            challenge: ChallengeSolution {
                challenge_id: "unknown".into(),
                counter: 0,
            },
        };
        assert!(matches!(service.request_phone_code(&bogus), Err(AuthError::ChallengeFailed)));

        let bad_number = PhoneCodeRequest {
            phone_number: "555".into(),
            challenge: solution.clone(),
        };
        assert!(matches!(
            service.request_phone_code(&bad_number),
            Err(AuthError::InvalidPhoneNumber)
        ));

        // the challenge was consumed by the previous attempt
        let reused = PhoneCodeRequest {
            phone_number: "+15550001111".into(),
            challenge: solution,
        };
        assert!(matches!(service.request_phone_code(&reused), Err(AuthError::ChallengeFailed)));
    }

    #[test]
    fn wrong_codes_exhaust_the_verification() {
        let sender = Arc::new(MemoryCodeSender::new());
        let service = service_with(sender.clone());
        let ticket = service.issue_challenge().unwrap();
        let handle = service
            .request_phone_code(&PhoneCodeRequest {
                phone_number: "+15550002222".into(),
                challenge: ticket.solve(),
            })
            .unwrap();
        let code = sender.last_code_for("+15550002222").unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..5 {
            let result = service.confirm_phone_code(&PhoneConfirmRequest {
                verification_id: handle.verification_id.clone(),
                code: wrong.into(),
            });
            assert!(matches!(result, Err(AuthError::InvalidVerificationCode)));
        }

        let late = service.confirm_phone_code(&PhoneConfirmRequest {
            verification_id: handle.verification_id,
            code,
        });
        assert!(matches!(late, Err(AuthError::MissingVerification)));
    }

    fn id_token(issuer: &str, secret: &str, subject: &str, email: &str) -> String {
        let claims = FederatedClaims {
            iss: issuer.into(),
            sub: subject.into(),
            exp: (Utc::now() + Duration::hours(1)).timestamp() as usize,
            email: Some(email.into()),
            name: Some("Fed User".into()),
            picture: None,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn federated_sign_in_links_existing_address() {
        let service = service();
        let registered = register(&service, "fed@example.com", "secret1").unwrap();

        let credential = FederatedCredential {
            provider: "google".into(),
            id_token: id_token("google", "google-secret", "g-1", "fed@example.com"),
        };
        let first = service.sign_in_federated(&credential).unwrap();
        assert_eq!(first.user.uid, registered.user.uid);

        let again = service.sign_in_federated(&credential).unwrap();
        assert_eq!(again.user.uid, registered.user.uid);
    }

    #[test]
    fn federated_sign_in_rejects_foreign_tokens() {
        let service = service();
        let forged = FederatedCredential {
            provider: "google".into(),
            id_token: id_token("google", "other-secret", "g-1", "a@example.com"),
        };
        assert!(matches!(service.sign_in_federated(&forged), Err(AuthError::InvalidCredential)));

        let unknown = FederatedCredential {
            provider: "github".into(),
            id_token: id_token("github", "google-secret", "g-1", "a@example.com"),
        };
        assert!(matches!(service.sign_in_federated(&unknown), Err(AuthError::InvalidCredential)));
    }

    #[test]
    fn profile_update_is_visible_through_user() {
        let service = service();
        let session = register(&service, "p@example.com", "secret1").unwrap();
        let updated = service
            .update_profile(
                &session.user.uid,
                &ProfileUpdate {
                    display_name: Some("Pat".into()),
                    photo_url: None,
                },
            )
            .unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Pat"));
        assert_eq!(service.user(&session.user.uid).unwrap(), updated);
    }

    #[test]
    fn e164_numbers() {
        assert!(is_e164("+15550001111"));
        assert!(!is_e164("15550001111"));
        assert!(!is_e164("+1555"));
        assert!(!is_e164("+1555000111a"));
    }
}
