use std::sync::Arc;

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use tracing::{info, warn};

use crate::engine::session::SessionError;
use crate::models::driver::DriverProfile;
use crate::store::DataStore;

/// Black-box check of a password against the stored hash.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Verifies PHC-formatted argon2 hashes. Anything that does not parse as a
/// PHC string is rejected.
#[derive(Debug, Default, Clone)]
pub struct Argon2Verifier;

impl CredentialVerifier for Argon2Verifier {
    fn verify(&self, password: &str, hash: &str) -> bool {
        if password.is_empty() {
            return false;
        }

        match PasswordHash::new(hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(err) => {
                warn!(error = %err, "stored password is not a valid hash");
                false
            }
        }
    }
}

/// Verifies the bcrypt hashes the hosted backend stores (`$2a$`, `$2b$`,
/// `$2y$`). Other formats are rejected without attempting a comparison.
#[derive(Debug, Default, Clone)]
pub struct BcryptVerifier;

impl CredentialVerifier for BcryptVerifier {
    fn verify(&self, password: &str, hash: &str) -> bool {
        if password.is_empty() || !hash.starts_with("$2") {
            return false;
        }

        match bcrypt::verify(password, hash) {
            Ok(matches) => matches,
            Err(err) => {
                warn!(error = %err, "stored password is not a valid bcrypt hash");
                false
            }
        }
    }
}

/// Picks the verifier from the hash prefix: bcrypt for `$2`, argon2 for
/// `$argon2`. Plaintext and unknown formats never match.
#[derive(Debug, Default, Clone)]
pub struct StoredHashVerifier;

impl CredentialVerifier for StoredHashVerifier {
    fn verify(&self, password: &str, hash: &str) -> bool {
        if hash.starts_with("$2") {
            BcryptVerifier.verify(password, hash)
        } else if hash.starts_with("$argon2") {
            Argon2Verifier.verify(password, hash)
        } else {
            warn!("stored password has an unsupported hash format");
            false
        }
    }
}

/// Looks up an active driver and checks the password. Unknown usernames and
/// wrong passwords are indistinguishable to the caller.
pub async fn authenticate(
    store: &Arc<dyn DataStore>,
    verifier: &Arc<dyn CredentialVerifier>,
    username: &str,
    password: &str,
) -> Result<DriverProfile, SessionError> {
    let username = username.trim();
    if username.is_empty() || password.trim().is_empty() {
        return Err(SessionError::MissingCredentials);
    }

    let Some(record) = store.find_driver_by_username(username).await? else {
        warn!(username, "login rejected: unknown or inactive driver");
        return Err(SessionError::InvalidCredentials);
    };

    if !verifier.verify(password, &record.password) {
        warn!(username, "login rejected: wrong password");
        return Err(SessionError::InvalidCredentials);
    }

    info!(driver_id = record.id, "driver authenticated");
    Ok(DriverProfile::from(record))
}

#[cfg(test)]
mod tests {
    use argon2::password_hash::{PasswordHasher, SaltString};

    use super::*;
    use crate::models::driver::DriverRecord;
    use crate::store::MemoryStore;

    fn hash(password: &str) -> String {
        let salt = SaltString::from_b64("YWJjZGVmZ2hpamtsbW5vcA").unwrap();
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn store_with(active: bool) -> Arc<dyn DataStore> {
        let store = MemoryStore::new(8);
        store.insert_driver(DriverRecord {
            id: 7,
            username: "pedro".to_string(),
            name: "Pedro".to_string(),
            phone: None,
            email: None,
            active,
            company_id: Some(1),
            password: hash("secreto"),
        });
        Arc::new(store)
    }

    #[test]
    fn argon2_verifier_accepts_matching_password() {
        let stored = hash("secreto");
        assert!(Argon2Verifier.verify("secreto", &stored));
        assert!(!Argon2Verifier.verify("otro", &stored));
        assert!(!Argon2Verifier.verify("secreto", "plaintext"));
    }

    #[test]
    fn bcrypt_verifier_accepts_backend_hashes() {
        let stored = bcrypt::hash("secreto", 4).unwrap();
        assert!(stored.starts_with("$2b$"));
        assert!(BcryptVerifier.verify("secreto", &stored));
        assert!(!BcryptVerifier.verify("otro", &stored));
        assert!(!BcryptVerifier.verify("secreto", "secreto"));
        assert!(!Argon2Verifier.verify("secreto", &stored));
    }

    #[test]
    fn stored_hash_verifier_dispatches_on_prefix() {
        let bcrypt_hash = bcrypt::hash("secreto", 4).unwrap();
        assert!(StoredHashVerifier.verify("secreto", &bcrypt_hash));
        assert!(StoredHashVerifier.verify("secreto", &hash("secreto")));
        assert!(!StoredHashVerifier.verify("secreto", "secreto"));
        assert!(!StoredHashVerifier.verify("otro", &bcrypt_hash));
    }

    #[tokio::test]
    async fn authenticates_driver_with_bcrypt_hash() {
        let store = MemoryStore::new(8);
        store.insert_driver(DriverRecord {
            id: 9,
            username: "ana".to_string(),
            name: "Ana".to_string(),
            phone: None,
            email: None,
            active: true,
            company_id: Some(1),
            password: bcrypt::hash("clave", 4).unwrap(),
        });
        let store: Arc<dyn DataStore> = Arc::new(store);
        let verifier: Arc<dyn CredentialVerifier> = Arc::new(StoredHashVerifier);

        let profile = authenticate(&store, &verifier, "ana", "clave").await.unwrap();
        assert_eq!(profile.id, 9);

        let wrong = authenticate(&store, &verifier, "ana", "otra").await;
        assert!(matches!(wrong, Err(SessionError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn authenticates_active_driver() {
        let verifier: Arc<dyn CredentialVerifier> = Arc::new(Argon2Verifier);
        let profile = authenticate(&store_with(true), &verifier, " pedro ", "secreto")
            .await
            .unwrap();
        assert_eq!(profile.id, 7);
        assert_eq!(profile.company_id, Some(1));
    }

    #[tokio::test]
    async fn inactive_driver_cannot_log_in() {
        let verifier: Arc<dyn CredentialVerifier> = Arc::new(Argon2Verifier);
        let result = authenticate(&store_with(false), &verifier, "pedro", "secreto").await;
        assert!(matches!(result, Err(SessionError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn blank_credentials_are_rejected_before_lookup() {
        let verifier: Arc<dyn CredentialVerifier> = Arc::new(Argon2Verifier);
        let result = authenticate(&store_with(true), &verifier, "  ", "secreto").await;
        assert!(matches!(result, Err(SessionError::MissingCredentials)));
    }
}
