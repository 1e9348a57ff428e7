use crate::error::{Result, TurnError};
use crate::message::{nonce, realm, StunAttributes};
use log::debug;
use std::sync::{Mutex, MutexGuard, PoisonError};
use stun_rs::attributes::stun::{MessageIntegrity, Nonce, Realm, UserName};
use stun_rs::{Algorithm, AlgorithmId, HMACKey, StunMessage};

pub(crate) const ERROR_CODE_UNAUTHENTICATED: u16 = 401;
pub(crate) const ERROR_CODE_STALE_NONCE: u16 = 438;

/// Username and password for the long-term credential mechanism.
#[derive(Debug, Clone)]
pub struct Credentials {
    user_name: UserName,
    password: String,
}

impl Credentials {
    pub fn new<U, P>(user_name: U, password: P) -> Result<Self>
    where
        U: AsRef<str>,
        P: Into<String>,
    {
        Ok(Self {
            user_name: UserName::new(user_name.as_ref())?,
            password: password.into(),
        })
    }

    pub fn user_name(&self) -> &str {
        self.user_name.as_str()
    }
}

#[derive(Debug, Clone)]
struct Session {
    realm: Realm,
    nonce: Nonce,
    key: HMACKey,
}

#[derive(Debug, Default)]
struct AuthState {
    session: Option<Session>,
    // Bumped every time the realm or nonce changes.
    generation: u64,
}

/// Long-term credential state shared by every request of a client and its
/// allocation.
///
/// Requests are signed with a snapshot of the current session and remember
/// the generation they were signed with. When the server rejects one with
/// 401 or 438, the session is only updated if its generation is still the
/// one the request saw; a concurrent request that already refreshed it wins
/// and the others simply re-sign with the new nonce.
#[derive(Debug)]
pub(crate) struct AuthContext {
    credentials: Option<Credentials>,
    state: Mutex<AuthState>,
}

impl AuthContext {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            state: Mutex::new(AuthState::default()),
        }
    }

    #[cfg(test)]
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    #[cfg(test)]
    pub fn is_authenticated(&self) -> bool {
        self.lock().session.is_some()
    }

    // Before the server has presented a realm and nonce, the request is sent
    // as if there were no authentication at all. Afterwards it carries
    // USERNAME, REALM, NONCE and MESSAGE-INTEGRITY with the cached values.
    /// Signs `attributes` with the current session, if any, and returns the
    /// generation used.
    pub fn prepare_request(&self, attributes: &mut StunAttributes) -> u64 {
        remove_auth_and_integrity_attrs(attributes);

        let state = self.lock();
        if let (Some(credentials), Some(session)) = (&self.credentials, &state.session) {
            attributes.add(credentials.user_name.clone());
            attributes.add(session.realm.clone());
            attributes.add(session.nonce.clone());
            attributes.add(MessageIntegrity::new(session.key.clone()));
        }
        state.generation
    }

    /// Handles a 401 (Unauthenticated) error response to a request signed
    /// with generation `seen`.
    pub fn unauthenticated(&self, seen: u64, msg: &StunMessage) -> Result<()> {
        let Some(credentials) = &self.credentials else {
            debug!(
                "[{:?}] Server requires authentication, no credentials configured",
                msg.transaction_id()
            );
            return Err(TurnError::AuthRequired);
        };
        let realm = realm(msg)
            .ok_or_else(|| TurnError::Protocol("401 response without REALM".to_string()))?;
        let nonce = nonce(msg)
            .ok_or_else(|| TurnError::Protocol("401 response without NONCE".to_string()))?;

        let mut state = self.lock();
        if state.generation != seen {
            debug!(
                "[{:?}] Credentials already updated to generation {}",
                msg.transaction_id(),
                state.generation
            );
            return Ok(());
        }

        let key = long_term_key(credentials, &realm)?;
        debug!(
            "[{:?}] Using long-term credentials for realm {:?}",
            msg.transaction_id(),
            realm.as_str()
        );
        state.session = Some(Session { realm, nonce, key });
        state.generation += 1;
        Ok(())
    }

    /// Handles a 438 (Stale Nonce) error response to a request signed with
    /// generation `seen`.
    pub fn stale_nonce(&self, seen: u64, msg: &StunMessage) -> Result<()> {
        let nonce = nonce(msg)
            .ok_or_else(|| TurnError::Protocol("438 response without NONCE".to_string()))?;

        let mut state = self.lock();
        if state.generation != seen {
            debug!(
                "[{:?}] Nonce already refreshed to generation {}",
                msg.transaction_id(),
                state.generation
            );
            return Ok(());
        }

        if state.session.is_none() {
            drop(state);
            // Never authenticated, the server is asking for credentials
            return self.unauthenticated(seen, msg);
        }

        if let Some(session) = state.session.as_mut() {
            if let (Some(realm), Some(credentials)) = (realm(msg), &self.credentials) {
                if realm.as_str() != session.realm.as_str() {
                    session.key = long_term_key(credentials, &realm)?;
                    session.realm = realm;
                }
            }
            session.nonce = nonce;
        }
        state.generation += 1;
        debug!(
            "[{:?}] Stale nonce, credentials refreshed to generation {}",
            msg.transaction_id(),
            state.generation
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn long_term_key(credentials: &Credentials, realm: &Realm) -> Result<HMACKey> {
    Ok(HMACKey::new_long_term(
        credentials.user_name.as_str(),
        realm.as_str(),
        credentials.password.as_str(),
        Algorithm::from(AlgorithmId::MD5),
    )?)
}

pub(crate) fn remove_auth_and_integrity_attrs(attributes: &mut StunAttributes) {
    attributes.remove::<UserName>();
    attributes.remove::<Realm>();
    attributes.remove::<Nonce>();
    attributes.remove::<MessageIntegrity>();
}
