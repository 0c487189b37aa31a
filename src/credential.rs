//! Device credentials.
//!
//! The device secret is exchanged for a short-lived bearer token through a
//! `CredentialProvider`. `CredentialManager` refreshes the token ahead of
//! expiry and keeps it sealed on disk (ChaCha20-Poly1305 under a key derived
//! from the device secret) so a restart does not need a fresh exchange.
//!
//! A revoked secret is terminal: the manager enters `NeedsProvisioning`,
//! removes the sealed token and refuses every further request.

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{AgentError, AgentResult};
use crate::health::{Counter, Health};
use crate::sync::TransportError;
use crate::Clock;

const SEAL_MAGIC: &[u8; 4] = b"EACR";
const SEAL_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_DOMAIN: &[u8] = b"edge-agent/credential/v1";

/// Short-lived bearer token. Zeroized on drop; never logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    pub token: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl Credential {
    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Provisioned device secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DeviceSecret(String);

impl DeviceSecret {
    pub fn new(secret: String) -> Self {
        Self(secret)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceSecret(<redacted>)")
    }
}

/// Credential interface: exchange the device secret for a bearer token.
pub trait CredentialProvider: Send + Sync {
    fn exchange(&self, device_id: &str, secret: &DeviceSecret) -> Result<Credential, TransportError>;
}

enum State {
    Empty,
    Active(Credential),
    NeedsProvisioning,
}

pub struct CredentialManager {
    device_id: String,
    secret: DeviceSecret,
    provider: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    health: Arc<Health>,
    refresh_margin_ms: u64,
    vault: Option<CredentialVault>,
    state: Mutex<State>,
}

impl CredentialManager {
    pub fn new(
        device_id: &str,
        secret: DeviceSecret,
        provider: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
        health: Arc<Health>,
        refresh_margin_ms: u64,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            secret,
            provider,
            clock,
            health,
            refresh_margin_ms,
            vault: None,
            state: Mutex::new(State::Empty),
        }
    }

    /// Persist tokens sealed at `path`, loading a still-valid one now.
    pub fn with_sealed_store(mut self, path: &Path) -> Self {
        let vault = CredentialVault::new(path, &self.device_id, &self.secret);
        match vault.unseal() {
            Ok(Some(cred)) if cred.is_valid_at(self.clock.now_ms()) => {
                log::info!(
                    "credential: restored sealed token (expires_at={})",
                    cred.expires_at
                );
                self.state = Mutex::new(State::Active(cred));
            }
            Ok(_) => {}
            Err(err) => {
                self.health.incr(Counter::StorageCorruption);
                log::warn!("credential: discarding unreadable sealed token: {:#}", err);
                if let Err(err) = vault.remove() {
                    self.health.incr(Counter::StorageErrors);
                    log::warn!("credential: failed to remove sealed token: {:#}", err);
                }
            }
        }
        self.vault = Some(vault);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_revoked(&self) -> bool {
        matches!(*self.lock(), State::NeedsProvisioning)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the cached token so the next call re-authenticates.
    pub fn invalidate(&self) {
        let mut state = self.lock();
        if matches!(*state, State::Active(_)) {
            *state = State::Empty;
        }
    }

    /// A bearer token valid for at least the refresh margin, when possible.
    ///
    /// An early refresh that fails keeps the current token while it is still
    /// valid. Revocation is terminal and surfaces as `CredentialRevoked`.
    pub fn bearer(&self) -> AgentResult<String> {
        let mut state = self.lock();
        let now = self.clock.now_ms();
        let current = match &*state {
            State::NeedsProvisioning => return Err(AgentError::CredentialRevoked),
            State::Active(cred) if now.saturating_add(self.refresh_margin_ms) < cred.expires_at => {
                return Ok(cred.token.clone());
            }
            State::Active(cred) if cred.is_valid_at(now) => Some(cred.token.clone()),
            _ => None,
        };

        match self.provider.exchange(&self.device_id, &self.secret) {
            Ok(cred) if cred.is_valid_at(now) && !cred.token.is_empty() => {
                self.health.incr(Counter::CredentialRefreshes);
                log::info!("credential: refreshed (expires_at={})", cred.expires_at);
                if let Some(vault) = &self.vault {
                    if let Err(err) = vault.seal(&cred) {
                        self.health.incr(Counter::StorageErrors);
                        log::warn!("credential: failed to persist sealed token: {:#}", err);
                    }
                }
                let token = cred.token.clone();
                *state = State::Active(cred);
                Ok(token)
            }
            Ok(cred) => self.refresh_failed(
                &mut state,
                current,
                format!("issued token already expired (expires_at={})", cred.expires_at),
            ),
            Err(TransportError::Revoked) | Err(TransportError::Unauthorized) => {
                self.enter_provisioning(&mut state);
                Err(AgentError::CredentialRevoked)
            }
            Err(err) => self.refresh_failed(&mut state, current, err.to_string()),
        }
    }

    /// The backend reported the token revoked. Terminal until re-provisioned.
    pub fn revoke(&self) {
        let mut state = self.lock();
        self.enter_provisioning(&mut state);
    }

    fn enter_provisioning(&self, state: &mut State) {
        if matches!(state, State::NeedsProvisioning) {
            return;
        }
        log::error!(
            "credential: device {} credential revoked; re-provisioning required",
            self.device_id
        );
        *state = State::NeedsProvisioning;
        self.health.incr(Counter::CredentialRevoked);
        if let Some(vault) = &self.vault {
            if let Err(err) = vault.remove() {
                self.health.incr(Counter::StorageErrors);
                log::warn!("credential: failed to remove sealed token: {:#}", err);
            }
        }
    }

    fn refresh_failed(
        &self,
        state: &mut State,
        current: Option<String>,
        detail: String,
    ) -> AgentResult<String> {
        self.health.incr(Counter::CredentialRefreshFailures);
        match current {
            Some(token) => {
                log::warn!("credential: early refresh failed, keeping current token: {}", detail);
                Ok(token)
            }
            None => {
                log::warn!("credential: refresh failed: {}", detail);
                *state = State::Empty;
                Err(AgentError::CredentialRefresh(detail))
            }
        }
    }
}

/// Sealed on-disk token: `EACR | version | nonce | ciphertext | tag`.
struct CredentialVault {
    path: PathBuf,
    key: Zeroizing<[u8; 32]>,
    aad: Vec<u8>,
}

impl CredentialVault {
    fn new(path: &Path, device_id: &str, secret: &DeviceSecret) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update([0u8]);
        hasher.update(device_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(secret.expose().as_bytes());
        let key = Zeroizing::new(hasher.finalize().into());
        Self {
            path: path.to_path_buf(),
            key,
            aad: device_id.as_bytes().to_vec(),
        }
    }

    fn seal(&self, cred: &Credential) -> Result<()> {
        let mut buffer = Zeroizing::new(serde_json::to_vec(cred)?);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &self.aad, buffer.as_mut_slice())
            .map_err(|_| anyhow!("credential encryption failed"))?;

        let mut out = Vec::with_capacity(5 + NONCE_LEN + buffer.len() + TAG_LEN);
        out.extend_from_slice(SEAL_MAGIC);
        out.push(SEAL_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&buffer);
        out.extend_from_slice(&tag);

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &out).with_context(|| format!("write {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&tmp, perms)?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }

    fn unseal(&self) -> Result<Option<Credential>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", self.path.display())),
        };
        let header = SEAL_MAGIC.len() + 1;
        if bytes.len() < header + NONCE_LEN + TAG_LEN {
            return Err(anyhow!("sealed credential truncated"));
        }
        if &bytes[..4] != SEAL_MAGIC || bytes[4] != SEAL_VERSION {
            return Err(anyhow!("sealed credential has unknown format"));
        }
        let nonce = &bytes[header..header + NONCE_LEN];
        let tag_offset = bytes.len() - TAG_LEN;
        let mut clear = Zeroizing::new(bytes[header + NONCE_LEN..tag_offset].to_vec());
        let tag = &bytes[tag_offset..];
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &self.aad,
                clear.as_mut_slice(),
                Tag::from_slice(tag),
            )
            .map_err(|_| anyhow!("sealed credential failed authentication"))?;
        let cred: Credential = serde_json::from_slice(&clear)?;
        Ok(Some(cred))
    }

    fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use std::collections::VecDeque;

    struct ScriptedProvider {
        answers: Mutex<VecDeque<Result<Credential, TransportError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedProvider {
        fn new(answers: Vec<Result<Credential, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl CredentialProvider for ScriptedProvider {
        fn exchange(&self, _device_id: &str, _secret: &DeviceSecret) -> Result<Credential, TransportError> {
            *self.calls.lock().unwrap() += 1;
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Timeout))
        }
    }

    fn cred(token: &str, issued_at: u64, expires_at: u64) -> Credential {
        Credential {
            token: token.to_string(),
            issued_at,
            expires_at,
        }
    }

    fn manager(provider: Arc<ScriptedProvider>, clock: Arc<ManualClock>) -> CredentialManager {
        counted_manager(provider, clock, Arc::new(Health::new()))
    }

    fn counted_manager(
        provider: Arc<ScriptedProvider>,
        clock: Arc<ManualClock>,
        health: Arc<Health>,
    ) -> CredentialManager {
        CredentialManager::new(
            "door-1",
            DeviceSecret::new("s3cret".to_string()),
            provider,
            clock,
            health,
            120_000,
        )
    }

    #[test]
    fn token_is_cached_until_refresh_margin() {
        let clock = ManualClock::new(0);
        let provider = ScriptedProvider::new(vec![
            Ok(cred("t1", 0, 600_000)),
            Ok(cred("t2", 480_000, 1_200_000)),
        ]);
        let m = manager(provider.clone(), clock.clone());
        assert_eq!(m.bearer().unwrap(), "t1");
        clock.set(400_000);
        assert_eq!(m.bearer().unwrap(), "t1");
        assert_eq!(provider.calls(), 1);
        clock.set(480_000);
        assert_eq!(m.bearer().unwrap(), "t2");
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn failed_early_refresh_keeps_valid_token() {
        let clock = ManualClock::new(0);
        let provider = ScriptedProvider::new(vec![
            Ok(cred("t1", 0, 600_000)),
            Err(TransportError::Server { status: 503 }),
        ]);
        let m = manager(provider, clock.clone());
        m.bearer().unwrap();
        clock.set(500_000);
        assert_eq!(m.bearer().unwrap(), "t1");
        clock.set(600_000);
        assert!(matches!(m.bearer(), Err(AgentError::CredentialRefresh(_))));
    }

    #[test]
    fn revocation_requires_reprovisioning() {
        let clock = ManualClock::new(0);
        let provider = ScriptedProvider::new(vec![
            Err(TransportError::Revoked),
            Ok(cred("never", 0, 600_000)),
        ]);
        let m = manager(provider.clone(), clock);
        assert!(matches!(m.bearer(), Err(AgentError::CredentialRevoked)));
        assert!(m.is_revoked());
        assert!(matches!(m.bearer(), Err(AgentError::CredentialRevoked)));
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn invalidate_forces_reauthentication() {
        let clock = ManualClock::new(0);
        let provider = ScriptedProvider::new(vec![
            Ok(cred("t1", 0, 600_000)),
            Ok(cred("t2", 0, 600_000)),
        ]);
        let m = manager(provider, clock);
        assert_eq!(m.bearer().unwrap(), "t1");
        m.invalidate();
        assert_eq!(m.bearer().unwrap(), "t2");
    }

    #[test]
    fn sealed_token_survives_restart_and_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.cred");
        let clock = ManualClock::new(0);
        let provider = ScriptedProvider::new(vec![Ok(cred("plain-token-value", 0, 600_000))]);
        let m = manager(provider, clock.clone()).with_sealed_store(&path);
        m.bearer().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..4], SEAL_MAGIC);
        assert!(!raw
            .windows(b"plain-token-value".len())
            .any(|w| w == b"plain-token-value"));

        let empty = ScriptedProvider::new(vec![]);
        let restarted = manager(empty.clone(), clock).with_sealed_store(&path);
        assert_eq!(restarted.bearer().unwrap(), "plain-token-value");
        assert_eq!(empty.calls(), 0);
    }

    #[test]
    fn sealed_token_from_other_secret_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.cred");
        let clock = ManualClock::new(0);
        let vault = CredentialVault::new(&path, "door-1", &DeviceSecret::new("old".to_string()));
        vault.seal(&cred("t-old", 0, 600_000)).unwrap();

        let provider = ScriptedProvider::new(vec![Ok(cred("t-new", 0, 600_000))]);
        let m = manager(provider, clock).with_sealed_store(&path);
        assert_eq!(m.bearer().unwrap(), "t-new");
    }

    #[test]
    fn refresh_failures_and_revocation_are_counted() {
        let clock = ManualClock::new(0);
        let health = Arc::new(Health::new());
        let provider = ScriptedProvider::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Revoked),
        ]);
        let m = counted_manager(provider, clock, health.clone());
        assert!(matches!(m.bearer(), Err(AgentError::CredentialRefresh(_))));
        assert_eq!(health.get(Counter::CredentialRefreshFailures), 1);

        assert!(matches!(m.bearer(), Err(AgentError::CredentialRevoked)));
        m.revoke();
        assert!(matches!(m.bearer(), Err(AgentError::CredentialRevoked)));
        assert_eq!(health.get(Counter::CredentialRevoked), 1);
    }

    #[test]
    fn unwritable_sealed_store_is_counted_and_token_still_served() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("agent.cred");
        let clock = ManualClock::new(0);
        let health = Arc::new(Health::new());
        let provider = ScriptedProvider::new(vec![Ok(cred("t1", 0, 600_000))]);
        let m = counted_manager(provider, clock, health.clone()).with_sealed_store(&path);
        assert_eq!(m.bearer().unwrap(), "t1");
        assert_eq!(health.get(Counter::StorageErrors), 1);
        assert!(!path.exists());
    }
}
