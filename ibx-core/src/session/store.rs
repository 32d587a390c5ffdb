// ibx-core/src/session/store.rs
use super::clock::Clock;
use crate::bundle::layout::BundleLayout;
use crate::crypto::context::{Decryptor, KeyContext};
use crate::error::{IbxError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const TOKEN_BYTES: usize = 32;

/// Decryption context of one unlocked backup, shared by reference only.
pub struct Unlocked {
    backup_id: String,
    layout: BundleLayout,
    ctx: KeyContext,
}

impl Unlocked {
    pub(crate) fn new(backup_id: String, layout: BundleLayout, ctx: KeyContext) -> Self {
        Self {
            backup_id,
            layout,
            ctx,
        }
    }

    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    pub(crate) fn context(&self) -> &KeyContext {
        &self.ctx
    }
}

struct Live {
    token: String,
    expires_at: Instant,
    unlocked: Arc<Unlocked>,
}

struct Issued {
    backup_id: String,
    expires_at: Instant,
}

/// In-memory session arena: one live context per backup id, tokens bound to it.
pub struct SessionStore {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    decryptor: Arc<dyn Decryptor>,
    contexts: DashMap<String, Live>,
    // Lock order: `contexts` before `tokens`; never hold a `tokens` guard
    // while touching `contexts`.
    tokens: DashMap<String, Issued>,
}

fn new_token() -> Result<String> {
    let mut raw = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut raw).map_err(|e| std::io::Error::other(format!("getrandom: {e}")))?;
    Ok(hex::encode(raw))
}

impl SessionStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>, decryptor: Arc<dyn Decryptor>) -> Self {
        Self {
            ttl,
            clock,
            decryptor,
            contexts: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Derives a context from the bundle's keybag and `password`, replacing any
    /// context already held for `backup_id` (whose tokens stop working).
    /// An `encrypted` bundle without a keybag is refused.
    pub fn unlock(
        &self,
        backup_id: &str,
        layout: &BundleLayout,
        encrypted: bool,
        password: &str,
    ) -> Result<String> {
        let keybag = layout.read_keybag()?;
        if encrypted && keybag.is_none() {
            warn!(backup_id, "encrypted bundle has no keybag");
            return Err(IbxError::format(format!(
                "{} missing for encrypted backup {backup_id}",
                layout.keybag_path().display()
            )));
        }
        let ctx = match self.decryptor.derive_context(keybag.as_deref(), password) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(backup_id, error = %e, "unlock failed");
                return Err(e);
            }
        };
        let expires_at = self.clock.now().checked_add(self.ttl).ok_or_else(|| {
            IbxError::Config(format!("session ttl of {}s is out of range", self.ttl.as_secs()))
        })?;
        let token = new_token()?;
        let live = Live {
            token: token.clone(),
            expires_at,
            unlocked: Arc::new(Unlocked::new(backup_id.to_string(), layout.clone(), ctx)),
        };

        let slot = self.contexts.entry(backup_id.to_string());
        self.tokens.insert(
            token.clone(),
            Issued {
                backup_id: backup_id.to_string(),
                expires_at,
            },
        );
        match slot {
            Entry::Occupied(mut slot) => {
                let old = std::mem::replace(slot.get_mut(), live);
                self.tokens.remove(&old.token);
                debug!(backup_id, "replaced live context");
            }
            Entry::Vacant(slot) => {
                slot.insert(live);
            }
        }
        info!(backup_id, ttl_secs = self.ttl.as_secs(), "backup unlocked");
        Ok(token)
    }

    /// Backup id the token is bound to. Never extends the expiry.
    pub fn validate(&self, token: &str) -> Result<String> {
        let issued = self.tokens.get(token).ok_or(IbxError::SessionUnknown)?;
        if self.clock.now() > issued.expires_at {
            return Err(IbxError::SessionExpired);
        }
        Ok(issued.backup_id.clone())
    }

    /// Context behind `token`, which must be bound to `backup_id`.
    pub fn authorize(&self, backup_id: &str, token: &str) -> Result<Arc<Unlocked>> {
        let bound = self.validate(token)?;
        if bound != backup_id {
            return Err(IbxError::SessionRequired(backup_id.to_string()));
        }
        let live = self
            .contexts
            .get(backup_id)
            .ok_or(IbxError::SessionUnknown)?;
        if live.token != token {
            return Err(IbxError::SessionUnknown);
        }
        Ok(live.unlocked.clone())
    }

    /// Live context for `backup_id`, regardless of which token opened it.
    pub fn context_for(&self, backup_id: &str) -> Result<Arc<Unlocked>> {
        match self.contexts.get(backup_id) {
            Some(live) if self.clock.now() <= live.expires_at => Ok(live.unlocked.clone()),
            _ => Err(IbxError::SessionRequired(backup_id.to_string())),
        }
    }

    pub fn is_live(&self, backup_id: &str) -> bool {
        self.context_for(backup_id).is_ok()
    }

    /// Idempotent: unknown, expired, or replaced tokens are accepted silently.
    pub fn lock(&self, token: &str) {
        let Some((_, issued)) = self.tokens.remove(token) else {
            return;
        };
        let removed = self
            .contexts
            .remove_if(&issued.backup_id, |_, live| live.token == token);
        if removed.is_some() {
            info!(backup_id = %issued.backup_id, "backup locked");
        }
    }

    pub fn revoke_backup(&self, backup_id: &str) {
        if let Some((_, live)) = self.contexts.remove(backup_id) {
            self.tokens.remove(&live.token);
            info!(backup_id, "session revoked");
        }
    }

    /// Drops expired contexts and forgets their tokens. Returns how many
    /// contexts were released.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.contexts.len();
        self.contexts.retain(|_, live| now <= live.expires_at);
        self.tokens.retain(|_, issued| now <= issued.expires_at);
        let released = before.saturating_sub(self.contexts.len());
        if released > 0 {
            debug!(released, "expired sessions purged");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::writer::{BundleWriter, WriteOptions};
    use crate::crypto::context::SealedBundleCrypto;
    use crate::crypto::keybag::KdfParams;
    use crate::session::clock::ManualClock;

    fn setup(ttl: u64) -> (tempfile::TempDir, BundleLayout, Arc<ManualClock>, SessionStore) {
        let tmp = tempfile::tempdir().unwrap();
        let opts = WriteOptions {
            password: Some("correct-pw".into()),
            kdf: KdfParams::fast(),
            ..WriteOptions::default()
        };
        let layout = BundleWriter::create(&tmp.path().join("B1"), opts)
            .unwrap()
            .finish()
            .unwrap();
        let clock = Arc::new(ManualClock::new());
        let store = SessionStore::new(
            Duration::from_secs(ttl),
            clock.clone(),
            Arc::new(SealedBundleCrypto),
        );
        (tmp, layout, clock, store)
    }

    #[test]
    fn token_expires_without_sliding() {
        let (_tmp, layout, clock, store) = setup(60);
        let token = store.unlock("B1", &layout, true, "correct-pw").unwrap();
        assert_eq!(store.validate(&token).unwrap(), "B1");

        clock.advance(Duration::from_secs(59));
        assert!(store.validate(&token).is_ok());
        clock.advance(Duration::from_secs(2));
        assert!(matches!(store.validate(&token), Err(IbxError::SessionExpired)));
        assert!(matches!(
            store.context_for("B1"),
            Err(IbxError::SessionRequired(_))
        ));
    }

    #[test]
    fn wrong_password_leaves_state_untouched() {
        let (_tmp, layout, _clock, store) = setup(60);
        let token = store.unlock("B1", &layout, true, "correct-pw").unwrap();
        assert!(matches!(
            store.unlock("B1", &layout, true, "nope"),
            Err(IbxError::InvalidCredentials)
        ));
        assert!(store.authorize("B1", &token).is_ok());
    }

    #[test]
    fn second_unlock_replaces_context_and_token() {
        let (_tmp, layout, _clock, store) = setup(60);
        let first = store.unlock("B1", &layout, true, "correct-pw").unwrap();
        let second = store.unlock("B1", &layout, true, "correct-pw").unwrap();
        assert_ne!(first, second);
        assert!(matches!(store.validate(&first), Err(IbxError::SessionUnknown)));
        assert!(store.authorize("B1", &second).is_ok());
        assert!(matches!(
            store.authorize("B2", &second),
            Err(IbxError::SessionRequired(_))
        ));
    }

    #[test]
    fn lock_is_idempotent() {
        let (_tmp, layout, _clock, store) = setup(60);
        let token = store.unlock("B1", &layout, true, "correct-pw").unwrap();
        store.lock(&token);
        store.lock(&token);
        store.lock("never-issued");
        assert!(!store.is_live("B1"));
        assert!(matches!(store.validate(&token), Err(IbxError::SessionUnknown)));
    }

    #[test]
    fn encrypted_bundle_without_keybag_is_refused() {
        let (_tmp, layout, _clock, store) = setup(60);
        std::fs::remove_file(layout.keybag_path()).unwrap();
        let err = store.unlock("B1", &layout, true, "anything").unwrap_err();
        assert!(matches!(err, IbxError::Format(_)), "{err}");
        assert!(!store.is_live("B1"));
    }

    #[test]
    fn unrepresentable_expiry_is_a_config_error() {
        let (_tmp, layout, _clock, _store) = setup(60);
        let store = SessionStore::new(
            Duration::from_secs(u64::MAX),
            Arc::new(ManualClock::new()),
            Arc::new(SealedBundleCrypto),
        );
        let err = store.unlock("B1", &layout, true, "correct-pw").unwrap_err();
        assert!(matches!(err, IbxError::Config(_)), "{err}");
        assert!(!store.is_live("B1"));
    }

    #[test]
    fn purge_releases_only_expired_contexts() {
        let (_tmp, layout, clock, store) = setup(10);
        store.unlock("B1", &layout, true, "correct-pw").unwrap();
        assert_eq!(store.purge_expired(), 0);
        clock.advance(Duration::from_secs(11));
        assert_eq!(store.purge_expired(), 1);
        assert!(!store.is_live("B1"));
    }
}
