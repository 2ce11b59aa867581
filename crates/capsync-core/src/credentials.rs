// ── Network credentials ──
//
// An ordered list of (network, secret) pairs loaded once per session, and
// a claim table guaranteeing that no two devices hold the same network at
// the same time. Every claim operation runs under one lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use secrecy::SecretString;
use tracing::{debug, warn};

use crate::model::DeviceId;

/// One wifi network a trigger box can join.
#[derive(Clone)]
pub struct Credential {
    pub name: String,
    pub secret: SecretString,
}

impl Credential {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    /// Parse a `name,secret` pair: split on the first comma, both sides
    /// trimmed. The name must be non-empty; the secret may be empty (open
    /// networks).
    pub fn parse(line: &str) -> Option<Self> {
        let (name, secret) = line.split_once(',')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, secret.trim()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Parse a credentials document: one `name,secret` pair per line.
///
/// Blank lines and `#` comments are ignored; malformed lines are skipped
/// with a warning that names the line number, never its content.
pub fn parse_credentials(text: &str) -> Vec<Credential> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match Credential::parse(line) {
            Some(c) => out.push(c),
            None => warn!(line = idx + 1, "skipping malformed credential line"),
        }
    }
    out
}

// ── CredentialPool ──────────────────────────────────────────────────

/// Ordered credentials plus the live claim table.
#[derive(Debug, Default)]
pub struct CredentialPool {
    entries: Vec<Credential>,
    claims: Mutex<HashMap<String, DeviceId>>,
}

impl CredentialPool {
    pub fn new(entries: Vec<Credential>) -> Self {
        Self {
            entries,
            claims: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceId>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Select and claim a credential for `device` in one atomic step.
    ///
    /// Picks the first entry neither claimed by another device nor already
    /// in `tried`. When none is left, falls back to the entry at
    /// `default_index` (modulo the list length), but only if no other
    /// device holds it: the first claim wins.
    pub fn claim_next(
        &self,
        device: &DeviceId,
        tried: &HashSet<String>,
        default_index: usize,
    ) -> Option<Credential> {
        if self.entries.is_empty() {
            return None;
        }
        let mut claims = self.lock();
        let free = |name: &str, claims: &HashMap<String, DeviceId>| {
            claims.get(name).is_none_or(|holder| holder == device)
        };

        let held: &HashMap<String, DeviceId> = &claims;
        let picked = self
            .entries
            .iter()
            .find(|c| !tried.contains(&c.name) && free(&c.name, held))
            .or_else(|| {
                let fallback = self.entries.get(default_index % self.entries.len())?;
                free(&fallback.name, held).then_some(fallback)
            })?;

        claims.insert(picked.name.clone(), device.clone());
        debug!(%device, network = %picked.name, "credential claimed");
        Some(picked.clone())
    }

    /// Claim a specific network name (used for operator-supplied overrides).
    pub fn try_claim(&self, name: &str, device: &DeviceId) -> bool {
        let mut claims = self.lock();
        match claims.get(name) {
            Some(holder) if holder != device => false,
            _ => {
                claims.insert(name.to_owned(), device.clone());
                true
            }
        }
    }

    /// Release `name` if `device` holds it. Idempotent.
    pub fn release(&self, name: &str, device: &DeviceId) -> bool {
        let mut claims = self.lock();
        if claims.get(name) == Some(device) {
            claims.remove(name);
            debug!(%device, network = %name, "credential released");
            return true;
        }
        false
    }

    /// Release every claim held by `device`.
    pub fn release_device(&self, device: &DeviceId) -> Vec<String> {
        let mut claims = self.lock();
        let held: Vec<String> = claims
            .iter()
            .filter(|(_, holder)| *holder == device)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &held {
            claims.remove(name);
        }
        held
    }

    pub fn holder(&self, name: &str) -> Option<DeviceId> {
        self.lock().get(name).cloned()
    }

    /// Current claims as (network, device), sorted by network.
    pub fn claims(&self) -> Vec<(String, DeviceId)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(n, d)| (n.clone(), d.clone()))
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    fn pool() -> CredentialPool {
        CredentialPool::new(vec![Credential::new("net1", "p1"), Credential::new("net2", "p2")])
    }

    #[test]
    fn parses_document() {
        let creds = parse_credentials(
            "# lab networks\n\nnet1, p1\n  net2 ,pa,ss,word \nmalformed\n,nameless\nopen,\n",
        );
        let names: Vec<_> = creds.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["net1", "net2", "open"]);
        assert_eq!(creds[1].secret.expose_secret(), "pa,ss,word");
        assert_eq!(creds[2].secret.expose_secret(), "");
    }

    #[test]
    fn debug_hides_secret() {
        let c = Credential::new("net1", "hunter2");
        assert!(!format!("{c:?}").contains("hunter2"));
    }

    #[test]
    fn claims_are_exclusive() {
        let pool = pool();
        let a = DeviceId::from("A");
        let b = DeviceId::from("B");
        let none = HashSet::new();

        assert_eq!(pool.claim_next(&a, &none, 0).unwrap().name, "net1");
        assert_eq!(pool.claim_next(&b, &none, 1).unwrap().name, "net2");
        assert_eq!(pool.holder("net1"), Some(a.clone()));
        assert_eq!(pool.holder("net2"), Some(b.clone()));
    }

    #[test]
    fn released_network_becomes_selectable() {
        let pool = pool();
        let a = DeviceId::from("A");
        let b = DeviceId::from("B");
        let none = HashSet::new();

        pool.claim_next(&a, &none, 0).unwrap();
        let tried: HashSet<String> = ["net2".to_owned()].into();
        // net1 held by A, net2 tried, fallback net1 is claimed: nothing.
        assert!(pool.claim_next(&b, &tried, 0).is_none());

        pool.release_device(&a);
        assert_eq!(pool.claim_next(&b, &tried, 0).unwrap().name, "net1");
    }

    #[test]
    fn fallback_ignores_tried_but_respects_claims() {
        let pool = pool();
        let a = DeviceId::from("A");
        let tried: HashSet<String> = ["net1".to_owned(), "net2".to_owned()].into();
        assert_eq!(pool.claim_next(&a, &tried, 3).unwrap().name, "net2");
    }

    #[test]
    fn release_only_by_holder() {
        let pool = pool();
        let a = DeviceId::from("A");
        let b = DeviceId::from("B");
        assert!(pool.try_claim("guest", &a));
        assert!(!pool.try_claim("guest", &b));
        assert!(!pool.release("guest", &b));
        assert!(pool.release("guest", &a));
        assert!(!pool.release("guest", &a));
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let pool = CredentialPool::default();
        assert!(pool.claim_next(&DeviceId::from("A"), &HashSet::new(), 0).is_none());
    }
}
