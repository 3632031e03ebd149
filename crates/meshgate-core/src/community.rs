//! Named communities, their edge tables, access control and the auto-IP
//! allocator.
//!
//! The registry is the single source of truth for which communities exist,
//! who may join them, and which keys seal their headers. It also implements
//! [`KeyResolver`] so the wire codec can stay stateless.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoProvider, HeaderCipher, USER_KEY_SIZE};
use crate::peer::PeerTable;
use crate::wire::{ClearPolicy, CommunityName, HeaderAuth, KeyCandidate, KeyResolver, NakReason};

// ── Header encryption modes ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderEncryption {
    None,
    StaticKey,
    UserPassword,
}

// ── Auto-IP subnets ───────────────────────────────────────────────────────────

/// An IPv4 subnet from the auto-IP pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpSubnet {
    pub net: Ipv4Addr,
    pub bitlen: u8,
}

impl IpSubnet {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = mask_of(self.bitlen);
        u32::from(ip) & mask == u32::from(self.net) & mask
    }

    /// Deterministic host address for a hashed MAC. Skips the network and
    /// broadcast addresses.
    pub fn host_for(&self, hash: u64) -> Ipv4Addr {
        let host_count = (1u64 << (32 - self.bitlen)) - 2;
        let host = (hash % host_count) as u32 + 1;
        Ipv4Addr::from(u32::from(self.net) | host)
    }
}

impl fmt::Display for IpSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net, self.bitlen)
    }
}

fn mask_of(bitlen: u8) -> u32 {
    if bitlen == 0 {
        0
    } else {
        u32::MAX << (32 - bitlen)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid auto-ip pool: {0}")]
    BadPool(&'static str),

    #[error("invalid federation name: {0}")]
    BadFederationName(crate::wire::WireError),
}

/// The configured `[min, max]` range of /n subnets available for auto-IP
/// assignment.
#[derive(Debug, Clone, Copy)]
pub struct AutoIpPool {
    min_net: u32,
    max_net: u32,
    bitlen: u8,
}

impl AutoIpPool {
    pub fn new(min: Ipv4Addr, max: Ipv4Addr, bitlen: u8) -> Result<Self, RegistryError> {
        if bitlen == 0 || bitlen > 30 {
            return Err(RegistryError::BadPool("prefix length must be 1..=30"));
        }
        let (min_net, max_net) = (u32::from(min), u32::from(max));
        let mask = mask_of(bitlen);
        if min_net & !mask != 0 || max_net & !mask != 0 {
            return Err(RegistryError::BadPool("range bounds not subnet-aligned"));
        }
        if min_net > max_net {
            return Err(RegistryError::BadPool("range minimum above maximum"));
        }
        Ok(AutoIpPool {
            min_net,
            max_net,
            bitlen,
        })
    }

    pub fn bitlen(&self) -> u8 {
        self.bitlen
    }

    pub fn subnet_count(&self) -> u64 {
        (((self.max_net - self.min_net) as u64) >> (32 - self.bitlen)) + 1
    }

    fn subnet_at(&self, index: u64) -> IpSubnet {
        let net = self.min_net + ((index as u32) << (32 - self.bitlen));
        IpSubnet {
            net: Ipv4Addr::from(net),
            bitlen: self.bitlen,
        }
    }

    pub fn contains(&self, subnet: &IpSubnet) -> bool {
        let net = u32::from(subnet.net);
        subnet.bitlen == self.bitlen && net >= self.min_net && net <= self.max_net
    }

    /// Deterministic assignment: the name hash picks a subnet; collisions
    /// within one supernode are resolved by linear probing.
    pub fn assign(&self, name_hash: u64, taken: &HashSet<u32>) -> Option<IpSubnet> {
        let count = self.subnet_count();
        let start = name_hash % count;
        for probe in 0..count {
            let subnet = self.subnet_at((start + probe) % count);
            if !taken.contains(&u32::from(subnet.net)) {
                return Some(subnet);
            }
        }
        None
    }
}

// ── Communities ───────────────────────────────────────────────────────────────

/// A user entitled to a `user-password` community, with the header cipher
/// derived from their published key. Derived once per ACL load and cached
/// here until the next reload.
pub struct UserKey {
    pub username: String,
    pub public_key: [u8; USER_KEY_SIZE],
    pub cipher: Arc<dyn HeaderCipher>,
}

/// One named overlay segment and its registered edges.
pub struct Community {
    pub name: CommunityName,
    pub encryption: HeaderEncryption,
    pub users: Vec<UserKey>,
    /// Community-wide cipher, derived from the name alone. Used for
    /// `static-key` mode and for supernode-to-supernode relays.
    pub cipher: Arc<dyn HeaderCipher>,
    pub auto_ip_net: Option<IpSubnet>,
    /// The federation community itself, or a community known only through
    /// federation gossip (no local edges yet).
    pub is_federation: bool,
    /// Whether new edge registrations are accepted. Cleared when the
    /// community disappears from the ACL; existing edges keep being served.
    pub joinable: bool,
    pub purgeable: bool,
    pub edges: PeerTable,
}

impl Community {
    fn new(
        name: CommunityName,
        encryption: HeaderEncryption,
        provider: &dyn CryptoProvider,
    ) -> Self {
        Community {
            cipher: provider.community_cipher(&name),
            name,
            encryption,
            users: Vec::new(),
            auto_ip_net: None,
            is_federation: false,
            joinable: true,
            purgeable: true,
            edges: PeerTable::new(),
        }
    }

    fn user_cipher(&self, username: &str) -> Option<Arc<dyn HeaderCipher>> {
        self.users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.cipher.clone())
    }
}

// ── ACL file ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclEntry {
    /// Plain listing: joinable, daemon-default header encryption.
    Default,
    /// `<name> *`: open community, headers in the clear.
    Open,
    /// `<name> <path>`: user-password community keyed from this file.
    Users(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("no community file configured")]
    NotConfigured,

    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("{path}:{line}: {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },
}

/// Result of a successful ACL (re)load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclSummary {
    pub communities: usize,
    pub users: usize,
}

fn parse_acl(path: &Path) -> Result<Vec<(CommunityName, AclEntry)>, AclError> {
    let text =
        std::fs::read_to_string(path).map_err(|e| AclError::Io(path.to_path_buf(), e))?;

    let mut entries = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let name_field = fields.next().unwrap_or_default();
        let name = CommunityName::new(name_field).map_err(|e| AclError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            msg: e.to_string(),
        })?;
        if name.is_federation() {
            return Err(AclError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                msg: "federation names cannot be listed".into(),
            });
        }
        let entry = match fields.next() {
            None => AclEntry::Default,
            Some("*") => AclEntry::Open,
            Some(key_path) => AclEntry::Users(PathBuf::from(key_path)),
        };
        if fields.next().is_some() {
            return Err(AclError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                msg: "trailing fields".into(),
            });
        }
        entries.push((name, entry));
    }
    Ok(entries)
}

fn parse_user_keys(path: &Path) -> Result<Vec<(String, [u8; USER_KEY_SIZE])>, AclError> {
    let text =
        std::fs::read_to_string(path).map_err(|e| AclError::Io(path.to_path_buf(), e))?;

    let mut users = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(username), Some(key_hex)) = (fields.next(), fields.next()) else {
            return Err(AclError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                msg: "expected '<username> <hex key>'".into(),
            });
        };
        let bytes = hex::decode(key_hex).map_err(|e| AclError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            msg: e.to_string(),
        })?;
        let key: [u8; USER_KEY_SIZE] = bytes.try_into().map_err(|_| AclError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            msg: format!("key must be {USER_KEY_SIZE} bytes"),
        })?;
        users.push((username.to_string(), key));
    }
    Ok(users)
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct CommunityRegistry {
    provider: Arc<dyn CryptoProvider>,
    communities: DashMap<String, Community>,
    federation: CommunityName,
    pool: AutoIpPool,
    default_encryption: HeaderEncryption,
    community_file: Option<PathBuf>,
    /// `None` = open mode (no ACL file configured).
    acl: RwLock<Option<HashMap<String, AclEntry>>>,
}

impl CommunityRegistry {
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        pool: AutoIpPool,
        federation_name: &str,
        default_encryption: HeaderEncryption,
        community_file: Option<PathBuf>,
    ) -> Result<Self, RegistryError> {
        let federation = CommunityName::new(&format!("*{federation_name}"))
            .map_err(RegistryError::BadFederationName)?;

        let registry = CommunityRegistry {
            provider,
            communities: DashMap::new(),
            federation,
            pool,
            default_encryption,
            community_file,
            acl: RwLock::new(None),
        };

        // The federation community always exists and never purges. Its
        // headers are always sealed so stray edges cannot spoof peering.
        let mut fed = Community::new(federation, HeaderEncryption::StaticKey, &*registry.provider);
        fed.is_federation = true;
        fed.joinable = false;
        fed.purgeable = false;
        registry.communities.insert(federation.as_str().to_string(), fed);

        Ok(registry)
    }

    pub fn federation(&self) -> CommunityName {
        self.federation
    }

    pub fn community_file(&self) -> Option<&Path> {
        self.community_file.as_deref()
    }

    pub fn pool(&self) -> AutoIpPool {
        self.pool
    }

    pub fn len(&self) -> usize {
        self.communities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.communities.is_empty()
    }

    pub fn contains(&self, name: &CommunityName) -> bool {
        self.communities.contains_key(name.as_str())
    }

    pub fn with<R>(&self, name: &CommunityName, f: impl FnOnce(&Community) -> R) -> Option<R> {
        self.communities.get(name.as_str()).map(|c| f(&c))
    }

    pub fn with_mut<R>(
        &self,
        name: &CommunityName,
        f: impl FnOnce(&mut Community) -> R,
    ) -> Option<R> {
        self.communities.get_mut(name.as_str()).map(|mut c| f(&mut c))
    }

    pub fn for_each(&self, mut f: impl FnMut(&Community)) {
        for c in self.communities.iter() {
            f(&c);
        }
    }

    pub fn for_each_mut(&self, mut f: impl FnMut(&mut Community)) {
        for mut c in self.communities.iter_mut() {
            f(&mut c);
        }
    }

    pub fn acl_is_open(&self) -> bool {
        self.acl.read().map(|acl| acl.is_none()).unwrap_or(false)
    }

    /// Communities this supernode serves locally — what we advertise to
    /// federation peers. Learned-only communities are not re-advertised.
    pub fn local_community_names(&self) -> Vec<CommunityName> {
        let mut names: Vec<CommunityName> = self
            .communities
            .iter()
            .filter(|c| !c.is_federation)
            .map(|c| c.name)
            .collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        names
    }

    /// Total registered edges across all non-federation communities. Used
    /// as the selection criterion advertised to federation peers.
    pub fn edge_count(&self) -> u32 {
        self.communities
            .iter()
            .filter(|c| !c.is_federation)
            .map(|c| c.edges.len() as u32)
            .sum()
    }

    /// Gate an edge registration: community must exist or be creatable under
    /// the ACL, be joinable, and the presented header authentication must
    /// match its encryption mode. Creates or activates the community on
    /// success.
    pub fn admit_edge(&self, name: &CommunityName, auth: &HeaderAuth) -> Result<(), NakReason> {
        if name.is_federation() {
            return Err(NakReason::Community);
        }

        #[derive(PartialEq)]
        enum Gate {
            Ready,
            LearnedOnly,
            Closed,
        }

        let gate = self.with(name, |c| {
            if c.is_federation {
                Gate::LearnedOnly
            } else if c.joinable {
                Gate::Ready
            } else {
                Gate::Closed
            }
        });

        match gate {
            Some(Gate::Ready) => {}
            Some(Gate::Closed) => return Err(NakReason::Community),
            Some(Gate::LearnedOnly) => {
                // Known only through federation gossip. A local edge may
                // activate it when the ACL permits; listed names would have
                // been created as regular communities at ACL load.
                if !self.acl_is_open() {
                    return Err(NakReason::Community);
                }
                self.with_mut(name, |c| {
                    c.is_federation = false;
                    c.joinable = true;
                });
            }
            None => {
                let entry = {
                    let acl = self.acl.read().ok();
                    match acl.as_deref() {
                        Some(None) | None => Some(AclEntry::Default),
                        Some(Some(entries)) => entries.get(name.as_str()).cloned(),
                    }
                };
                match entry {
                    Some(entry) => {
                        let encryption = match entry {
                            AclEntry::Default => self.default_encryption,
                            AclEntry::Open => HeaderEncryption::None,
                            AclEntry::Users(_) => HeaderEncryption::UserPassword,
                        };
                        self.create_community(*name, encryption);
                    }
                    None => return Err(NakReason::Community),
                }
            }
        }

        let mode_ok = self
            .with(name, |c| match c.encryption {
                HeaderEncryption::None => true,
                HeaderEncryption::StaticKey => auth.is_authenticated(),
                HeaderEncryption::UserPassword => matches!(auth, HeaderAuth::User(_)),
            })
            .unwrap_or(false);
        if !mode_ok {
            return Err(NakReason::Auth);
        }
        Ok(())
    }

    /// Merge community names learned from a federated supernode. Unknown
    /// names are created flagged `is_federation` so broadcasts relay to the
    /// right peers while no local edge has joined yet.
    pub fn merge_remote(&self, names: &[CommunityName]) -> usize {
        let mut merged = 0;
        for name in names {
            if name.is_federation() || self.contains(name) {
                continue;
            }
            let id = self.create_community(*name, self.default_encryption);
            self.with_mut(&id, |c| {
                c.is_federation = true;
                c.joinable = false;
            });
            merged += 1;
        }
        merged
    }

    fn create_community(&self, name: CommunityName, encryption: HeaderEncryption) -> CommunityName {
        let taken: HashSet<u32> = self
            .communities
            .iter()
            .filter_map(|c| c.auto_ip_net.map(|s| u32::from(s.net)))
            .collect();

        let mut community = Community::new(name, encryption, &*self.provider);
        community.auto_ip_net = self
            .pool
            .assign(self.provider.name_hash64(name.as_str().as_bytes()), &taken);

        self.communities
            .entry(name.as_str().to_string())
            .or_insert(community);
        name
    }

    /// Deterministic overlay address for an edge in a community.
    pub fn edge_auto_ip(&self, name: &CommunityName, mac: &crate::wire::MacAddr) -> Option<(Ipv4Addr, u8)> {
        let subnet = self.with(name, |c| c.auto_ip_net)??;
        Some((
            subnet.host_for(self.provider.name_hash64(&mac.0)),
            subnet.bitlen,
        ))
    }

    /// Cipher to seal a reply with, honoring the authentication mode the
    /// request arrived under.
    pub fn reply_cipher(
        &self,
        name: &CommunityName,
        auth: &HeaderAuth,
    ) -> Option<Arc<dyn HeaderCipher>> {
        self.with(name, |c| match (c.encryption, auth) {
            (HeaderEncryption::None, _) => None,
            (HeaderEncryption::UserPassword, HeaderAuth::User(username)) => {
                c.user_cipher(username).or_else(|| Some(c.cipher.clone()))
            }
            _ => Some(c.cipher.clone()),
        })?
    }

    /// Cipher for relayed/forwarded traffic in a community: the name-derived
    /// community cipher, which every federated supernode can open.
    pub fn relay_cipher(&self, name: &CommunityName) -> Option<Arc<dyn HeaderCipher>> {
        self.with(name, |c| match c.encryption {
            HeaderEncryption::None => None,
            _ => Some(c.cipher.clone()),
        })?
    }

    /// Is this MAC already bound to a different source address anywhere?
    /// Returns the community holding the conflicting record.
    pub fn find_spoof_conflict(
        &self,
        mac: &crate::wire::MacAddr,
        src: std::net::SocketAddr,
    ) -> Option<CommunityName> {
        for c in self.communities.iter() {
            if let Some(peer) = c.edges.get(mac) {
                if peer.sock.addr != src {
                    return Some(c.name);
                }
            }
        }
        None
    }

    /// (Re)load the community file. Fully parses and validates into a
    /// staging set before touching any state, so a bad file leaves the
    /// in-memory ACL untouched.
    pub fn load_acl(&self) -> Result<AclSummary, AclError> {
        let path = self.community_file.as_deref().ok_or(AclError::NotConfigured)?;

        let entries = parse_acl(path)?;
        let mut staged: Vec<(CommunityName, AclEntry, Vec<(String, [u8; USER_KEY_SIZE])>)> =
            Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            let users = match &entry {
                AclEntry::Users(key_path) => parse_user_keys(key_path)?,
                _ => Vec::new(),
            };
            staged.push((name, entry, users));
        }

        // Commit.
        let mut user_total = 0;
        let allowed: HashSet<String> = staged
            .iter()
            .map(|(name, _, _)| name.as_str().to_string())
            .collect();

        for (name, entry, users) in &staged {
            let encryption = match entry {
                AclEntry::Default => self.default_encryption,
                AclEntry::Open => HeaderEncryption::None,
                AclEntry::Users(_) => HeaderEncryption::UserPassword,
            };
            if !self.contains(name) {
                self.create_community(*name, encryption);
            }
            user_total += users.len();
            self.with_mut(name, |c| {
                c.joinable = true;
                c.is_federation = false;
                c.encryption = encryption;
                c.users = users
                    .iter()
                    .map(|(username, pk)| UserKey {
                        username: username.clone(),
                        public_key: *pk,
                        cipher: self.provider.user_cipher(name, username, pk),
                    })
                    .collect();
            });
        }

        // Communities dropped from the ACL keep serving existing edges but
        // accept no new registrations.
        self.for_each_mut(|c| {
            if !c.is_federation && !allowed.contains(c.name.as_str()) {
                c.joinable = false;
            }
        });

        if let Ok(mut acl) = self.acl.write() {
            *acl = Some(
                staged
                    .into_iter()
                    .map(|(name, entry, _)| (name.as_str().to_string(), entry))
                    .collect(),
            );
        }

        Ok(AclSummary {
            communities: allowed.len(),
            users: user_total,
        })
    }
}

impl KeyResolver for CommunityRegistry {
    fn clear_policy(&self, community: &CommunityName) -> ClearPolicy {
        match self.with(community, |c| c.encryption) {
            Some(HeaderEncryption::None) => ClearPolicy::Accept,
            Some(_) => ClearPolicy::Reject,
            None => {
                if self.acl_is_open() {
                    match self.default_encryption {
                        HeaderEncryption::None => ClearPolicy::Accept,
                        _ => ClearPolicy::Reject,
                    }
                } else {
                    ClearPolicy::UnknownCommunity
                }
            }
        }
    }

    fn candidates(&self) -> Vec<KeyCandidate> {
        let mut names: Vec<String> = self
            .communities
            .iter()
            .filter(|c| c.encryption != HeaderEncryption::None)
            .map(|c| c.name.as_str().to_string())
            .collect();
        names.sort();

        let mut out = Vec::new();
        for key in names {
            if let Some(c) = self.communities.get(&key) {
                out.push(KeyCandidate {
                    community: c.name,
                    auth: HeaderAuth::Community,
                    cipher: c.cipher.clone(),
                });
                for user in &c.users {
                    out.push(KeyCandidate {
                        community: c.name,
                        auth: HeaderAuth::User(user.username.clone()),
                        cipher: user.cipher.clone(),
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StandardProvider;
    use std::io::Write;

    fn name(s: &str) -> CommunityName {
        CommunityName::new(s).unwrap()
    }

    fn pool() -> AutoIpPool {
        AutoIpPool::new(
            Ipv4Addr::new(10, 128, 255, 0),
            Ipv4Addr::new(10, 255, 255, 0),
            24,
        )
        .unwrap()
    }

    fn open_registry() -> CommunityRegistry {
        CommunityRegistry::new(
            Arc::new(StandardProvider::generate()),
            pool(),
            "Federation",
            HeaderEncryption::None,
            None,
        )
        .unwrap()
    }

    fn registry_with_acl(acl_text: &str) -> (CommunityRegistry, tempdir::Dir) {
        let dir = tempdir::Dir::new("meshgate-acl-test");
        let path = dir.path().join("communities.list");
        std::fs::write(&path, acl_text).unwrap();
        let registry = CommunityRegistry::new(
            Arc::new(StandardProvider::generate()),
            pool(),
            "Federation",
            HeaderEncryption::None,
            Some(path),
        )
        .unwrap();
        (registry, dir)
    }

    /// Minimal unique temp dir helper; std-only, cleaned on drop.
    mod tempdir {
        use std::path::{Path, PathBuf};
        use std::sync::atomic::{AtomicU32, Ordering};

        static SEQ: AtomicU32 = AtomicU32::new(0);

        pub struct Dir(PathBuf);

        impl Dir {
            pub fn new(prefix: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "{prefix}-{}-{}",
                    std::process::id(),
                    SEQ.fetch_add(1, Ordering::Relaxed)
                ));
                std::fs::create_dir_all(&path).unwrap();
                Dir(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for Dir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn federation_community_exists_at_startup() {
        let registry = open_registry();
        assert_eq!(registry.federation().as_str(), "*Federation");
        registry
            .with(&registry.federation(), |c| {
                assert!(c.is_federation);
                assert!(!c.purgeable);
                assert!(!c.joinable);
            })
            .unwrap();
    }

    #[test]
    fn open_mode_admits_and_creates() {
        let registry = open_registry();
        assert!(registry.admit_edge(&name("alpha"), &HeaderAuth::Clear).is_ok());
        assert!(registry.contains(&name("alpha")));
        let subnet = registry.with(&name("alpha"), |c| c.auto_ip_net).unwrap();
        assert!(subnet.is_some());
    }

    #[test]
    fn federation_names_are_reserved() {
        let registry = open_registry();
        assert_eq!(
            registry.admit_edge(&name("*Federation"), &HeaderAuth::Clear),
            Err(NakReason::Community)
        );
        assert_eq!(
            registry.admit_edge(&name("*other"), &HeaderAuth::Clear),
            Err(NakReason::Community)
        );
    }

    #[test]
    fn acl_gates_admission() {
        let (registry, _dir) = registry_with_acl("# test communities\nalpha\nbeta *\n");
        registry.load_acl().unwrap();

        assert!(registry.admit_edge(&name("alpha"), &HeaderAuth::Clear).is_ok());
        assert!(registry.admit_edge(&name("beta"), &HeaderAuth::Clear).is_ok());
        assert_eq!(
            registry.admit_edge(&name("gamma"), &HeaderAuth::Clear),
            Err(NakReason::Community)
        );
    }

    #[test]
    fn acl_reload_is_atomic_on_parse_error() {
        let (registry, dir) = registry_with_acl("alpha\n");
        registry.load_acl().unwrap();
        assert!(registry.admit_edge(&name("alpha"), &HeaderAuth::Clear).is_ok());

        // Break the file: over-long community name.
        let path = dir.path().join("communities.list");
        std::fs::write(&path, "this-name-is-way-too-long-to-accept\n").unwrap();
        assert!(registry.load_acl().is_err());

        // Old ACL still in force.
        assert!(registry.admit_edge(&name("alpha"), &HeaderAuth::Clear).is_ok());
        assert_eq!(
            registry.admit_edge(&name("gamma"), &HeaderAuth::Clear),
            Err(NakReason::Community)
        );
    }

    #[test]
    fn removed_community_becomes_read_only() {
        let (registry, dir) = registry_with_acl("alpha\nbeta\n");
        registry.load_acl().unwrap();
        registry.admit_edge(&name("alpha"), &HeaderAuth::Clear).unwrap();

        let path = dir.path().join("communities.list");
        std::fs::write(&path, "beta\n").unwrap();
        registry.load_acl().unwrap();

        // Community object survives for its edges, but joins are refused.
        assert!(registry.contains(&name("alpha")));
        assert_eq!(
            registry.admit_edge(&name("alpha"), &HeaderAuth::Clear),
            Err(NakReason::Community)
        );

        // Re-adding restores joinability.
        std::fs::write(&path, "alpha\nbeta\n").unwrap();
        registry.load_acl().unwrap();
        assert!(registry.admit_edge(&name("alpha"), &HeaderAuth::Clear).is_ok());
    }

    #[test]
    fn reload_twice_is_idempotent() {
        let (registry, _dir) = registry_with_acl("alpha\nbeta\n");
        let first = registry.load_acl().unwrap();
        let before: Vec<String> = registry
            .local_community_names()
            .iter()
            .map(|n| n.as_str().to_string())
            .collect();
        let second = registry.load_acl().unwrap();
        let after: Vec<String> = registry
            .local_community_names()
            .iter()
            .map(|n| n.as_str().to_string())
            .collect();
        assert_eq!(first, second);
        assert_eq!(before, after);
    }

    #[test]
    fn user_password_communities_load_keys() {
        let dir = tempdir::Dir::new("meshgate-userkeys");
        let keys_path = dir.path().join("gamma.keys");
        std::fs::write(
            &keys_path,
            format!("alice {}\nbob {}\n", "11".repeat(32), "22".repeat(32)),
        )
        .unwrap();
        let acl_path = dir.path().join("communities.list");
        let mut f = std::fs::File::create(&acl_path).unwrap();
        writeln!(f, "gamma {}", keys_path.display()).unwrap();

        let registry = CommunityRegistry::new(
            Arc::new(StandardProvider::generate()),
            pool(),
            "Federation",
            HeaderEncryption::None,
            Some(acl_path),
        )
        .unwrap();
        let summary = registry.load_acl().unwrap();
        assert_eq!(summary.users, 2);

        registry
            .with(&name("gamma"), |c| {
                assert_eq!(c.encryption, HeaderEncryption::UserPassword);
                assert_eq!(c.users.len(), 2);
            })
            .unwrap();

        // Registration requires a user identity for such communities.
        assert_eq!(
            registry.admit_edge(&name("gamma"), &HeaderAuth::Community),
            Err(NakReason::Auth)
        );
        assert!(registry
            .admit_edge(&name("gamma"), &HeaderAuth::User("alice".into()))
            .is_ok());
    }

    #[test]
    fn auto_ip_is_deterministic_and_disjoint() {
        let provider = Arc::new(StandardProvider::generate());
        let make = || {
            let registry = CommunityRegistry::new(
                provider.clone(),
                pool(),
                "Federation",
                HeaderEncryption::None,
                None,
            )
            .unwrap();
            for n in ["alpha", "beta", "gamma", "delta"] {
                registry.admit_edge(&name(n), &HeaderAuth::Clear).unwrap();
            }
            let mut nets: Vec<(String, IpSubnet)> = Vec::new();
            registry.for_each(|c| {
                if let Some(s) = c.auto_ip_net {
                    nets.push((c.name.as_str().to_string(), s));
                }
            });
            nets.sort_by(|a, b| a.0.cmp(&b.0));
            nets
        };

        let first = make();
        let second = make();
        assert_eq!(first, second, "assignment must be pure in (name, pool)");

        let nets: HashSet<u32> = first.iter().map(|(_, s)| u32::from(s.net)).collect();
        assert_eq!(nets.len(), first.len(), "subnets must not collide");
        for (_, subnet) in &first {
            assert!(pool().contains(subnet), "assignment must stay in pool");
        }
    }

    #[test]
    fn auto_ip_pool_probes_on_collision() {
        // A pool of exactly two subnets forces the second community onto
        // the probed slot regardless of hash values.
        let tiny = AutoIpPool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(10, 0, 1, 0),
            24,
        )
        .unwrap();
        assert_eq!(tiny.subnet_count(), 2);

        let mut taken = HashSet::new();
        let first = tiny.assign(7, &taken).unwrap();
        taken.insert(u32::from(first.net));
        let second = tiny.assign(7, &taken).unwrap();
        assert_ne!(first, second);
        taken.insert(u32::from(second.net));
        assert_eq!(tiny.assign(7, &taken), None);
    }

    #[test]
    fn edge_auto_ip_lands_in_community_subnet() {
        let registry = open_registry();
        registry.admit_edge(&name("alpha"), &HeaderAuth::Clear).unwrap();
        let mac = crate::wire::MacAddr([2, 0, 0, 0, 0, 1]);
        let (ip, bitlen) = registry.edge_auto_ip(&name("alpha"), &mac).unwrap();
        let subnet = registry
            .with(&name("alpha"), |c| c.auto_ip_net)
            .unwrap()
            .unwrap();
        assert!(subnet.contains(ip));
        assert_eq!(bitlen, 24);
        // Host part avoids network and broadcast addresses.
        let host = u32::from(ip) & !(u32::MAX << 8);
        assert!(host >= 1 && host <= 254);
    }

    #[test]
    fn merge_remote_flags_learned_communities() {
        let registry = open_registry();
        assert_eq!(registry.merge_remote(&[name("beta"), name("*x")]), 1);
        registry
            .with(&name("beta"), |c| {
                assert!(c.is_federation);
                assert!(!c.joinable);
            })
            .unwrap();

        // A local edge registration activates it under an open ACL.
        registry.admit_edge(&name("beta"), &HeaderAuth::Clear).unwrap();
        registry
            .with(&name("beta"), |c| {
                assert!(!c.is_federation);
                assert!(c.joinable);
            })
            .unwrap();
    }

    #[test]
    fn pool_validation() {
        assert!(AutoIpPool::new(
            Ipv4Addr::new(10, 0, 1, 0),
            Ipv4Addr::new(10, 0, 0, 0),
            24
        )
        .is_err());
        assert!(AutoIpPool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 1, 0),
            24
        )
        .is_err());
        assert!(AutoIpPool::new(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(10, 0, 1, 0),
            31
        )
        .is_err());
    }
}
