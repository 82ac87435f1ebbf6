//! State object persistence under the service home directory.
//!
//! The engine treats state objects as opaque bytes; this module maps each
//! object kind to its fixed on-disk path and handles write coalescing,
//! directory creation, and permission lockdown. The layout is bit-exact
//! with prior releases for upgrade compatibility:
//!
//! - `authtoken.secret` — 24 chars of `[a-z0-9]`, owner-only
//! - `identity.public`, `identity.secret` — secret is owner-only
//! - `planet`
//! - `networks.d/<16-hex-nwid>.conf` — owner-only, iff network caching
//! - `peers.d/<10-hex-peer>.peer` — iff peer caching

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rand::Rng;

use lattice_core::{NetworkId, StateObjectKind};

/// File name of the persisted auth token.
pub const AUTH_TOKEN_FILE: &str = "authtoken.secret";

/// Subdirectory holding cached per-network configs.
pub const NETWORKS_DIR: &str = "networks.d";

/// Subdirectory holding cached peer state.
pub const PEERS_DIR: &str = "peers.d";

const AUTH_TOKEN_LEN: usize = 24;
const AUTH_TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Errors from store operations that matter at startup. Steady-state
/// put/get failures are logged, not returned.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("authtoken.secret could not be written")]
    AuthTokenUnwritable,
}

/// Persistent storage for engine state objects.
pub struct StateStore {
    home: PathBuf,
    allow_network_caching: bool,
    allow_peer_caching: bool,
}

impl StateStore {
    pub fn new(
        home: impl Into<PathBuf>,
        allow_network_caching: bool,
        allow_peer_caching: bool,
    ) -> Self {
        Self {
            home: home.into(),
            allow_network_caching,
            allow_peer_caching,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Resolve a state object kind to (path, secure). Returns `None` when
    /// the kind's caching flag is disabled.
    fn object_path(&self, kind: StateObjectKind) -> Option<(PathBuf, bool)> {
        match kind {
            StateObjectKind::IdentityPublic => Some((self.home.join("identity.public"), false)),
            StateObjectKind::IdentitySecret => Some((self.home.join("identity.secret"), true)),
            StateObjectKind::Planet => Some((self.home.join("planet"), false)),
            StateObjectKind::NetworkConfig(nwid) => {
                if !self.allow_network_caching {
                    return None;
                }
                Some((self.home.join(NETWORKS_DIR).join(format!("{nwid}.conf")), true))
            }
            StateObjectKind::Peer(addr) => {
                if !self.allow_peer_caching {
                    return None;
                }
                Some((self.home.join(PEERS_DIR).join(format!("{addr}.peer")), false))
            }
        }
    }

    /// Persist a state object, silently dropping kinds whose caching flag
    /// is off. Rewrites are coalesced: if the file already holds exactly
    /// these bytes, no disk write happens.
    pub fn put(&self, kind: StateObjectKind, data: &[u8]) {
        let Some((path, secure)) = self.object_path(kind) else {
            return;
        };

        if let Ok(existing) = fs::read(&path)
            && existing == data
        {
            return;
        }

        if let Some(parent) = path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            tracing::warn!("unable to create {}: {e}", parent.display());
            return;
        }

        if let Err(e) = atomic_write(&path, data) {
            tracing::warn!("unable to write to file: {} ({e})", path.display());
            return;
        }
        if secure && let Err(e) = lock_down(&path) {
            tracing::warn!("unable to restrict permissions on {}: {e}", path.display());
        }
    }

    /// Delete a state object, if its kind is enabled and the file exists.
    pub fn delete(&self, kind: StateObjectKind) {
        if let Some((path, _)) = self.object_path(kind) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("unable to remove {}: {e}", path.display()),
            }
        }
    }

    /// Load a state object, truncated to `max_len` bytes. Returns `None`
    /// for disabled kinds, missing files, or read errors.
    pub fn get(&self, kind: StateObjectKind, max_len: usize) -> Option<Vec<u8>> {
        let (path, _) = self.object_path(kind)?;
        let mut data = fs::read(&path).ok()?;
        data.truncate(max_len);
        Some(data)
    }

    /// Load the auth token, generating and persisting one on first run.
    pub fn load_or_create_auth_token(&self) -> Result<String, StoreError> {
        let path = self.home.join(AUTH_TOKEN_FILE);
        if let Ok(existing) = fs::read_to_string(&path) {
            let token = existing.trim().to_string();
            if !token.is_empty() {
                return Ok(token);
            }
        }

        let mut rng = rand::thread_rng();
        let token: String = (0..AUTH_TOKEN_LEN)
            .map(|_| AUTH_TOKEN_ALPHABET[rng.gen_range(0..AUTH_TOKEN_ALPHABET.len())] as char)
            .collect();

        fs::write(&path, &token).map_err(|_| StoreError::AuthTokenUnwritable)?;
        lock_down(&path).map_err(|_| StoreError::AuthTokenUnwritable)?;
        Ok(token)
    }

    /// Network IDs with a cached config on disk (`networks.d/<nwid>.conf`).
    pub fn cached_networks(&self) -> Vec<NetworkId> {
        let mut out = Vec::new();
        if !self.allow_network_caching {
            return out;
        }
        let Ok(entries) = fs::read_dir(self.home.join(NETWORKS_DIR)) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".conf")
                && stem.len() == 16
                && let Ok(nwid) = stem.parse::<NetworkId>()
            {
                out.push(nwid);
            }
        }
        out.sort();
        out
    }

    /// Delete peer cache files older than `max_age`. Returns the number
    /// removed.
    pub fn reap_stale_peers(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        let Ok(entries) = fs::read_dir(self.home.join(PEERS_DIR)) else {
            return 0;
        };
        for entry in entries.flatten() {
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .is_some_and(|age| age > max_age);
            if stale && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

/// Write data atomically: write to a `.tmp` file then rename.
fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)
}

/// Restrict a file to owner read/write.
fn lock_down(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::NodeAddr;

    fn store(dir: &Path) -> StateStore {
        StateStore::new(dir, true, true)
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        s.put(StateObjectKind::Planet, b"planet bytes");
        assert_eq!(
            s.get(StateObjectKind::Planet, 65535).unwrap(),
            b"planet bytes"
        );
    }

    #[test]
    fn get_truncates_to_max_len() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        s.put(StateObjectKind::Planet, b"0123456789");
        assert_eq!(s.get(StateObjectKind::Planet, 4).unwrap(), b"0123");
    }

    #[test]
    fn get_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.get(StateObjectKind::IdentityPublic, 65535).is_none());
    }

    #[test]
    fn network_config_path_uses_16_hex_name() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let nwid = NetworkId::new(0x8056c2e21c000001);

        s.put(StateObjectKind::NetworkConfig(nwid), b"conf");
        assert!(
            dir.path()
                .join("networks.d")
                .join("8056c2e21c000001.conf")
                .exists()
        );
    }

    #[test]
    fn peer_path_uses_10_hex_name() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let addr = NodeAddr::new(0xa1b2c3d4e5);

        s.put(StateObjectKind::Peer(addr), b"peer");
        assert!(dir.path().join("peers.d").join("a1b2c3d4e5.peer").exists());
    }

    #[test]
    fn disabled_caching_drops_puts_and_gets() {
        let dir = tempfile::tempdir().unwrap();
        let s = StateStore::new(dir.path(), false, false);
        let nwid = NetworkId::new(1);
        let addr = NodeAddr::new(2);

        s.put(StateObjectKind::NetworkConfig(nwid), b"conf");
        s.put(StateObjectKind::Peer(addr), b"peer");
        assert!(!dir.path().join("networks.d").exists());
        assert!(!dir.path().join("peers.d").exists());
        assert!(s.get(StateObjectKind::NetworkConfig(nwid), 65535).is_none());
        assert!(s.get(StateObjectKind::Peer(addr), 65535).is_none());
    }

    #[test]
    fn put_coalesces_identical_writes() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        s.put(StateObjectKind::Planet, b"same");
        let first_mtime = fs::metadata(dir.path().join("planet"))
            .unwrap()
            .modified()
            .unwrap();

        // An identical put must not touch the file. Force a detectable
        // mtime by backdating before the second put.
        let backdated = first_mtime - Duration::from_secs(60);
        let f = fs::File::open(dir.path().join("planet")).unwrap();
        f.set_modified(backdated).unwrap();
        drop(f);

        s.put(StateObjectKind::Planet, b"same");
        let after = fs::metadata(dir.path().join("planet"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(after, backdated);

        // A different put rewrites.
        s.put(StateObjectKind::Planet, b"different");
        assert_eq!(s.get(StateObjectKind::Planet, 65535).unwrap(), b"different");
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        s.put(StateObjectKind::Planet, b"x");
        s.delete(StateObjectKind::Planet);
        assert!(s.get(StateObjectKind::Planet, 65535).is_none());

        // Deleting again is harmless.
        s.delete(StateObjectKind::Planet);
    }

    #[test]
    fn auth_token_is_generated_then_stable() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let token = s.load_or_create_auth_token().unwrap();
        assert_eq!(token.len(), 24);
        assert!(
            token
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        );

        let again = s.load_or_create_auth_token().unwrap();
        assert_eq!(token, again);
    }

    #[test]
    fn auth_token_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        fs::write(dir.path().join(AUTH_TOKEN_FILE), "abc123\n").unwrap();
        assert_eq!(s.load_or_create_auth_token().unwrap(), "abc123");
    }

    #[cfg(unix)]
    #[test]
    fn secret_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        s.put(StateObjectKind::IdentitySecret, b"secret");
        s.load_or_create_auth_token().unwrap();

        for name in ["identity.secret", AUTH_TOKEN_FILE] {
            let mode = fs::metadata(dir.path().join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{name} should be 0600");
        }
    }

    #[test]
    fn cached_networks_lists_valid_conf_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let nets = dir.path().join(NETWORKS_DIR);
        fs::create_dir_all(&nets).unwrap();
        fs::write(nets.join("8056c2e21c000001.conf"), b"a").unwrap();
        fs::write(nets.join("0000000000000002.conf"), b"b").unwrap();
        fs::write(nets.join("short.conf"), b"c").unwrap();
        fs::write(nets.join("8056c2e21c000001.local.conf"), b"d").unwrap();

        let found = s.cached_networks();
        assert_eq!(
            found,
            vec![
                NetworkId::new(0x0000000000000002),
                NetworkId::new(0x8056c2e21c000001),
            ]
        );
    }

    #[test]
    fn reap_removes_only_stale_peers() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let peers = dir.path().join(PEERS_DIR);
        fs::create_dir_all(&peers).unwrap();
        fs::write(peers.join("aaaaaaaaaa.peer"), b"old").unwrap();
        fs::write(peers.join("bbbbbbbbbb.peer"), b"new").unwrap();

        let old_mtime = SystemTime::now() - Duration::from_secs(40 * 86400);
        let f = fs::File::open(peers.join("aaaaaaaaaa.peer")).unwrap();
        f.set_modified(old_mtime).unwrap();
        drop(f);

        let removed = s.reap_stale_peers(Duration::from_secs(30 * 86400));
        assert_eq!(removed, 1);
        assert!(!peers.join("aaaaaaaaaa.peer").exists());
        assert!(peers.join("bbbbbbbbbb.peer").exists());
    }
}
