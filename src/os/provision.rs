//! Disposable per-request sandbox instances.
//!
//! A [`SandboxInstance`] is a fresh scratch directory plus the identity and
//! ceilings its commands run under. Instances are never reused: each one is
//! created by [`Provisioner::acquire`] and torn down by
//! [`Provisioner::release`], which removes every file and, for dedicated
//! identities, every process left running under the instance uid.

use super::procfs;
use super::sandbox::Identity;

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no sandbox slot available ({capacity} in use)")]
    Exhausted { capacity: usize },
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("instance {0} was already released")]
    Released(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }
}

/// Ceilings an instance is created with; stage limits are clamped to them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceLimits {
    pub memory_mb: u64,
    pub max_processes: u64,
}

/// One isolated execution context, owned by a single request
#[derive(Debug)]
pub struct SandboxInstance {
    pub id: String,
    /// Scratch directory, the only writable path inside the sandbox
    pub dir: PathBuf,
    pub identity: Identity,
    pub limits: InstanceLimits,
    /// Commands run in an empty network namespace and landlock denies TCP
    pub network_disabled: bool,
    slot: Option<usize>,
    released: AtomicBool,
}

impl SandboxInstance {
    pub fn new(id: impl Into<String>, dir: PathBuf, identity: Identity, limits: InstanceLimits) -> Self {
        Self {
            id: id.into(),
            dir,
            identity,
            limits,
            network_disabled: true,
            slot: None,
            released: AtomicBool::new(false),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Flag the instance released; true only for the first call
    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Allocate a fresh instance with an empty scratch directory
    async fn acquire(&self, limits: InstanceLimits) -> Result<SandboxInstance, ProvisionError>;

    /// Create `name` in the instance's scratch directory.
    ///
    /// `name` must be a single plain path component; anything that could
    /// resolve outside the directory is rejected.
    async fn write_file(
        &self,
        instance: &SandboxInstance,
        name: &str,
        content: &[u8],
    ) -> Result<(), ProvisionError>;

    /// Tear the instance down. Safe to call more than once.
    async fn release(&self, instance: &SandboxInstance) -> Result<(), ProvisionError>;

    /// Short label of the isolation identity model, for health reporting
    fn isolation_mode(&self) -> &'static str;

    /// Number of live instances
    fn active(&self) -> usize;
}

/// Returns the name back when it is a single normal path component
pub fn validate_file_name(name: &str) -> Result<&str, ProvisionError> {
    let invalid = || ProvisionError::InvalidFileName(name.to_string());
    if name.is_empty() || name.contains('\0') || name.contains('/') {
        return Err(invalid());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(name),
        _ => Err(invalid()),
    }
}

/// Provisions instances as directories under a host scratch root
pub struct HostProvisioner {
    root: PathBuf,
    /// Base uid/gid for dedicated identities; `None` uses user namespaces
    uid_base: Option<u32>,
    slots: Mutex<Vec<bool>>,
    active: AtomicUsize,
}

impl HostProvisioner {
    /// Prepare `root` and purge anything a previous run left behind.
    ///
    /// `capacity` bounds the number of simultaneous instances. With
    /// `uid_base` set (server running as root) each slot gets its own
    /// uid `uid_base + slot`.
    pub fn new(root: impl Into<PathBuf>, capacity: usize, uid_base: Option<u32>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| anyhow::anyhow!("Failed to create scratch root {}: {}", root.display(), e))?;
        // Traversable by sandbox identities but not listable
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o711))?;

        let mut purged = 0;
        for entry in std::fs::read_dir(&root)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            let result = match entry.file_type() {
                Ok(ft) if ft.is_dir() => std::fs::remove_dir_all(&path),
                _ => std::fs::remove_file(&path),
            };
            match result {
                Ok(()) => purged += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to purge stale scratch entry"),
            }
        }
        if purged > 0 {
            tracing::info!(root = %root.display(), purged, "purged stale scratch entries");
        }

        Ok(Self {
            root,
            uid_base,
            slots: Mutex::new(vec![false; capacity.max(1)]),
            active: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn take_slot(&self) -> Result<usize, ProvisionError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = slots.len();
        let slot = slots.iter().position(|used| !used)
            .ok_or(ProvisionError::Exhausted { capacity })?;
        slots[slot] = true;
        Ok(slot)
    }

    fn free_slot(&self, slot: usize) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(used) = slots.get_mut(slot) {
            *used = false;
        }
    }

    fn identity_for(&self, slot: usize) -> Identity {
        match self.uid_base {
            Some(base) => {
                let id = base + slot as u32;
                Identity::Dedicated { uid: id, gid: id }
            }
            None => Identity::UserNamespace,
        }
    }

    async fn create_dir(&self, dir: &Path, identity: Identity) -> Result<(), ProvisionError> {
        tokio::fs::create_dir(dir).await
            .map_err(|e| ProvisionError::io(format!("create {}", dir.display()), e))?;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await
            .map_err(|e| ProvisionError::io(format!("chmod {}", dir.display()), e))?;
        if let Identity::Dedicated { uid, gid } = identity {
            std::os::unix::fs::chown(dir, Some(uid), Some(gid))
                .map_err(|e| ProvisionError::io(format!("chown {}", dir.display()), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for HostProvisioner {
    async fn acquire(&self, limits: InstanceLimits) -> Result<SandboxInstance, ProvisionError> {
        let slot = self.take_slot()?;
        let identity = self.identity_for(slot);

        let id = {
            use rand::RngCore;
            let mut bytes = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        };
        let dir = self.root.join(&id);

        if let Err(e) = self.create_dir(&dir, identity).await {
            // Leave nothing behind from the partial acquire
            let _ = tokio::fs::remove_dir_all(&dir).await;
            self.free_slot(slot);
            return Err(e);
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(instance = %id, slot, ?identity, "sandbox instance acquired");

        let mut instance = SandboxInstance::new(id, dir, identity, limits);
        instance.slot = Some(slot);
        Ok(instance)
    }

    async fn write_file(
        &self,
        instance: &SandboxInstance,
        name: &str,
        content: &[u8],
    ) -> Result<(), ProvisionError> {
        if instance.is_released() {
            return Err(ProvisionError::Released(instance.id.clone()));
        }
        let name = validate_file_name(name)?;
        let path = instance.dir.join(name);

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
            .await
            .map_err(|e| ProvisionError::io(format!("create {}", path.display()), e))?;
        file.write_all(content).await
            .map_err(|e| ProvisionError::io(format!("write {}", path.display()), e))?;
        file.flush().await
            .map_err(|e| ProvisionError::io(format!("write {}", path.display()), e))?;

        if let Identity::Dedicated { uid, gid } = instance.identity {
            std::os::unix::fs::chown(&path, Some(uid), Some(gid))
                .map_err(|e| ProvisionError::io(format!("chown {}", path.display()), e))?;
        }
        Ok(())
    }

    async fn release(&self, instance: &SandboxInstance) -> Result<(), ProvisionError> {
        if !instance.mark_released() {
            return Ok(());
        }

        // Nothing may keep running under the identity before the slot is reused
        if let Identity::Dedicated { uid, .. } = instance.identity {
            let swept = tokio::task::spawn_blocking(move || {
                let mut total = 0;
                for _ in 0..10 {
                    let killed = procfs::signal_uid(uid, libc::SIGKILL);
                    if killed == 0 {
                        break;
                    }
                    total += killed;
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                total
            })
            .await
            .unwrap_or(0);
            if swept > 0 {
                tracing::debug!(instance = %instance.id, uid, swept, "killed leftover sandbox processes");
            }
        }

        let removed = match tokio::fs::remove_dir_all(&instance.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProvisionError::io(format!("remove {}", instance.dir.display()), e)),
        };

        if let Some(slot) = instance.slot {
            self.free_slot(slot);
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!(instance = %instance.id, "sandbox instance released");
        removed
    }

    fn isolation_mode(&self) -> &'static str {
        match self.uid_base {
            Some(_) => "dedicated-uid",
            None => "user-namespace",
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: InstanceLimits = InstanceLimits { memory_mb: 256, max_processes: 64 };

    fn provisioner(capacity: usize) -> (tempfile::TempDir, HostProvisioner) {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = HostProvisioner::new(tmp.path().join("scratch"), capacity, None).unwrap();
        (tmp, provisioner)
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("main.py").is_ok());
        assert!(validate_file_name("Main.java").is_ok());
        for bad in ["", ".", "..", "../x", "a/b", "/etc/passwd", "x\0y"] {
            assert!(validate_file_name(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_private_empty_dir() {
        let (_tmp, provisioner) = provisioner(2);
        let instance = provisioner.acquire(LIMITS).await.unwrap();

        let meta = std::fs::metadata(&instance.dir).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        assert_eq!(std::fs::read_dir(&instance.dir).unwrap().count(), 0);
        assert!(instance.network_disabled);
        assert_eq!(instance.identity, Identity::UserNamespace);
        assert_eq!(provisioner.active(), 1);

        provisioner.release(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn test_instances_are_distinct() {
        let (_tmp, provisioner) = provisioner(2);
        let a = provisioner.acquire(LIMITS).await.unwrap();
        let b = provisioner.acquire(LIMITS).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.dir, b.dir);
        provisioner.release(&a).await.unwrap();
        provisioner.release(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_file_rejects_traversal() {
        let (tmp, provisioner) = provisioner(1);
        let instance = provisioner.acquire(LIMITS).await.unwrap();

        provisioner.write_file(&instance, "main.py", b"print(1)\n").await.unwrap();
        assert_eq!(std::fs::read(instance.dir.join("main.py")).unwrap(), b"print(1)\n");

        let err = provisioner.write_file(&instance, "../escape", b"x").await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidFileName(_)));
        assert!(!tmp.path().join("scratch/escape").exists());

        // Existing files and symlinks are never followed or overwritten
        std::os::unix::fs::symlink("/etc/hostname", instance.dir.join("link")).unwrap();
        assert!(provisioner.write_file(&instance, "link", b"x").await.is_err());
        assert!(provisioner.write_file(&instance, "main.py", b"x").await.is_err());

        provisioner.release(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_removes_files() {
        let (_tmp, provisioner) = provisioner(1);
        let instance = provisioner.acquire(LIMITS).await.unwrap();
        provisioner.write_file(&instance, "data", b"secret").await.unwrap();

        provisioner.release(&instance).await.unwrap();
        assert!(!instance.dir.exists());
        assert_eq!(provisioner.active(), 0);

        provisioner.release(&instance).await.unwrap();
        assert_eq!(provisioner.active(), 0);
        assert!(matches!(
            provisioner.write_file(&instance, "late", b"x").await,
            Err(ProvisionError::Released(_))
        ));
    }

    #[tokio::test]
    async fn test_release_tolerates_missing_dir() {
        let (_tmp, provisioner) = provisioner(1);
        let instance = provisioner.acquire(LIMITS).await.unwrap();
        std::fs::remove_dir_all(&instance.dir).unwrap();
        provisioner.release(&instance).await.unwrap();
        assert_eq!(provisioner.active(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_and_slot_reuse() {
        let (_tmp, provisioner) = provisioner(1);
        let first = provisioner.acquire(LIMITS).await.unwrap();
        assert!(matches!(
            provisioner.acquire(LIMITS).await,
            Err(ProvisionError::Exhausted { capacity: 1 })
        ));
        provisioner.release(&first).await.unwrap();
        let second = provisioner.acquire(LIMITS).await.unwrap();
        provisioner.release(&second).await.unwrap();
    }

    #[test]
    fn test_startup_purges_stale_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("scratch");
        std::fs::create_dir_all(root.join("deadbeef")).unwrap();
        std::fs::write(root.join("deadbeef/main.c"), b"int main(){}").unwrap();

        let provisioner = HostProvisioner::new(&root, 1, None).unwrap();
        assert_eq!(std::fs::read_dir(provisioner.root()).unwrap().count(), 0);
        let mode = std::fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o711);
    }

    #[test]
    fn test_dedicated_identity_per_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = HostProvisioner::new(tmp.path().join("s"), 2, Some(60000)).unwrap();
        assert_eq!(provisioner.identity_for(0), Identity::Dedicated { uid: 60000, gid: 60000 });
        assert_eq!(provisioner.identity_for(1), Identity::Dedicated { uid: 60001, gid: 60001 });
        assert_eq!(provisioner.isolation_mode(), "dedicated-uid");
    }
}
