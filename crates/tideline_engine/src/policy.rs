//! Per-operation policy resolution.

use crate::config::Connectivity;
use std::fmt;
use std::sync::Arc;

/// Whether the remote store is reachable.
#[derive(Clone)]
pub enum Online {
    /// A fixed answer.
    Fixed(bool),
    /// Asked once per operation.
    Check(Arc<dyn Fn() -> bool + Send + Sync>),
}

impl Online {
    /// Wraps a predicate.
    pub fn check(f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Online::Check(Arc::new(f))
    }

    fn evaluate(&self) -> bool {
        match self {
            Online::Fixed(online) => *online,
            Online::Check(f) => f(),
        }
    }
}

impl From<bool> for Online {
    fn from(online: bool) -> Self {
        Online::Fixed(online)
    }
}

impl fmt::Debug for Online {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Online::Fixed(online) => f.debug_tuple("Fixed").field(online).finish(),
            Online::Check(_) => f.write_str("Check(..)"),
        }
    }
}

/// Which result a read hands back when both stores could answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Returns {
    /// The persisted local snapshot.
    #[default]
    Local,
    /// The remote response.
    Remote,
}

/// Sync flags supplied by an operation or a collection.
///
/// Every field is optional; an unset field falls through to the next level.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Maintain and use the remote store.
    pub remote: Option<bool>,
    /// Maintain and use the persisted local store.
    pub local: Option<bool>,
    /// Keep both stores in sync.
    pub dual_sync: Option<bool>,
    /// Connectivity override.
    pub online: Option<Online>,
    /// Read return preference.
    pub returns: Option<Returns>,
}

impl SyncOptions {
    /// Creates options with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options enabling both stores.
    pub fn dual() -> Self {
        Self::new().with_local(true).with_remote(true)
    }

    /// Sets `remote`.
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets `local`.
    pub fn with_local(mut self, local: bool) -> Self {
        self.local = Some(local);
        self
    }

    /// Sets `dual_sync` explicitly.
    pub fn with_dual_sync(mut self, dual_sync: bool) -> Self {
        self.dual_sync = Some(dual_sync);
        self
    }

    /// Sets a fixed `online` value.
    pub fn with_online(mut self, online: bool) -> Self {
        self.online = Some(Online::Fixed(online));
        self
    }

    /// Sets an `online` predicate.
    pub fn with_online_check(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.online = Some(Online::check(f));
        self
    }

    /// Sets `returns`.
    pub fn with_returns(mut self, returns: Returns) -> Self {
        self.returns = Some(returns);
        self
    }
}

/// Effective flags of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Remote store participates.
    pub remote: bool,
    /// Local store participates.
    pub local: bool,
    /// Result of the connectivity check.
    pub online: bool,
    /// Dual mode was requested, whatever the connectivity.
    pub dual_configured: bool,
    /// Dual mode is in effect: requested and online.
    pub dual_sync: bool,
    /// Read return preference after the forcing rules.
    pub returns: Returns,
}

impl Policy {
    /// Resolves the flags of one operation.
    ///
    /// Operation values win over collection values, which win over the
    /// defaults (`remote`, not `local`, ambient connectivity, `Local`).
    /// `returns` is forced to `Remote` when the remote store is enabled and
    /// either the local record index is empty or dual mode is not in effect.
    pub fn resolve(
        operation: &SyncOptions,
        collection: &SyncOptions,
        connectivity: &Connectivity,
        local_empty: bool,
    ) -> Self {
        let remote = operation.remote.or(collection.remote).unwrap_or(true);
        let local = operation.local.or(collection.local).unwrap_or(false);
        let online = operation
            .online
            .as_ref()
            .or(collection.online.as_ref())
            .map(Online::evaluate)
            .unwrap_or_else(|| connectivity.is_online());
        let dual_configured = operation
            .dual_sync
            .or(collection.dual_sync)
            .unwrap_or(remote && local);
        let dual_sync = online && dual_configured;

        let returns = if remote && (local_empty || !dual_sync) {
            Returns::Remote
        } else {
            operation
                .returns
                .or(collection.returns)
                .unwrap_or_default()
        };

        Self {
            remote,
            local,
            online,
            dual_configured,
            dual_sync,
            returns,
        }
    }
}
