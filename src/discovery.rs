//! Service discovery collaborators.
//!
//! The endpoint service advertises itself through a [`ServiceAdvertiser`];
//! clients targeting a name rather than an address find it through a
//! [`ServiceResolver`]. Real deployments plug in a network discovery system.
//! [`LocalDirectory`] implements both sides inside one process, which is
//! enough for tests and single-host setups.
//!
//! # Example
//!
//! ```
//! use peerwire::discovery::{LocalDirectory, ServiceAdvertiser, ServiceResolver};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let directory = LocalDirectory::new();
//! let name = directory.advertise("chat", "_chat._tcp", 4000).await.unwrap();
//! let addr = directory.resolve(&name, "_chat._tcp").await.unwrap();
//! assert_eq!(addr.port(), 4000);
//! # });
//! ```

use std::collections::HashMap;
use std::future::{ready, Future};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{PeerwireError, Result};

/// Boxed future returned by the discovery traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Publishes a listening port under a discoverable name.
pub trait ServiceAdvertiser: Send + Sync + 'static {
    /// Advertise `name` of `service_type` on `port`.
    ///
    /// Resolves to the public name, which may differ from `name` if the
    /// directory had to disambiguate it.
    fn advertise(&self, name: &str, service_type: &str, port: u16) -> BoxFuture<'static, Result<String>>;

    /// Withdraw a name previously returned by `advertise`.
    fn withdraw(&self, name: &str) -> BoxFuture<'static, Result<()>>;
}

/// Turns a discoverable name into a connectable address.
pub trait ServiceResolver: Send + Sync + 'static {
    fn resolve(&self, name: &str, service_type: &str) -> BoxFuture<'static, Result<SocketAddr>>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    /// public name -> (service type, address)
    entries: HashMap<String, (String, SocketAddr)>,
}

/// In-process directory implementing both discovery traits.
///
/// Clones share the same entries.
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    host: IpAddr,
    state: Arc<Mutex<DirectoryState>>,
}

impl LocalDirectory {
    /// Directory that publishes addresses on `127.0.0.1`.
    pub fn new() -> Self {
        Self::with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Directory that publishes addresses on `host`.
    pub fn with_host(host: IpAddr) -> Self {
        Self {
            host,
            state: Arc::new(Mutex::new(DirectoryState::default())),
        }
    }

    /// Number of names currently advertised.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `name` is currently advertised.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().entries.contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, name: &str, service_type: &str, port: u16) -> String {
        let mut state = self.lock();
        let mut public = name.to_string();
        let mut suffix = 2;
        while state.entries.contains_key(&public) {
            public = format!("{} ({})", name, suffix);
            suffix += 1;
        }
        state.entries.insert(
            public.clone(),
            (service_type.to_string(), SocketAddr::new(self.host, port)),
        );
        public
    }
}

impl Default for LocalDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceAdvertiser for LocalDirectory {
    fn advertise(&self, name: &str, service_type: &str, port: u16) -> BoxFuture<'static, Result<String>> {
        let public = self.insert(name, service_type, port);
        tracing::debug!(name = %public, service_type, port, "advertised");
        Box::pin(ready(Ok(public)))
    }

    fn withdraw(&self, name: &str) -> BoxFuture<'static, Result<()>> {
        let removed = self.lock().entries.remove(name).is_some();
        if removed {
            tracing::debug!(name, "withdrawn");
        }
        Box::pin(ready(Ok(())))
    }
}

impl ServiceResolver for LocalDirectory {
    fn resolve(&self, name: &str, service_type: &str) -> BoxFuture<'static, Result<SocketAddr>> {
        let result = match self.lock().entries.get(name) {
            Some((kind, addr)) if kind == service_type => Ok(*addr),
            _ => Err(PeerwireError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no service {:?} of type {:?}", name, service_type),
            ))),
        };
        Box::pin(ready(result))
    }
}
