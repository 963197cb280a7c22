//! Recording fakes for the load-balancer seam

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nodeway_loadbalancer::{Balancer, BalancerFactory, HealthCheckFunc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Base of the ports handed out for ephemeral requests
const FAKE_EPHEMERAL_BASE: u16 = 40000;

/// A `Balancer` that records every call made on it
pub struct FakeBalancer {
    pub service_name: String,
    pub server_url: String,
    pub data_dir: PathBuf,
    pub requested_port: u16,
    pub is_ipv6: bool,
    local_url: String,
    updates: Mutex<Vec<Vec<String>>>,
    health_checks: Mutex<Vec<String>>,
    defaults: Mutex<Vec<String>>,
}

impl FakeBalancer {
    pub fn updates(&self) -> Vec<Vec<String>> {
        self.updates.lock().clone()
    }

    pub fn last_update(&self) -> Option<Vec<String>> {
        self.updates.lock().last().cloned()
    }

    pub fn health_checks(&self) -> Vec<String> {
        self.health_checks.lock().clone()
    }

    pub fn defaults(&self) -> Vec<String> {
        self.defaults.lock().clone()
    }
}

impl Balancer for FakeBalancer {
    fn local_url(&self) -> String {
        self.local_url.clone()
    }

    fn update(&self, addresses: &[String]) {
        self.updates.lock().push(addresses.to_vec());
    }

    fn set_health_check(&self, address: &str, _health_check: HealthCheckFunc) {
        self.health_checks.lock().push(address.to_string());
    }

    fn set_default(&self, address: &str) {
        self.defaults.lock().push(address.to_string());
    }
}

/// Factory producing `FakeBalancer`s, optionally failing for one service
#[derive(Default)]
pub struct FakeBalancerFactory {
    created: Mutex<Vec<Arc<FakeBalancer>>>,
    fail_service: Mutex<Option<String>>,
    next_ephemeral: AtomicU16,
}

impl FakeBalancerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every `create` for `service_name` fail until cleared.
    pub fn fail_for(&self, service_name: Option<&str>) {
        *self.fail_service.lock() = service_name.map(str::to_string);
    }

    pub fn created(&self) -> Vec<Arc<FakeBalancer>> {
        self.created.lock().clone()
    }

    pub fn find(&self, service_name: &str) -> Option<Arc<FakeBalancer>> {
        self.created
            .lock()
            .iter()
            .find(|lb| lb.service_name == service_name)
            .cloned()
    }
}

#[async_trait]
impl BalancerFactory for FakeBalancerFactory {
    async fn create(
        &self,
        _cancel: &CancellationToken,
        data_dir: &Path,
        service_name: &str,
        server_url: &str,
        local_port: u16,
        is_ipv6: bool,
    ) -> nodeway_loadbalancer::Result<Arc<dyn Balancer>> {
        let port = if local_port == 0 {
            FAKE_EPHEMERAL_BASE + self.next_ephemeral.fetch_add(1, Ordering::Relaxed)
        } else {
            local_port
        };

        if self.fail_service.lock().as_deref() == Some(service_name) {
            return Err(nodeway_loadbalancer::Error::Bind {
                address: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }

        let lb = Arc::new(FakeBalancer {
            service_name: service_name.to_string(),
            server_url: server_url.to_string(),
            data_dir: data_dir.to_path_buf(),
            requested_port: local_port,
            is_ipv6,
            local_url: format!("https://127.0.0.1:{port}"),
            updates: Mutex::new(Vec::new()),
            health_checks: Mutex::new(Vec::new()),
            defaults: Mutex::new(Vec::new()),
        });
        self.created.lock().push(Arc::clone(&lb));
        Ok(lb)
    }
}
