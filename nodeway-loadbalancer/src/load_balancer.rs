//! Loopback TCP load-balancer
//!
//! Listens on a local port and forwards every accepted connection to the
//! best available backend server, failing over in dial order when a server
//! cannot be reached.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nodeway_core::EndpointUrl;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::balancer::{Balancer, BalancerOptions, HealthCheckFunc};
use crate::dialer;
use crate::error::{Error, Result};
use crate::servers::ServerList;
use crate::state_file::{self, PersistedState};

/// Back-off after a failed `accept`
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Load-balancer for one logical backend service
pub struct LoadBalancer {
    service_name: String,
    server_url: EndpointUrl,
    local_address: SocketAddr,
    local_url: String,
    servers: Arc<ServerList>,
    state_file: PathBuf,
    persist: watch::Sender<Option<PersistedState>>,
}

impl LoadBalancer {
    /// Bind the local listener and start serving.
    ///
    /// The host:port of `server_url` is the initial default server. Any
    /// membership persisted under `data_dir` for the same `server_url` is
    /// restored.
    pub async fn new(
        cancel: CancellationToken,
        data_dir: &Path,
        service_name: &str,
        server_url: &str,
        local_port: u16,
        is_ipv6: bool,
        options: BalancerOptions,
    ) -> Result<Arc<Self>> {
        let server_url = EndpointUrl::parse(server_url)?;

        let loopback: IpAddr = if is_ipv6 {
            Ipv6Addr::LOCALHOST.into()
        } else {
            Ipv4Addr::LOCALHOST.into()
        };
        let bind_address = SocketAddr::new(loopback, local_port);
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|source| Error::Bind {
                address: bind_address,
                source,
            })?;
        let local_address = listener.local_addr()?;
        let local_url = server_url.with_authority(&local_address.to_string());

        let servers = Arc::new(ServerList::new(
            server_url.host_port(),
            options.failure_threshold,
            cancel.child_token(),
        ));

        let (persist, pending) = watch::channel(None);
        let lb = Arc::new(Self {
            service_name: service_name.to_string(),
            local_address,
            local_url,
            servers,
            state_file: state_file::path(data_dir, service_name),
            server_url,
            persist,
        });

        if let Some(addresses) = state_file::load(&lb.state_file, lb.server_url.as_str()).await {
            tracing::info!(
                service = %lb.service_name,
                servers = ?addresses,
                "Restored load balancer server addresses"
            );
            lb.servers.update(&addresses);
        }

        tokio::spawn(serve(
            listener,
            Arc::clone(&lb.servers),
            options.dial_timeout,
            lb.service_name.clone(),
            cancel.clone(),
        ));
        tokio::spawn(check_health(
            Arc::clone(&lb.servers),
            options.health_check_interval,
            cancel.clone(),
        ));
        tokio::spawn(write_state(
            pending,
            lb.state_file.clone(),
            lb.service_name.clone(),
            cancel,
        ));

        tracing::info!(
            service = %lb.service_name,
            local_url = %lb.local_url,
            server_url = %lb.server_url,
            "Load balancer started"
        );
        Ok(lb)
    }

    #[must_use]
    pub const fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Server list backing this balancer
    #[must_use]
    pub fn servers(&self) -> &ServerList {
        &self.servers
    }

    /// Queue the current membership for the writer task. Never touches
    /// disk; a newer snapshot replaces one not yet written.
    fn persist(&self) {
        let state = PersistedState {
            server_url: self.server_url.as_str().to_string(),
            server_addresses: self.servers.addresses(),
        };
        self.persist.send_replace(Some(state));
    }
}

impl Balancer for LoadBalancer {
    fn local_url(&self) -> String {
        self.local_url.clone()
    }

    fn update(&self, addresses: &[String]) {
        if self.servers.update(addresses) {
            tracing::info!(
                service = %self.service_name,
                servers = ?self.servers.addresses(),
                "Updated load balancer server addresses"
            );
            self.persist();
        }
    }

    fn set_health_check(&self, address: &str, health_check: HealthCheckFunc) {
        tracing::debug!(service = %self.service_name, server = %address, "Registered health check");
        self.servers.set_health_check(address, health_check);
    }

    fn set_default(&self, address: &str) {
        if self.servers.set_default(address) {
            tracing::info!(service = %self.service_name, default_server = %address, "Updated load balancer default server");
        }
    }
}

async fn serve(
    listener: TcpListener,
    servers: Arc<ServerList>,
    dial_timeout: Duration,
    service_name: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!(service = %service_name, "Load balancer shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(forward(
                        stream,
                        peer,
                        Arc::clone(&servers),
                        dial_timeout,
                        service_name.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(service = %service_name, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Write queued membership snapshots until `cancel` fires, flushing the last
/// pending one on the way out.
async fn write_state(
    mut pending: watch::Receiver<Option<PersistedState>>,
    path: PathBuf,
    service_name: String,
    cancel: CancellationToken,
) {
    loop {
        let stopping = tokio::select! {
            changed = pending.changed() => {
                if changed.is_err() {
                    return;
                }
                false
            }
            () = cancel.cancelled() => true,
        };

        if !stopping || pending.has_changed().unwrap_or(false) {
            let state = pending.borrow_and_update().clone();
            if let Some(state) = state {
                if let Err(e) = state_file::store(&path, &state).await {
                    tracing::warn!(
                        service = %service_name,
                        path = %path.display(),
                        error = %e,
                        "Failed to persist load balancer state"
                    );
                }
            }
        }

        if stopping {
            return;
        }
    }
}

async fn check_health(servers: Arc<ServerList>, every: Duration, cancel: CancellationToken) {
    let mut timer = interval(every);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = timer.tick() => servers.run_health_checks(),
        }
    }
}

/// Dial candidates in order; the first success wins.
async fn dial_any(
    servers: &ServerList,
    dial_timeout: Duration,
    service_name: &str,
) -> Option<(String, TcpStream, CancellationToken)> {
    for (address, closed) in servers.candidates() {
        match dialer::dial(&address, dial_timeout).await {
            Ok(stream) => {
                servers.record_success(&address);
                return Some((address, stream, closed));
            }
            Err(e) => {
                tracing::debug!(service = %service_name, server = %address, error = %e, "Dial failed");
                servers.record_failure(&address);
            }
        }
    }
    None
}

async fn forward(
    mut client: TcpStream,
    peer: SocketAddr,
    servers: Arc<ServerList>,
    dial_timeout: Duration,
    service_name: String,
) {
    let Some((address, mut upstream, closed)) = dial_any(&servers, dial_timeout, &service_name).await
    else {
        tracing::warn!(service = %service_name, client = %peer, "All servers failed, closing connection");
        return;
    };

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            if let Err(e) = result {
                tracing::debug!(service = %service_name, server = %address, error = %e, "Connection closed with error");
            }
        }
        () = closed.cancelled() => {
            tracing::debug!(service = %service_name, server = %address, client = %peer, "Closing connection to failed or removed server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options() -> BalancerOptions {
        BalancerOptions {
            dial_timeout: Duration::from_millis(500),
            health_check_interval: Duration::from_secs(60),
            failure_threshold: 1,
        }
    }

    /// Backend that answers every connection with `name`.
    async fn named_backend(name: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(name.as_bytes()).await;
            }
        });
        addr
    }

    async fn wait_for_state(path: &Path, server_url: &str) -> Option<Vec<String>> {
        for _ in 0..100 {
            if let Some(addresses) = state_file::load(path, server_url).await {
                return Some(addresses);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    fn dead_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    async fn read_through(lb: &LoadBalancer) -> String {
        let mut stream = TcpStream::connect(lb.local_address()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn test_ephemeral_port_and_local_url() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let lb = LoadBalancer::new(
            cancel.clone(),
            dir.path(),
            "svc",
            "https://10.0.0.1:9345",
            0,
            false,
            options(),
        )
        .await
        .unwrap();

        let port = lb.local_address().port();
        assert_ne!(port, 0);
        assert_eq!(lb.local_url(), format!("https://127.0.0.1:{port}"));
        assert_eq!(lb.servers().default_server(), "10.0.0.1:9345");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_invalid_server_url() {
        let dir = tempfile::tempdir().unwrap();
        let result = LoadBalancer::new(
            CancellationToken::new(),
            dir.path(),
            "svc",
            "not a url",
            0,
            false,
            options(),
        )
        .await;
        assert!(matches!(result, Err(Error::ServerUrl(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = LoadBalancer::new(
            CancellationToken::new(),
            dir.path(),
            "svc",
            "https://10.0.0.1:9345",
            port,
            false,
            options(),
        )
        .await;
        assert!(matches!(result, Err(Error::Bind { .. })));
    }

    #[tokio::test]
    async fn test_forwards_to_default_server() {
        let dir = tempfile::tempdir().unwrap();
        let backend = named_backend("server-a").await;
        let cancel = CancellationToken::new();
        let lb = LoadBalancer::new(
            cancel.clone(),
            dir.path(),
            "svc",
            &format!("https://{backend}"),
            0,
            false,
            options(),
        )
        .await
        .unwrap();

        assert_eq!(read_through(&lb).await, "server-a");
        assert_eq!(lb.servers().active(), Some(backend));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_fails_over_from_dead_server() {
        let dir = tempfile::tempdir().unwrap();
        let dead = dead_address();
        let live = named_backend("server-b").await;
        let cancel = CancellationToken::new();
        let lb = LoadBalancer::new(
            cancel.clone(),
            dir.path(),
            "svc",
            &format!("https://{dead}"),
            0,
            false,
            options(),
        )
        .await
        .unwrap();

        lb.update(&[dead.clone(), live.clone()]);
        assert_eq!(read_through(&lb).await, "server-b");
        assert_eq!(lb.servers().active(), Some(live));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_set_default_redirects_new_connections() {
        let dir = tempfile::tempdir().unwrap();
        let first = named_backend("first").await;
        let second = named_backend("second").await;
        let cancel = CancellationToken::new();
        let lb = LoadBalancer::new(
            cancel.clone(),
            dir.path(),
            "svc",
            &format!("https://{first}"),
            0,
            false,
            options(),
        )
        .await
        .unwrap();

        assert_eq!(read_through(&lb).await, "first");
        lb.set_default(&second);
        assert_eq!(read_through(&lb).await, "second");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_update_persists_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let addresses = vec!["10.0.0.1:9345".to_string(), "10.0.0.2:9345".to_string()];

        let lb = LoadBalancer::new(
            cancel.clone(),
            dir.path(),
            "svc",
            "https://10.0.0.1:9345",
            0,
            false,
            options(),
        )
        .await
        .unwrap();
        lb.update(&addresses);
        cancel.cancel();
        let path = state_file::path(dir.path(), "svc");
        assert_eq!(
            wait_for_state(&path, "https://10.0.0.1:9345").await,
            Some(addresses.clone())
        );

        let restored = LoadBalancer::new(
            CancellationToken::new(),
            dir.path(),
            "svc",
            "https://10.0.0.1:9345",
            0,
            false,
            options(),
        )
        .await
        .unwrap();
        assert_eq!(restored.servers().addresses(), addresses);
    }

    #[tokio::test]
    async fn test_update_leaves_disk_to_writer_task() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let lb = LoadBalancer::new(
            cancel.clone(),
            dir.path(),
            "svc",
            "https://10.0.0.1:9345",
            0,
            false,
            options(),
        )
        .await
        .unwrap();
        let path = state_file::path(dir.path(), "svc");
        let addresses = vec!["10.0.0.2:9345".to_string()];

        // Single-threaded runtime: nothing else runs until this task yields.
        lb.update(&addresses);
        assert!(!path.exists());
        assert_eq!(lb.servers().addresses(), addresses);

        assert_eq!(wait_for_state(&path, "https://10.0.0.1:9345").await, Some(addresses));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_update_with_unwritable_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        // `etc` is a file, so the state directory cannot be created
        std::fs::write(dir.path().join("etc"), b"").unwrap();
        let cancel = CancellationToken::new();
        let lb = LoadBalancer::new(
            cancel.clone(),
            dir.path(),
            "svc",
            "https://10.0.0.1:9345",
            0,
            false,
            options(),
        )
        .await
        .unwrap();

        lb.update(&["10.0.0.2:9345".to_string()]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        lb.update(&["10.0.0.3:9345".to_string()]);

        assert_eq!(lb.servers().addresses(), vec!["10.0.0.3:9345".to_string()]);
        assert!(!state_file::path(dir.path(), "svc").exists());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_ipv6_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        // Hosts without IPv6 loopback cannot run this test.
        let Ok(lb) = LoadBalancer::new(
            cancel.clone(),
            dir.path(),
            "svc",
            "https://[fd00::1]:9345",
            0,
            true,
            options(),
        )
        .await
        else {
            return;
        };

        let port = lb.local_address().port();
        assert_eq!(lb.local_url(), format!("https://[::1]:{port}"));
        assert_eq!(lb.servers().default_server(), "[fd00::1]:9345");
        cancel.cancel();
    }
}
