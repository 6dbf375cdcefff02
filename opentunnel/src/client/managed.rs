// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Self-registering client that terminates TLS locally for its own hostname

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as AnyhowContext;
use arc_swap::ArcSwapOption;
use tokio::{
  net::{TcpListener, TcpStream},
  sync::broadcast::{channel as event_channel, error::RecvError, Receiver, Sender as Broadcaster},
  task::JoinHandle,
  time::MissedTickBehavior,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{
  certificates::{CertificateBundle, CertificateIssuer, ChallengeResponder},
  registrar::HostnameRegistrar,
  session::ClientSessionConfig,
  state::StateStore,
  tunnel::{ClientTunnel, ClientTunnelConfig, ClientTunnelHandle, TunnelEvent},
};
use crate::{
  util::{
    backoff::{retry_with_backoff, BackoffPolicy},
    dropkick::Dropkick,
    unix_time_secs,
  },
};

#[derive(Debug, Clone)]
pub struct ManagedTunnelConfig {
  /// Relay backend address, as `host:port`
  pub relay: String,
  /// Plain TCP service that decrypted connections are forwarded to
  pub service: SocketAddr,
  pub backoff: BackoffPolicy,
  pub renewal_check_interval: Duration,
  pub renewal_threshold: Duration,
}

impl ManagedTunnelConfig {
  pub fn new(relay: impl Into<String>, service: SocketAddr) -> Self {
    Self {
      relay: relay.into(),
      service,
      backoff: BackoffPolicy::default(),
      renewal_check_interval: Duration::from_secs(60 * 60),
      renewal_threshold: Duration::from_secs(7 * 24 * 60 * 60),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedEvent {
  Connected,
  Disconnected,
  /// A certificate is installed and the tunnel is serving `host`
  Ready { host: String },
}

type SharedAcceptor = Arc<ArcSwapOption<TlsAcceptor>>;

pub struct ManagedTunnel {
  config: ManagedTunnelConfig,
  registrar: Arc<dyn HostnameRegistrar>,
  issuer: Arc<dyn CertificateIssuer>,
  store: Arc<dyn StateStore>,
  events: Broadcaster<ManagedEvent>,
}

pub struct ManagedTunnelHandle {
  host: String,
  endpoint: SocketAddr,
  events: Broadcaster<ManagedEvent>,
  stop: Dropkick<CancellationToken>,
  tunnel: ClientTunnelHandle,
  tasks: Vec<JoinHandle<()>>,
}

impl ManagedTunnelHandle {
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Local TLS endpoint that tunneled connections are delivered to
  pub fn endpoint(&self) -> SocketAddr {
    self.endpoint
  }

  pub fn events(&self) -> Receiver<ManagedEvent> {
    self.events.subscribe()
  }

  pub async fn stop(self) {
    let ManagedTunnelHandle { stop, tunnel, tasks, .. } = self;
    stop.kick();
    tunnel.stop().await;
    futures::future::join_all(tasks).await;
  }
}

impl ManagedTunnel {
  pub fn new(
    config: ManagedTunnelConfig,
    registrar: Arc<dyn HostnameRegistrar>,
    issuer: Arc<dyn CertificateIssuer>,
    store: Arc<dyn StateStore>,
  ) -> Self {
    let (events, _) = event_channel(16);
    Self {
      config,
      registrar,
      issuer,
      store,
      events,
    }
  }

  pub fn events(&self) -> Receiver<ManagedEvent> {
    self.events.subscribe()
  }

  /// Restores or registers a hostname, then starts tunneling to a local TLS endpoint for it
  #[tracing::instrument(skip_all, fields(role = "managed", relay = %self.config.relay))]
  pub async fn start(self) -> anyhow::Result<ManagedTunnelHandle> {
    let state = self.store.load().await.context("Failed to load persisted state")?;
    let account_key = match state.account_key {
      Some(account_key) => account_key,
      None => {
        let account_key = self
          .issuer
          .create_account_key()
          .context("Failed to create an account key")?;
        self
          .store
          .account_key_created(&account_key)
          .await
          .context("Failed to persist the account key")?;
        account_key
      }
    };
    let registration = match state.registration {
      Some(registration) => {
        tracing::info!(host = %registration.host, "Reusing registered hostname");
        registration
      }
      None => {
        let registrar = self.registrar.clone();
        let registration = retry_with_backoff(self.config.backoff, "register hostname", || registrar.register())
          .await
          .context("Hostname registration failed")?;
        tracing::info!(host = %registration.host, "Registered hostname");
        self
          .store
          .hostname_registered(&registration)
          .await
          .context("Failed to persist the registration")?;
        registration
      }
    };

    let listener = TcpListener::bind("127.0.0.1:0")
      .await
      .context("Failed to bind the local TLS endpoint")?;
    let endpoint = listener.local_addr()?;
    let acceptor: SharedAcceptor = Arc::new(ArcSwapOption::empty());
    let challenges = ChallengeResponder::default();
    let stop = CancellationToken::new();

    let tunnel_config = ClientTunnelConfig::new(
      self.config.relay.clone(),
      registration.token.clone().into_bytes(),
      ClientSessionConfig::new(endpoint),
    );
    let tunnel = ClientTunnel::new(tunnel_config, Arc::new(challenges.clone()));
    let tunnel_events = tunnel.events();
    let tunnel = tunnel.start();

    let endpoint_task = tokio::task::spawn(
      serve_endpoint(listener, acceptor.clone(), self.config.service, stop.child_token())
        .instrument(tracing::debug_span!("tls_endpoint", %endpoint)),
    );
    let host = registration.host.clone();
    let supervisor = Supervisor {
      host: host.clone(),
      account_key,
      certificate: state.certificate,
      challenges,
      acceptor,
      config: self.config,
      issuer: self.issuer,
      store: self.store,
      events: self.events.clone(),
    };
    let supervisor_task = tokio::task::spawn(supervisor.run(tunnel_events, stop.child_token()).in_current_span());

    Ok(ManagedTunnelHandle {
      host,
      endpoint,
      events: self.events,
      stop: Dropkick::new(stop),
      tunnel,
      tasks: vec![endpoint_task, supervisor_task],
    })
  }
}

struct Supervisor {
  host: String,
  account_key: String,
  certificate: Option<CertificateBundle>,
  challenges: ChallengeResponder,
  acceptor: SharedAcceptor,
  config: ManagedTunnelConfig,
  issuer: Arc<dyn CertificateIssuer>,
  store: Arc<dyn StateStore>,
  events: Broadcaster<ManagedEvent>,
}

impl Supervisor {
  async fn run(mut self, mut tunnel_events: Receiver<TunnelEvent>, stop: CancellationToken) {
    let mut ready = false;
    let mut renewal = tokio::time::interval_at(
      tokio::time::Instant::now() + self.config.renewal_check_interval,
      self.config.renewal_check_interval,
    );
    renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        biased;
        _ = stop.cancelled() => break,
        event = tunnel_events.recv() => match event {
          Ok(TunnelEvent::Connected) => {
            let _ = self.events.send(ManagedEvent::Connected);
            if !ready {
              match self.ensure_certificate().await {
                Ok(()) => {
                  ready = true;
                  tracing::info!(host = %self.host, "Managed tunnel ready");
                  let _ = self.events.send(ManagedEvent::Ready { host: self.host.clone() });
                }
                Err(error) => tracing::warn!(%error, "No certificate could be installed"),
              }
            }
          }
          Ok(TunnelEvent::Disconnected) => {
            let _ = self.events.send(ManagedEvent::Disconnected);
          }
          Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Missed tunnel events"),
          Err(RecvError::Closed) => break,
        },
        _ = renewal.tick(), if ready => {
          if let Err(error) = self.renew_if_expiring().await {
            tracing::warn!(%error, "Certificate renewal failed");
          }
        }
      }
    }
  }

  /// Installs the persisted certificate if it still serves this host, otherwise issues a new one
  async fn ensure_certificate(&mut self) -> anyhow::Result<()> {
    // The held certificate is only replaced by a successful install
    let reusable = self
      .certificate
      .as_ref()
      .filter(|certificate| certificate.is_usable_for(&self.host, unix_time_secs()))
      .cloned();
    let certificate = match reusable {
      Some(certificate) => {
        tracing::debug!("Reusing persisted certificate");
        certificate
      }
      None => self.issue().await?,
    };
    self.install(certificate)
  }

  async fn renew_if_expiring(&mut self) -> anyhow::Result<()> {
    let expiring = match &self.certificate {
      Some(certificate) => certificate.info()?.expires_within(self.config.renewal_threshold, unix_time_secs()),
      None => true,
    };
    if expiring {
      tracing::info!(host = %self.host, "Renewing certificate");
      let certificate = self.issue().await?;
      self.install(certificate)?;
    }
    Ok(())
  }

  async fn issue(&self) -> anyhow::Result<CertificateBundle> {
    let issuer = self.issuer.clone();
    let (host, account_key, challenges) = (self.host.clone(), self.account_key.clone(), self.challenges.clone());
    let certificate = retry_with_backoff(self.config.backoff, "issue certificate", || {
      issuer.issue(&host, &account_key, challenges.clone())
    })
    .await
    .context("Certificate issuance failed")?;
    self
      .store
      .certificate_updated(&certificate)
      .await
      .context("Failed to persist the certificate")?;
    tracing::info!(host = %self.host, "Certificate updated");
    Ok(certificate)
  }

  fn install(&mut self, certificate: CertificateBundle) -> anyhow::Result<()> {
    let acceptor = certificate.tls_acceptor()?;
    self.acceptor.store(Some(Arc::new(acceptor)));
    self.certificate = Some(certificate);
    Ok(())
  }
}

/// Terminates TLS for tunneled connections and forwards the plaintext to `service`
async fn serve_endpoint(listener: TcpListener, acceptor: SharedAcceptor, service: SocketAddr, stop: CancellationToken) {
  loop {
    let (stream, peer) = tokio::select! {
      _ = stop.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok(accepted) => accepted,
        Err(error) => {
          tracing::warn!(%error, "Failed to accept tunneled connection");
          continue;
        }
      },
    };
    let acceptor = match acceptor.load_full() {
      Some(acceptor) => acceptor,
      None => {
        tracing::debug!("Dropping connection received before a certificate was installed");
        continue;
      }
    };
    let stop = stop.clone();
    tokio::task::spawn(
      async move {
        let mut tls = match acceptor.accept(stream).await {
          Ok(tls) => tls,
          Err(error) => {
            tracing::debug!(%error, "TLS handshake failed");
            return;
          }
        };
        let mut upstream = match TcpStream::connect(service).await {
          Ok(upstream) => upstream,
          Err(error) => {
            tracing::info!(%error, %service, "Local service unreachable");
            return;
          }
        };
        tokio::select! {
          _ = stop.cancelled() => (),
          copied = tokio::io::copy_bidirectional(&mut tls, &mut upstream) => match copied {
            Ok((sent, received)) => tracing::trace!(sent, received, "Connection finished"),
            Err(error) => tracing::debug!(%error, "Connection failed"),
          },
        }
      }
      .instrument(tracing::trace_span!("tls", %peer)),
    );
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  };

  use futures::future::{BoxFuture, FutureExt};
  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::broadcast::Receiver,
  };

  use super::{ManagedEvent, ManagedTunnel, ManagedTunnelConfig, Supervisor};
  use crate::{
    client::{
      certificates::{CertificateBundle, CertificateError, CertificateIssuer, ChallengeResponder, SelfSignedIssuer},
      registrar::{HostnameRegistrar, RegistrationError},
      state::{FileStateStore, StateStore},
    },
    common::protocol::ClientHandshake,
    registrator::Registration,
    util::{backoff::BackoffPolicy, framed::FramedTransport},
  };

  #[derive(Default)]
  struct CountingRegistrar {
    calls: AtomicUsize,
  }

  impl HostnameRegistrar for CountingRegistrar {
    fn register(&self) -> BoxFuture<'static, Result<Registration, RegistrationError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      async {
        Ok(Registration {
          host: "managed.example.com".into(),
          token: "managed-token".into(),
        })
      }
      .boxed()
    }
  }

  struct RefusingIssuer;

  impl CertificateIssuer for RefusingIssuer {
    fn create_account_key(&self) -> Result<String, CertificateError> {
      Err(CertificateError::Refused("offline".into()))
    }

    fn issue(
      &self,
      _host: &str,
      _account_key: &str,
      _challenges: ChallengeResponder,
    ) -> BoxFuture<'static, Result<CertificateBundle, CertificateError>> {
      async { Err(CertificateError::Refused("offline".into())) }.boxed()
    }
  }

  async fn next_event(events: &mut Receiver<ManagedEvent>) -> ManagedEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
      .await
      .expect("Event must arrive")
      .unwrap()
  }

  fn tls_connector(certificate_pem: &str) -> tokio_rustls::TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for certificate in rustls_pemfile::certs(&mut certificate_pem.as_bytes()).unwrap() {
      roots.add(&rustls::Certificate(certificate)).unwrap();
    }
    let config = rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_root_certificates(roots)
      .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
  }

  #[tokio::test]
  async fn registers_certifies_and_serves_locally() {
    let state = tempfile::tempdir().unwrap();
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let registrar = Arc::new(CountingRegistrar::default());
    let store = Arc::new(FileStateStore::new(state.path()));
    let config = ManagedTunnelConfig::new(relay.local_addr().unwrap().to_string(), service.local_addr().unwrap());
    let managed = ManagedTunnel::new(config.clone(), registrar.clone(), Arc::new(SelfSignedIssuer::default()), store.clone());
    let mut events = managed.events();
    let handle = managed.start().await.unwrap();
    assert_eq!(handle.host(), "managed.example.com");

    let (link, _) = relay.accept().await.unwrap();
    let mut link = FramedTransport::new(link, None);
    let handshake = ClientHandshake::decode(&link.next_frame().await.unwrap().unwrap()).unwrap();
    assert_eq!(handshake.token, b"managed-token");
    assert_eq!(next_event(&mut events).await, ManagedEvent::Connected);
    assert_eq!(
      next_event(&mut events).await,
      ManagedEvent::Ready {
        host: "managed.example.com".into()
      }
    );

    let persisted = store.load().await.unwrap();
    let certificate = persisted.certificate.expect("Certificate must be persisted");
    assert!(persisted.account_key.is_some());
    let connector = tls_connector(&certificate.certificate);
    let tcp = TcpStream::connect(handle.endpoint()).await.unwrap();
    let server_name = rustls::ServerName::try_from("managed.example.com").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.unwrap();
    tls.write_all(b"ping").await.unwrap();
    let (mut local, _) = service.accept().await.unwrap();
    let mut received = [0u8; 4];
    local.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"ping");
    local.write_all(b"pong").await.unwrap();
    tls.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"pong");

    handle.stop().await;
    drop(link);

    let restarted = ManagedTunnel::new(config, registrar.clone(), Arc::new(SelfSignedIssuer::default()), store.clone());
    let handle = restarted.start().await.unwrap();
    assert_eq!(handle.host(), "managed.example.com");
    assert_eq!(registrar.calls.load(Ordering::SeqCst), 1, "Registration is reused after restart");
    handle.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn failed_issuance_keeps_the_held_certificate() {
    let state = tempfile::tempdir().unwrap();
    let other_host = SelfSignedIssuer::default()
      .issue("elsewhere.example.com", "", ChallengeResponder::default())
      .await
      .unwrap();
    let mut config = ManagedTunnelConfig::new("127.0.0.1:1", "127.0.0.1:1".parse().unwrap());
    config.backoff = BackoffPolicy {
      max_failures: 2,
      ..BackoffPolicy::default()
    };
    let (events, _) = tokio::sync::broadcast::channel(4);
    let mut supervisor = Supervisor {
      host: "managed.example.com".into(),
      account_key: String::new(),
      certificate: Some(other_host.clone()),
      challenges: ChallengeResponder::default(),
      acceptor: Default::default(),
      config,
      issuer: Arc::new(RefusingIssuer),
      store: Arc::new(FileStateStore::new(state.path())),
      events,
    };
    assert!(supervisor.ensure_certificate().await.is_err());
    assert_eq!(
      supervisor.certificate.as_ref(),
      Some(&other_host),
      "A failed issuance must not discard the held certificate"
    );
    assert!(supervisor.acceptor.load().is_none());
  }
}
