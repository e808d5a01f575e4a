//! Connection session
//!
//! One open-command-close cycle with a single device.
//!
//! ```text
//! Idle → Connecting → DiscoveringServices → Subscribed → Active → Closing → Idle
//!             └──────────────┴──→ Failed → Idle
//! ```
//!
//! Every transition is written to the fleet registry through the
//! [`DeviceReporter`], which emits the connected flag upward.
//!
//! A close requested while the session is still being set up is honored
//! at the next step boundary: the link is torn down before the opening
//! command is ever written.

use crate::domain::error::SessionError;
use crate::domain::fleet::DeviceReporter;
use crate::domain::models::SessionState;
use crate::domain::ports::ServerClock;
use crate::infrastructure::bluetooth::assembler::LineAssembler;
use crate::infrastructure::bluetooth::handlers::{CommandHandler, HandlerStep};
use crate::infrastructure::bluetooth::transport::{Chunker, Connector, UartLink};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Requests delivered into a running exchange from outside.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionControl {
    /// Write another command on the open link
    Write(String),
    /// Force disconnect
    Close,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub chunk_size: usize,
    /// No notification for this long fails the exchange
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::infrastructure::bluetooth::protocol::CHUNK_SIZE,
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

pub struct Session<L: UartLink> {
    link: L,
    reporter: DeviceReporter,
    chunker: Chunker,
    assembler: LineAssembler,
    idle_timeout: Option<Duration>,
    /// Writes requested before the exchange started
    deferred: Vec<String>,
}

/// Drain requests that arrived ahead of the exchange. Writes are kept for
/// later; a close cancels.
fn drain_early(
    control: &mut mpsc::UnboundedReceiver<SessionControl>,
    deferred: &mut Vec<String>,
) -> Result<(), SessionError> {
    while let Ok(request) = control.try_recv() {
        match request {
            SessionControl::Write(text) => deferred.push(text),
            SessionControl::Close => return Err(SessionError::Cancelled),
        }
    }
    Ok(())
}

impl<L: UartLink> Session<L> {
    /// Connect, resolve the UART endpoints and subscribe. The caller must
    /// already hold the device's session slot (state `Connecting`).
    ///
    /// On failure the device passes through `Failed` back to `Idle`. A close
    /// found on `control` between steps tears the link down and returns
    /// `Cancelled`.
    pub async fn open<C>(
        connector: &C,
        reporter: DeviceReporter,
        config: SessionConfig,
        control: &mut mpsc::UnboundedReceiver<SessionControl>,
    ) -> Result<Self, SessionError>
    where
        C: Connector<Link = L>,
    {
        let device = reporter.device().to_string();
        let mut deferred = Vec::new();
        debug!(device = %device, "Connecting");

        let mut link = match connector.connect(&device).await {
            Ok(link) => link,
            Err(e) => {
                warn!(device = %device, "Connection failed: {}", e);
                Self::fail(&reporter);
                return Err(e);
            }
        };

        if drain_early(control, &mut deferred).is_err() {
            return Err(Self::cancel(link, &reporter).await);
        }

        reporter.session_state(SessionState::DiscoveringServices);
        let ready = match link.discover().await {
            Ok(()) => link.subscribe().await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            warn!(device = %device, "Session setup failed: {}", e);
            if let Err(disconnect_err) = link.disconnect().await {
                warn!(device = %device, "Teardown after failed setup: {}", disconnect_err);
            }
            Self::fail(&reporter);
            return Err(e);
        }
        if drain_early(control, &mut deferred).is_err() {
            return Err(Self::cancel(link, &reporter).await);
        }

        reporter.session_state(SessionState::Subscribed);
        info!(device = %device, "Connected");
        Ok(Self {
            link,
            reporter,
            chunker: Chunker::new(config.chunk_size),
            assembler: LineAssembler::new(),
            idle_timeout: config.idle_timeout,
            deferred,
        })
    }

    fn fail(reporter: &DeviceReporter) {
        reporter.session_state(SessionState::Failed);
        reporter.session_state(SessionState::Idle);
    }

    async fn cancel(mut link: L, reporter: &DeviceReporter) -> SessionError {
        info!(device = %reporter.device(), "Close requested during setup");
        if let Err(e) = link.disconnect().await {
            warn!(device = %reporter.device(), "Disconnect failed: {}", e);
        }
        reporter.session_state(SessionState::Idle);
        SessionError::Cancelled
    }

    /// Run one command exchange until the handler completes it, the quiet
    /// period elapses, the link drops, the idle timeout fires or a close is
    /// requested.
    pub async fn exchange(
        &mut self,
        handler: &mut dyn CommandHandler,
        control: &mut mpsc::UnboundedReceiver<SessionControl>,
        clock: &dyn ServerClock,
    ) -> Result<(), SessionError> {
        drain_early(control, &mut self.deferred)?;
        self.reporter.session_state(SessionState::Active);
        self.assembler.reset();

        let opening = handler.opening(clock.now_ms());
        debug!(device = %self.reporter.device(), command = %opening, "Writing");
        self.chunker.send(&mut self.link, &opening).await?;
        for text in std::mem::take(&mut self.deferred) {
            self.chunker.send(&mut self.link, &text).await?;
        }

        let quiet = handler.quiet_period();
        let idle = self.idle_timeout;
        let deadline = |period: Option<Duration>| {
            period.map(|p| Instant::now() + p).unwrap_or_else(far_future)
        };
        let mut quiet_deadline = deadline(quiet);
        let mut idle_deadline = deadline(idle);

        loop {
            tokio::select! {
                fragment = self.link.next_fragment() => {
                    let Some(fragment) = fragment else {
                        return Err(SessionError::LinkLost);
                    };
                    quiet_deadline = deadline(quiet);
                    idle_deadline = deadline(idle);

                    for line in self.assembler.feed(&fragment) {
                        match handler.on_line(&line, clock.now_ms()) {
                            HandlerStep::Continue => {}
                            HandlerStep::Send(text) => {
                                self.chunker.send(&mut self.link, &text).await?;
                            }
                            HandlerStep::Done => return Ok(()),
                        }
                    }
                }
                Some(request) = control.recv() => match request {
                    SessionControl::Write(text) => {
                        self.chunker.send(&mut self.link, &text).await?;
                    }
                    SessionControl::Close => {
                        debug!(device = %self.reporter.device(), "Close requested");
                        return if handler.completes_on_close() {
                            Ok(())
                        } else {
                            Err(SessionError::Cancelled)
                        };
                    }
                },
                _ = sleep_until(quiet_deadline), if quiet.is_some() => return Ok(()),
                _ = sleep_until(idle_deadline), if idle.is_some() => {
                    let ms = idle.map(|d| d.as_millis() as u64).unwrap_or_default();
                    return Err(SessionError::Timeout(ms));
                }
            }
        }
    }

    /// Disconnect and return the device to `Idle`. Disconnect failures are
    /// only logged.
    pub async fn close(mut self) {
        self.reporter.session_state(SessionState::Closing);
        if let Err(e) = self.link.disconnect().await {
            warn!(device = %self.reporter.device(), "Disconnect failed: {}", e);
        }
        self.reporter.session_state(SessionState::Idle);
        info!(device = %self.reporter.device(), "Disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::MissingEndpoint;
    use crate::domain::fleet::{lock, FleetRegistry, SharedRegistry};
    use crate::domain::models::Sighting;
    use crate::infrastructure::bluetooth::handlers::SimpleCommand;
    use crate::infrastructure::bluetooth::mock::{FixedClock, MockConnector, Reply};

    const DEVICE: &str = "Bangle.js 1a2b";

    fn registry() -> SharedRegistry {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = FleetRegistry::new(true, vec!["Bangle.js".to_string()], tx);
        registry.observe(&Sighting {
            name: DEVICE.to_string(),
            rssi: None,
            state_code: None,
        });
        registry.begin_session(DEVICE).unwrap();
        registry.into_shared()
    }

    fn state(registry: &SharedRegistry) -> SessionState {
        lock(registry).session_state(DEVICE).unwrap()
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        let registry = registry();
        let connector = MockConnector::silent().failing_connect();
        let reporter = DeviceReporter::new(registry.clone(), DEVICE);
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let result = Session::open(&connector, reporter, SessionConfig::default(), &mut rx).await;
        assert!(matches!(result, Err(SessionError::ConnectFailed(_))));
        assert_eq!(state(&registry), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_missing_endpoint_tears_down() {
        let registry = registry();
        let connector = MockConnector::silent().missing(MissingEndpoint::Tx);
        let reporter = DeviceReporter::new(registry.clone(), DEVICE);
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let result = Session::open(&connector, reporter, SessionConfig::default(), &mut rx).await;
        assert!(matches!(
            result,
            Err(SessionError::ServiceDiscoveryFailed(MissingEndpoint::Tx))
        ));
        assert_eq!(connector.log().disconnects, 1);
        assert_eq!(state(&registry), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_completes_exchange() {
        let registry = registry();
        let connector = MockConnector::new(|_| Reply::lines(&["one", "two"]));
        let reporter = DeviceReporter::new(registry.clone(), DEVICE);
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::open(&connector, reporter, SessionConfig::default(), &mut rx)
            .await
            .unwrap();
        let mut handler = SimpleCommand::new("print(1)", false, Duration::from_millis(1000));
        let started = Instant::now();
        session
            .exchange(&mut handler, &mut rx, &FixedClock::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(state(&registry), SessionState::Active);

        session.close().await;
        assert_eq!(state(&registry), SessionState::Idle);
        assert_eq!(connector.log().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let registry = registry();
        let connector = MockConnector::silent();
        let reporter = DeviceReporter::new(registry, DEVICE);
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(500)),
            ..SessionConfig::default()
        };
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::open(&connector, reporter, config, &mut rx)
            .await
            .unwrap();
        let mut handler = crate::infrastructure::bluetooth::handlers::IdentityQuery::new();
        let result = session
            .exchange(&mut handler, &mut rx, &FixedClock::default())
            .await;
        assert_eq!(result, Err(SessionError::Timeout(500)));
    }

    #[tokio::test]
    async fn test_link_lost() {
        let registry = registry();
        let connector = MockConnector::new(|_| Reply::HangUp);
        let reporter = DeviceReporter::new(registry, DEVICE);
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::open(&connector, reporter, SessionConfig::default(), &mut rx)
            .await
            .unwrap();
        let mut handler = crate::infrastructure::bluetooth::handlers::IdentityQuery::new();
        let result = session
            .exchange(&mut handler, &mut rx, &FixedClock::default())
            .await;
        assert_eq!(result, Err(SessionError::LinkLost));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_request_cancels_exchange() {
        let registry = registry();
        let connector = MockConnector::silent();
        let reporter = DeviceReporter::new(registry, DEVICE);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::open(&connector, reporter, SessionConfig::default(), &mut rx)
            .await
            .unwrap();

        // Queued before the exchange, written after the opening command
        tx.send(SessionControl::Write("stopStreaming();".to_string()))
            .unwrap();
        let mut handler = crate::infrastructure::bluetooth::handlers::IdentityQuery::new();
        let clock = FixedClock::default();
        let (result, _) = tokio::join!(session.exchange(&mut handler, &mut rx, &clock), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(SessionControl::Close).unwrap();
        });
        assert_eq!(result, Err(SessionError::Cancelled));
        assert_eq!(
            connector.log().commands,
            vec!["sendWatchId();", "stopStreaming();"]
        );
    }

    #[tokio::test]
    async fn test_pending_close_skips_opening_command() {
        let registry = registry();
        let connector = MockConnector::silent();
        let reporter = DeviceReporter::new(registry.clone(), DEVICE);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::open(&connector, reporter, SessionConfig::default(), &mut rx)
            .await
            .unwrap();

        tx.send(SessionControl::Close).unwrap();
        let mut handler = SimpleCommand::new("startRecord();", true, Duration::from_millis(100));
        let result = session
            .exchange(&mut handler, &mut rx, &FixedClock::default())
            .await;
        assert_eq!(result, Err(SessionError::Cancelled));
        assert!(connector.log().commands.is_empty());

        session.close().await;
        assert_eq!(state(&registry), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_connect_cancels_setup() {
        let registry = registry();
        let connector = MockConnector::silent().slow_connect(Duration::from_secs(2));
        let reporter = DeviceReporter::new(registry.clone(), DEVICE);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (result, _) = tokio::join!(
            Session::open(&connector, reporter, SessionConfig::default(), &mut rx),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(state(&registry), SessionState::Connecting);
                tx.send(SessionControl::Close).unwrap();
            }
        );
        assert!(matches!(result, Err(SessionError::Cancelled)));
        let log = connector.log();
        assert!(log.commands.is_empty());
        assert_eq!(log.disconnects, 1);
        assert_eq!(state(&registry), SessionState::Idle);
    }
}
