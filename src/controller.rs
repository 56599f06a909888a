//! Robot Controller for Kawasaki AS controllers
//!
//! Shares one terminal session between tasks. The AS terminal answers strictly
//! in order, so a call made while another one holds the session fails fast with
//! `SessionBusy` instead of queueing behind it; callers needing concurrency open
//! another controller, which the robot accepts as a separate terminal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::execution::RcpOutcome;
use crate::protocol::ThreadMask;
use crate::session::Session;
use crate::status::{RcpState, RobotState, ThreadState};
use crate::upload::{ProgramText, UploadOutcome};
use crate::{KHIError, Result};

/// Opens a session, retrying transport failures as configured
pub async fn connect_session(config: &Config) -> Result<Session> {
    let host = config.robot.host.as_str();
    let port = config.robot.port();
    let max_attempts = config.connection.retry_attempts().max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match Session::connect(host, port, config.session_options()).await {
            Ok(session) => return Ok(session),
            Err(e) if e.is_transport() && attempt < max_attempts => {
                info!(
                    "Waiting for controller at {}:{} (attempt {}/{}): {}",
                    host, port, attempt, max_attempts, e
                );
                tokio::time::sleep(config.connection.retry_delay()).await;
            }
            Err(e) => {
                warn!("Failed to connect after {} attempts: {}", attempt, e);
                return Err(e);
            }
        }
    }
}

/// Shared handle to one AS terminal session
#[derive(Clone)]
pub struct RobotController {
    config: Arc<Config>,
    session: Arc<Mutex<Session>>,
    deadline: Option<Duration>,
}

impl RobotController {
    pub async fn connect(config: Config) -> Result<Self> {
        info!("Initializing AS robot controller");
        info!("Robot: {}:{}", config.robot.host, config.robot.port());
        let session = connect_session(&config).await?;
        Ok(Self::with_session(config, session))
    }

    /// Wraps an already logged-in session
    pub fn with_session(config: Config, session: Session) -> Self {
        let deadline = config.connection.operation_timeout();
        Self {
            config: Arc::new(config),
            session: Arc::new(Mutex::new(session)),
            deadline,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// True when the session is idle and in sync with the controller
    pub fn is_ready(&self) -> bool {
        self.session
            .try_lock()
            .map(|session| session.is_usable())
            .unwrap_or(false)
    }

    /// Replaces the session with a fresh login
    pub async fn reconnect(&self) -> Result<()> {
        let mut guard = self.session.try_lock().map_err(|_| KHIError::SessionBusy)?;
        info!("Reconnecting to AS terminal");
        let fresh = connect_session(&self.config).await?;
        let stale = std::mem::replace(&mut *guard, fresh);
        if let Err(e) = stale.disconnect().await {
            debug!("Closing stale session: {}", e);
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down robot controller");
        self.session.lock().await.close().await
    }

    fn acquire(&self) -> Result<MutexGuard<'_, Session>> {
        let session = self.session.try_lock().map_err(|_| KHIError::SessionBusy)?;
        if !session.is_usable() {
            return Err(KHIError::SessionDesynced);
        }
        Ok(session)
    }

    /// Applies the operation deadline. A call cut short leaves its exchange
    /// unfinished, which the session detects on the next use.
    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        match self.deadline {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .map_err(|_| KHIError::Timeout {
                    waited: limit,
                    expected: "operation to finish".to_string(),
                })?,
            None => operation.await,
        }
    }

    pub async fn handshake(&self) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.handshake()).await
    }

    pub async fn ereset(&self) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.ereset()).await
    }

    pub async fn pc_status(&self, mask: ThreadMask) -> Result<[ThreadState; 5]> {
        let mut session = self.acquire()?;
        self.bounded(session.get_pc_status(mask)).await
    }

    pub async fn rcp_status(&self) -> Result<RcpState> {
        let mut session = self.acquire()?;
        self.bounded(session.get_rcp_status()).await
    }

    pub async fn robot_state(&self) -> Result<RobotState> {
        let mut session = self.acquire()?;
        self.bounded(session.robot_state()).await
    }

    pub async fn set_switch(&self, name: &str, on: bool) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.set_switch(name, on)).await
    }

    pub async fn error_description(&self) -> Result<Option<String>> {
        let mut session = self.acquire()?;
        self.bounded(session.error_description()).await
    }

    pub async fn read_real(&self, variable: &str) -> Result<f64> {
        let mut session = self.acquire()?;
        self.bounded(session.read_real(variable)).await
    }

    pub async fn list_programs(&self) -> Result<Vec<String>> {
        let mut session = self.acquire()?;
        self.bounded(session.list_programs()).await
    }

    pub async fn upload_program(&self, program: &ProgramText) -> Result<UploadOutcome> {
        let mut session = self.acquire()?;
        self.bounded(session.upload_program(program)).await
    }

    pub async fn reset_save_load(&self) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.reset_save_load()).await
    }

    pub async fn delete_program(&self, program: &str) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.delete_program(program)).await
    }

    pub async fn pc_execute(&self, program: &str, thread: u8) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.pc_execute(program, thread)).await
    }

    pub async fn pc_abort(&self, mask: ThreadMask) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.pc_abort(mask)).await
    }

    pub async fn pc_end(&self, mask: ThreadMask) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.pc_end(mask)).await
    }

    pub async fn pc_kill(&self, mask: ThreadMask) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.pc_kill(mask)).await
    }

    /// Blocking runs are bounded by the execution timeout only
    pub async fn rcp_execute(&self, program: &str, blocking: bool) -> Result<RcpOutcome> {
        let mut session = self.acquire()?;
        if blocking {
            session.rcp_execute(program, true).await
        } else {
            self.bounded(session.rcp_execute(program, false)).await
        }
    }

    pub async fn rcp_abort(&self) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.rcp_abort()).await
    }

    pub async fn kill_rcp(&self) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.kill_rcp()).await
    }

    pub async fn rcp_hold(&self) -> Result<()> {
        let mut session = self.acquire()?;
        self.bounded(session.rcp_hold()).await
    }

    pub async fn rcp_continue(&self, blocking: bool) -> Result<RcpOutcome> {
        let mut session = self.acquire()?;
        if blocking {
            session.rcp_continue(true).await
        } else {
            self.bounded(session.rcp_continue(false)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{logged_in_mock, session};

    async fn controller(mock: crate::transport::mock::MockTransport) -> RobotController {
        RobotController::with_session(Config::for_host("127.0.0.1", 9105), session(mock).await)
    }

    #[tokio::test]
    async fn test_concurrent_call_is_rejected_as_busy() {
        let controller = controller(logged_in_mock().command("ERESET", "")).await;

        let guard = controller.session.try_lock().unwrap();
        assert!(matches!(controller.ereset().await, Err(KHIError::SessionBusy)));
        assert!(!controller.is_ready());
        drop(guard);

        controller.ereset().await.unwrap();
        assert!(controller.is_ready());
    }

    #[tokio::test]
    async fn test_deadline_desynchronizes_session() {
        let mut controller = controller(logged_in_mock().expect(b"\n", b"").stalling()).await;
        controller.deadline = Some(Duration::from_millis(20));

        let err = controller.handshake().await.unwrap_err();
        assert!(matches!(err, KHIError::Timeout { .. }));
        assert!(!controller.is_ready());
        assert!(matches!(
            controller.ereset().await,
            Err(KHIError::SessionDesynced)
        ));
    }

    #[tokio::test]
    async fn test_clones_share_one_session() {
        let controller = controller(
            logged_in_mock()
                .command("ERESET", "")
                .command("DIRECTORY/P", "Program list\r\n  kep\r\n\r\n"),
        )
        .await;
        let other = controller.clone();

        controller.ereset().await.unwrap();
        assert_eq!(other.list_programs().await.unwrap(), vec!["kep"]);
    }

    #[tokio::test]
    async fn test_set_switch() {
        let controller = controller(
            logged_in_mock()
                .command("SWITCH CS OFF", "")
                .command("SWITCH CS", " CS             OFF\r\n"),
        )
        .await;

        controller.set_switch("CS", false).await.unwrap();
        let mut session = controller.acquire().unwrap();
        assert!(!session.get_switch("CS").await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let mut config = Config::for_host("127.0.0.1", 1);
        config.connection.retry_attempts = Some(2);
        config.connection.retry_delay = Some(0.01);
        config.connection.connect_timeout = Some(0.2);

        let err = RobotController::connect(config).await.err().unwrap();
        assert!(err.is_transport());
    }
}
