//! AS monitor terminal session
//!
//! Owns one transport and drives the strictly sequential command/reply
//! exchange: every send is followed by a wait for a deterministic marker before
//! the next send. The controller has no request identifiers, so a reply that
//! is not fully consumed would be attributed to the next command. The session
//! therefore refuses further use once an exchange fails at the transport level
//! or is abandoned half way.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::protocol::{
    self, CONFIRMATION_REQUEST, CONFIRM_YES, LINE_END, LOGIN_BANNER, LOGIN_LINE_END, LOGIN_USER,
    PROGRAM_IN_USE, PROG_IS_LOADED, PROG_NOT_EXIST, PROMPT, VALUE_OUT_OF_RANGE,
};
use crate::transport::{MarkerReader, TcpTransport, Transport};
use crate::upload::SyntaxPolicy;
use crate::{KHIError, Result};

/// Per-session protocol settings
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Wait for the login banner and prompt
    pub connect_timeout: Duration,
    /// Wait for each administrative reply
    pub command_timeout: Duration,
    /// Wait for a blocking RCP run to finish; `None` waits indefinitely
    pub execution_timeout: Option<Duration>,
    pub batch_size: usize,
    pub syntax_policy: SyntaxPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(1),
            execution_timeout: None,
            batch_size: crate::upload::DEFAULT_BATCH_SIZE,
            syntax_policy: SyntaxPolicy::Lenient,
        }
    }
}

/// A logged-in AS terminal connection
pub struct Session {
    reader: MarkerReader,
    options: SessionOptions,
    usable: bool,
    in_flight: bool,
}

impl Session {
    /// Opens a TCP connection and logs in
    pub async fn connect(host: &str, port: u16, options: SessionOptions) -> Result<Self> {
        info!("Connecting to AS terminal at {}:{}", host, port);
        let transport = TcpTransport::connect(host, port, options.connect_timeout).await?;
        Self::login(Box::new(transport), options).await
    }

    /// Performs the login sequence on an already open transport.
    ///
    /// Waits for the banner, answers with the `as` user and waits for the first prompt.
    pub async fn login(transport: Box<dyn Transport>, options: SessionOptions) -> Result<Self> {
        let mut session = Self {
            reader: MarkerReader::new(transport),
            options,
            usable: true,
            in_flight: false,
        };

        let timeout = Some(session.options.connect_timeout);
        let result = async {
            session.wait_for_with(timeout, &[LOGIN_BANNER]).await?;
            session.send_raw(&[LOGIN_USER.as_bytes(), LOGIN_LINE_END].concat()).await?;
            session.wait_for_with(timeout, &[PROMPT]).await?;
            Ok::<_, KHIError>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!("Logged in to AS terminal");
                Ok(session)
            }
            Err(KHIError::Timeout { .. }) => Err(KHIError::Connection(
                "Can't establish connection with robot: no login prompt".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut SessionOptions {
        &mut self.options
    }

    /// False once a transport failure or abandoned exchange left the terminal in an unknown state
    pub fn is_usable(&self) -> bool {
        self.usable && !self.in_flight
    }

    /// Marks the session as unusable, e.g. after the caller cancelled an operation
    pub fn mark_desynced(&mut self) {
        if self.usable {
            warn!("AS session marked as desynchronized");
        }
        self.usable = false;
    }

    /// Liveness check: an empty line must be answered with a fresh prompt
    pub async fn handshake(&mut self) -> Result<()> {
        self.send_line("").await?;
        match self.wait_for(&[PROMPT]).await {
            Ok(_) => Ok(()),
            Err(KHIError::Timeout { .. }) => Err(KHIError::Connection(
                "Handshake with robot failed".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Clears the controller error state
    pub async fn ereset(&mut self) -> Result<()> {
        info!("Resetting controller errors");
        self.command("ERESET").await?;
        Ok(())
    }

    /// Reads a system switch
    pub async fn get_switch(&mut self, name: &str) -> Result<bool> {
        let reply = self.command(&protocol::switch(name)).await?;
        let text = reply_text(&reply);
        let tokens: Vec<&str> = text.split_whitespace().collect();
        match tokens.len().checked_sub(2).map(|i| tokens[i]) {
            Some(value) => Ok(value == "ON"),
            None => Err(KHIError::Protocol(format!(
                "Unexpected SWITCH {} reply: {}",
                name,
                text.trim()
            ))),
        }
    }

    /// Sets a system switch. Read-only switches keep their value.
    pub async fn set_switch(&mut self, name: &str, on: bool) -> Result<()> {
        info!("Setting switch {} {}", name, if on { "ON" } else { "OFF" });
        self.command(&protocol::set_switch(name, on)).await?;
        Ok(())
    }

    /// Description of the active controller error, `None` when there is none
    pub async fn error_description(&mut self) -> Result<Option<String>> {
        let reply = self.command("type $ERROR(ERROR)").await?;
        let text = reply_text(&reply);
        if text.contains(VALUE_OUT_OF_RANGE) {
            return Ok(None);
        }
        let lines: Vec<&str> = text.split("\r\n").collect();
        let body = match lines.len() {
            0..=2 => String::new(),
            n => lines[1..n - 1].join(" "),
        };
        let body = body.trim().to_string();
        Ok(if body.is_empty() { None } else { Some(body) })
    }

    /// Reads a real variable
    pub async fn read_real(&mut self, variable: &str) -> Result<f64> {
        let reply = self.command(&protocol::list_real(variable)).await?;
        if protocol::contains(&reply, protocol::VAR_NOT_DEFINED) {
            return Err(KHIError::VarNotDefined(variable.to_string()));
        }
        let text = reply_text(&reply);
        let tokens: Vec<&str> = text.split_whitespace().collect();
        tokens
            .len()
            .checked_sub(2)
            .and_then(|i| tokens[i].parse::<f64>().ok())
            .ok_or_else(|| {
                KHIError::Protocol(format!("Cannot read real {}: {}", variable, text.trim()))
            })
    }

    /// Names of programs stored on the controller
    pub async fn list_programs(&mut self) -> Result<Vec<String>> {
        let reply = self.command("DIRECTORY/P").await?;
        let text = reply_text(&reply);
        let lines: Vec<&str> = text.split("\r\n").collect();
        if lines.len() <= 3 {
            return Ok(Vec::new());
        }
        Ok(lines[2].split_whitespace().map(str::to_string).collect())
    }

    /// Deletes a program that is neither running nor loaded in a thread
    pub async fn delete_program(&mut self, program: &str) -> Result<()> {
        info!("Deleting program {}", program);
        let reply = self.confirmed_command(&protocol::delete_program(program)).await?;

        if protocol::contains(&reply, PROGRAM_IN_USE) {
            Err(KHIError::ProgRunning(program.to_string()))
        } else if protocol::contains(&reply, PROG_IS_LOADED) {
            Err(KHIError::ProgLoaded(program.to_string()))
        } else if protocol::contains(&reply, PROG_NOT_EXIST) {
            Err(KHIError::ProgNotExist(program.to_string()))
        } else {
            Ok(())
        }
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.close().await
    }

    /// Closes the connection in place; the session is unusable afterwards
    pub async fn close(&mut self) -> Result<()> {
        info!("Closing AS terminal session");
        self.usable = false;
        self.reader.close().await
    }

    /// Sends a command line and waits for the prompt
    pub(crate) async fn command(&mut self, line: &str) -> Result<Vec<u8>> {
        self.send_line(line).await?;
        self.wait_for(&[PROMPT]).await
    }

    /// Sends a command that may ask "Are you sure ?" and always answers yes.
    ///
    /// Returns every byte received for the command, confirmation dialog included.
    pub(crate) async fn confirmed_command(&mut self, line: &str) -> Result<Vec<u8>> {
        self.send_line(line).await?;
        let mut reply = self.wait_for(&[CONFIRMATION_REQUEST, PROMPT]).await?;
        if reply.ends_with(CONFIRMATION_REQUEST) {
            self.send_line(CONFIRM_YES).await?;
            reply.extend(self.wait_for(&[PROMPT]).await?);
        }
        Ok(reply)
    }

    pub(crate) async fn send_line(&mut self, line: &str) -> Result<()> {
        self.send_raw(&[line.as_bytes(), LINE_END].concat()).await
    }

    /// Sends raw bytes. The caller must wait for the reply before sending again.
    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if self.in_flight {
            // a previous exchange was dropped before its reply was read
            self.usable = false;
        }
        if !self.usable {
            return Err(KHIError::SessionDesynced);
        }
        self.in_flight = true;
        let result = self.reader.send(bytes).await;
        self.track(result)
    }

    /// Waits for a marker with the administrative timeout
    pub(crate) async fn wait_for(&mut self, markers: &[&[u8]]) -> Result<Vec<u8>> {
        let timeout = Some(self.options.command_timeout);
        self.wait_for_with(timeout, markers).await
    }

    pub(crate) async fn wait_for_with(
        &mut self,
        timeout: Option<Duration>,
        markers: &[&[u8]],
    ) -> Result<Vec<u8>> {
        if !self.usable {
            return Err(KHIError::SessionDesynced);
        }
        self.in_flight = true;
        let result = self.reader.receive_until(timeout, markers).await;
        if result.is_ok() {
            self.in_flight = false;
        }
        self.track(result)
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport() {
                debug!("Transport failure, session unusable: {}", e);
                self.usable = false;
            }
        }
        result
    }
}

/// Lossy text rendering of a controller reply
pub(crate) fn reply_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::transport::mock::MockTransport;

    #[tokio::test]
    async fn test_login_and_handshake() {
        let mock = logged_in_mock().expect(b"\n", b"\r\n>");
        let log = mock.sent_log();
        let mut session = session(mock).await;

        session.handshake().await.unwrap();
        assert!(session.is_usable());
        assert_eq!(MockTransport::render(&log), vec!["as\r\n", "\n"]);
    }

    #[tokio::test]
    async fn test_login_without_banner_is_connection_error() {
        let mock = MockTransport::new().greeting(b"Welcome\r\n");
        let err = Session::login(Box::new(mock), test_options())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, KHIError::Connection(_)));
    }

    #[tokio::test]
    async fn test_timeout_leaves_session_unusable() {
        // reply never reaches the prompt
        let mock = logged_in_mock().expect(b"ERESET\n", b"ERESET\r\nCleared error");
        let mut session = session(mock).await;

        let err = session.ereset().await.unwrap_err();
        assert!(matches!(err, KHIError::Timeout { .. }));
        assert!(!session.is_usable());

        let err = session.handshake().await.unwrap_err();
        assert!(matches!(err, KHIError::SessionDesynced));
    }

    #[tokio::test]
    async fn test_get_switch() {
        let mock = logged_in_mock()
            .command("SWITCH POWER", " POWER          ON\r\n")
            .command("SWITCH REPEAT", " REPEAT         OFF\r\n");
        let mut session = session(mock).await;

        assert!(session.get_switch("POWER").await.unwrap());
        assert!(!session.get_switch("REPEAT").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_switch_then_read_back() {
        let mock = logged_in_mock()
            .command("SWITCH RGSO ON", "")
            .command("SWITCH RGSO", " RGSO           ON\r\n")
            .command("SWITCH RGSO OFF", "");
        let log = mock.sent_log();
        let mut session = session(mock).await;

        session.set_switch("RGSO", true).await.unwrap();
        assert!(session.get_switch("RGSO").await.unwrap());
        session.set_switch("RGSO", false).await.unwrap();

        assert_eq!(
            MockTransport::render(&log)[1..],
            ["SWITCH RGSO ON\n", "SWITCH RGSO\n", "SWITCH RGSO OFF\n"]
        );
        assert!(session.is_usable());
    }

    #[tokio::test]
    async fn test_error_description() {
        let mock = logged_in_mock()
            .command("type $ERROR(ERROR)", "Value is out of range.\r\n")
            .command("type $ERROR(ERROR)", "(E0102) Emergency stop\r\n");
        let mut session = session(mock).await;

        assert_eq!(session.error_description().await.unwrap(), None);
        assert_eq!(
            session.error_description().await.unwrap().as_deref(),
            Some("(E0102) Emergency stop")
        );
    }

    #[tokio::test]
    async fn test_read_real() {
        let mock = logged_in_mock()
            .command("list /r speed", " speed = 12.5\r\n")
            .command("list /r nope", "Variable is not defined.\r\n");
        let mut session = session(mock).await;

        assert_eq!(session.read_real("speed").await.unwrap(), 12.5);
        assert!(matches!(
            session.read_real("nope").await,
            Err(KHIError::VarNotDefined(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_list_programs() {
        let mock = logged_in_mock().command(
            "DIRECTORY/P",
            "Program list\r\n  kep   posmon.pc   weld1\r\n\r\n",
        );
        let mut session = session(mock).await;

        assert_eq!(
            session.list_programs().await.unwrap(),
            vec!["kep", "posmon.pc", "weld1"]
        );
    }

    #[tokio::test]
    async fn test_delete_program_confirms_and_reports_loaded() {
        let mock = logged_in_mock()
            .expect(
                b"DELETE/P/D kep\n",
                b"DELETE/P/D kep\r\nAre you sure ? (Yes:1, No:0) ",
            )
            .expect(b"1\n", b"1\r\n>")
            .expect(
                b"DELETE/P/D pos\n",
                b"DELETE/P/D pos\r\nAre you sure ? (Yes:1, No:0) ",
            )
            .expect(
                b"1\n",
                b"1\r\n(P2034) Use KILL or PCKILL to delete program.\r\n>",
            );
        let mut session = session(mock).await;

        session.delete_program("kep").await.unwrap();
        assert!(matches!(
            session.delete_program("pos").await,
            Err(KHIError::ProgLoaded(name)) if name == "pos"
        ));
    }
}
