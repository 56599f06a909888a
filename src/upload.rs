//! Program upload
//!
//! Program text is framed as `.PROGRAM <name>` ... `.END`, split into batches
//! and pushed through the controller's loading dialog. The controller checks
//! each line as it arrives and stops on a bad one with an interactive prompt:
//! `0` comments the line out and continues, `1` deletes the program and aborts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::protocol::{
    frame_batch, BATCH_ACCEPTED, COMMENT_AND_CONTINUE, DELETE_AND_ABORT, END_OF_FILE, END_OF_LOAD,
    HARD_ABORT, LINE_BREAK, LOADING_ACCEPTED, PROGRAM_IN_USE, PROMPT, SAVE_LOAD_IN_PROGRESS,
    START_LOADING, SYNTAX_ERROR, TRANSMISSION_TALLY,
};
use crate::session::{reply_text, Session};
use crate::{KHIError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Larger batches overflow the controller's line buffer
pub const MAX_BATCH_SIZE: usize = 3000;

/// Reaction to a line the controller rejects during upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxPolicy {
    /// Comment the line out, keep loading and report it at the end
    Lenient,
    /// Delete the program and abort the transmission
    Strict,
}

/// One program line rejected by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntaxErrorRecord {
    pub line_number: u32,
    pub offending_text: String,
    pub error_code: String,
    pub description: String,
}

impl fmt::Display for SyntaxErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error '{}' ({}) at line {} ({})",
            self.description, self.error_code, self.line_number, self.offending_text
        )
    }
}

/// Extracts [`SyntaxErrorRecord`]s from the text the controller prints
/// before each syntax error prompt:
///
/// ```text
///    12 LMOVE
///       ^(P1013)Missing argument.
/// ```
pub struct SyntaxErrorParser {
    caret_pattern: Regex,
    numbered_pattern: Regex,
    name_echo_pattern: Regex,
}

impl SyntaxErrorParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            caret_pattern: Regex::new(r"\^\s*\(([^)]*)\)\s*(.*)$")?,
            numbered_pattern: Regex::new(r"^\s*(\d+)\s*(.*?)\s*$")?,
            name_echo_pattern: Regex::new(r"^\s*Program \S+\(\)\s*$")?,
        })
    }

    /// Parses the reply chunk that ended with the syntax error prompt.
    ///
    /// Unrecognized text is kept verbatim with line number 0.
    pub fn parse(&self, raw: &[u8]) -> SyntaxErrorRecord {
        let raw = raw.strip_suffix(SYNTAX_ERROR).unwrap_or(raw);
        let text = reply_text(raw);
        let lines: Vec<&str> = text
            .split("\r\n")
            .filter(|line| !line.trim().is_empty() && !self.name_echo_pattern.is_match(line))
            .collect();

        self.parse_lines(&lines).unwrap_or_else(|| {
            let offending_text = lines.join(" ").trim().to_string();
            warn!("Unrecognized syntax error report: {}", offending_text);
            SyntaxErrorRecord {
                line_number: 0,
                offending_text,
                error_code: String::new(),
                description: "Unrecognized syntax error report".to_string(),
            }
        })
    }

    fn parse_lines(&self, lines: &[&str]) -> Option<SyntaxErrorRecord> {
        let caret_at = lines
            .iter()
            .rposition(|line| self.caret_pattern.is_match(line))?;
        let caret = self.caret_pattern.captures(lines[caret_at])?;
        let numbered = self
            .numbered_pattern
            .captures(lines.get(caret_at.checked_sub(1)?)?)?;

        Some(SyntaxErrorRecord {
            line_number: numbered[1].parse().ok()?,
            offending_text: numbered[2].to_string(),
            error_code: caret[1].trim().to_string(),
            description: caret[2].trim().to_string(),
        })
    }
}

/// AS program source ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramText {
    name: String,
    signature: String,
    body: String,
}

impl ProgramText {
    /// Frames `body` as program `name`
    pub fn new(name: &str, body: &str) -> Result<Self> {
        let name = validate_name(name.trim())?;
        Ok(Self {
            signature: name.clone(),
            name,
            body: body.strip_suffix('\n').unwrap_or(body).to_string(),
        })
    }

    /// Reads an already framed program file.
    ///
    /// The header may carry a parameter list, `.PROGRAM move(.pose)`; it is kept
    /// as written and only the name in front of it identifies the program.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let header = lines
            .by_ref()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| KHIError::ProgTransmission("Program text is empty".to_string()))?;
        let signature = header
            .trim()
            .strip_prefix(".PROGRAM")
            .ok_or_else(|| {
                KHIError::ProgTransmission(format!("Expected .PROGRAM header, got '{}'", header))
            })?
            .trim();
        let name = validate_name(signature.split('(').next().unwrap_or_default().trim())?;
        let body: Vec<&str> = lines.take_while(|line| line.trim() != ".END").collect();

        Ok(Self {
            name,
            signature: signature.to_string(),
            body: body.join("\n"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn to_text(&self) -> String {
        format!(".PROGRAM {}\n{}\n.END\n", self.signature, self.body)
    }

    /// Splits the framed program into upload batches of at most `batch_size` bytes
    pub fn batches(&self, batch_size: usize) -> Result<Vec<UploadBatch>> {
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(KHIError::Config(format!(
                "Batch size must be within 1..={}, got {}",
                MAX_BATCH_SIZE, batch_size
            )));
        }
        Ok(self
            .to_text()
            .as_bytes()
            .chunks(batch_size)
            .enumerate()
            .map(|(sequence, payload)| UploadBatch {
                sequence,
                payload: payload.to_vec(),
            })
            .collect())
    }
}

pub(crate) fn validate_name(name: &str) -> Result<String> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(KHIError::ProgTransmission(format!(
            "Invalid program name '{}'",
            name
        )));
    }
    Ok(name.to_string())
}

/// Accumulates program lines explicitly; nothing is recorded implicitly
#[derive(Debug, Clone, Default)]
pub struct ProgramBuilder {
    name: String,
    lines: Vec<String>,
}

impl ProgramBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn line(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    pub fn lines<I, S>(&mut self, lines: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn comment(&mut self, text: &str) -> &mut Self {
        self.line(format!("; {}", text))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn build(&self) -> Result<ProgramText> {
        ProgramText::new(&self.name, &self.lines.join("\n"))
    }
}

/// One framed chunk of program bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadBatch {
    pub sequence: usize,
    pub payload: Vec<u8>,
}

impl UploadBatch {
    /// Sentinel batch that ends the transmission
    pub fn end_of_load() -> Self {
        Self {
            sequence: usize::MAX,
            payload: END_OF_LOAD.to_vec(),
        }
    }

    pub fn frame(&self) -> Vec<u8> {
        frame_batch(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    ConflictCheck,
    LoadingInit,
    SendBatch(usize),
    AwaitAck(usize),
    Finalize,
    Done,
    Failed,
}

/// Result of an upload that reached the end of the loading dialog
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Loaded,
    /// Loaded with the listed lines commented out
    LoadedWithErrors(Vec<SyntaxErrorRecord>),
}

impl UploadOutcome {
    pub fn errors(&self) -> &[SyntaxErrorRecord] {
        match self {
            UploadOutcome::Loaded => &[],
            UploadOutcome::LoadedWithErrors(errors) => errors,
        }
    }

    /// Treats commented-out lines as a failure
    pub fn into_result(self, program: &str) -> Result<()> {
        match self {
            UploadOutcome::Loaded => Ok(()),
            UploadOutcome::LoadedWithErrors(errors) => Err(KHIError::ProgSyntax {
                program: program.to_string(),
                errors,
                aborted: false,
            }),
        }
    }
}

struct Upload<'p> {
    program: &'p ProgramText,
    batches: Vec<UploadBatch>,
    policy: SyntaxPolicy,
    parser: SyntaxErrorParser,
    errors: Vec<SyntaxErrorRecord>,
    state: UploadState,
}

impl<'p> Upload<'p> {
    async fn run(mut self, session: &mut Session) -> Result<UploadOutcome> {
        info!(
            "Uploading program {} in {} batches ({:?})",
            self.program.name(),
            self.batches.len(),
            self.policy
        );

        while self.state != UploadState::Done {
            debug!("upload {}: {:?}", self.program.name(), self.state);
            match self.step(session).await {
                Ok(next) => self.state = next,
                Err(e) => {
                    self.state = UploadState::Failed;
                    warn!("Upload of {} failed: {}", self.program.name(), e);
                    return Err(e);
                }
            }
        }

        if self.errors.is_empty() {
            info!("Program {} uploaded", self.program.name());
            Ok(UploadOutcome::Loaded)
        } else {
            info!(
                "Program {} uploaded with {} lines commented out",
                self.program.name(),
                self.errors.len()
            );
            Ok(UploadOutcome::LoadedWithErrors(self.errors))
        }
    }

    async fn step(&mut self, session: &mut Session) -> Result<UploadState> {
        match self.state {
            UploadState::Idle => {
                session.handshake().await?;
                Ok(UploadState::ConflictCheck)
            }
            UploadState::ConflictCheck => {
                session.release_program(self.program.name()).await?;
                Ok(UploadState::LoadingInit)
            }
            UploadState::LoadingInit => {
                session.send_raw(START_LOADING).await?;
                let reply = session
                    .wait_for(&[LOADING_ACCEPTED, SAVE_LOAD_IN_PROGRESS])
                    .await?;
                if reply.ends_with(SAVE_LOAD_IN_PROGRESS) {
                    return Err(KHIError::ProgTransmission(
                        "SAVE/LOAD in progress".to_string(),
                    ));
                }
                Ok(if self.batches.is_empty() {
                    UploadState::Finalize
                } else {
                    UploadState::SendBatch(0)
                })
            }
            UploadState::SendBatch(index) => {
                session.send_raw(&self.batches[index].frame()).await?;
                Ok(UploadState::AwaitAck(index))
            }
            UploadState::AwaitAck(index) => self.await_ack(session, index).await,
            UploadState::Finalize => self.finalize(session).await,
            UploadState::Done | UploadState::Failed => Err(KHIError::Protocol(format!(
                "Upload of {} stepped past {:?}",
                self.program.name(),
                self.state
            ))),
        }
    }

    async fn await_ack(&mut self, session: &mut Session, index: usize) -> Result<UploadState> {
        let reply = session
            .wait_for(&[BATCH_ACCEPTED, SYNTAX_ERROR, HARD_ABORT, PROGRAM_IN_USE])
            .await?;

        if reply.ends_with(BATCH_ACCEPTED) {
            Ok(if index + 1 < self.batches.len() {
                UploadState::SendBatch(index + 1)
            } else {
                UploadState::Finalize
            })
        } else if reply.ends_with(SYNTAX_ERROR) {
            // the same batch is acknowledged once the dialog is answered
            self.on_syntax_error(session, &reply, false).await?;
            Ok(UploadState::AwaitAck(index))
        } else if reply.ends_with(HARD_ABORT) {
            session.send_raw(&UploadBatch::end_of_load().frame()).await?;
            session.wait_for(&[PROMPT]).await?;
            Err(KHIError::ProgTransmission(format!(
                "Controller aborted transmission of {}",
                self.program.name()
            )))
        } else {
            Err(self.program_in_use(session).await)
        }
    }

    async fn finalize(&mut self, session: &mut Session) -> Result<UploadState> {
        session.send_raw(&UploadBatch::end_of_load().frame()).await?;
        loop {
            let reply = session
                .wait_for(&[TRANSMISSION_TALLY, SYNTAX_ERROR, PROGRAM_IN_USE])
                .await?;
            if reply.ends_with(TRANSMISSION_TALLY) {
                return Ok(UploadState::Done);
            }
            if reply.ends_with(SYNTAX_ERROR) {
                self.on_syntax_error(session, &reply, true).await?;
                continue;
            }
            return Err(self.program_in_use(session).await);
        }
    }

    async fn on_syntax_error(
        &mut self,
        session: &mut Session,
        reply: &[u8],
        end_of_load_sent: bool,
    ) -> Result<()> {
        let record = self.parser.parse(reply);
        match self.policy {
            SyntaxPolicy::Lenient => {
                warn!("{}: commented out {}", self.program.name(), record);
                self.errors.push(record);
                session.send_line(COMMENT_AND_CONTINUE).await
            }
            SyntaxPolicy::Strict => {
                warn!("{}: aborting upload on {}", self.program.name(), record);
                self.errors.push(record);
                session.send_line(DELETE_AND_ABORT).await?;
                // the answer is echoed before the controller drops the program
                session.wait_for(&[LINE_BREAK]).await?;
                if !end_of_load_sent {
                    session.send_raw(&UploadBatch::end_of_load().frame()).await?;
                }
                let reply = session
                    .wait_for(&[TRANSMISSION_TALLY, PROMPT, HARD_ABORT])
                    .await?;
                if reply.ends_with(HARD_ABORT) {
                    session.wait_for(&[PROMPT]).await?;
                }
                Err(KHIError::ProgSyntax {
                    program: self.program.name().to_string(),
                    errors: std::mem::take(&mut self.errors),
                    aborted: true,
                })
            }
        }
    }

    async fn program_in_use(&self, session: &mut Session) -> KHIError {
        if let Err(e) = session.wait_for(&[PROMPT]).await {
            debug!("No prompt after in-use rejection: {}", e);
        }
        KHIError::ProgRunning(self.program.name().to_string())
    }
}

impl Session {
    /// Uploads with the session's batch size and syntax error policy
    pub async fn upload_program(&mut self, program: &ProgramText) -> Result<UploadOutcome> {
        let policy = self.options().syntax_policy;
        let batch_size = self.options().batch_size;
        self.upload_program_with(program, policy, batch_size).await
    }

    /// Aborts and kills any copy of the program that is loaded, then loads it.
    ///
    /// With [`SyntaxPolicy::Lenient`] rejected lines are commented out and
    /// returned in [`UploadOutcome::LoadedWithErrors`]. With
    /// [`SyntaxPolicy::Strict`] the first rejected line deletes the program
    /// and fails with `ProgSyntax { aborted: true }`.
    pub async fn upload_program_with(
        &mut self,
        program: &ProgramText,
        policy: SyntaxPolicy,
        batch_size: usize,
    ) -> Result<UploadOutcome> {
        let upload = Upload {
            program,
            batches: program.batches(batch_size)?,
            policy,
            parser: SyntaxErrorParser::new()?,
            errors: Vec::new(),
            state: UploadState::Idle,
        };
        upload.run(self).await
    }

    /// Closes a SAVE/LOAD dialog left open by an interrupted transfer
    pub async fn reset_save_load(&mut self) -> Result<()> {
        info!("Closing pending SAVE/LOAD dialog");
        let frames = [frame_batch(END_OF_FILE), UploadBatch::end_of_load().frame()].concat();
        self.send_raw(&frames).await?;
        self.wait_for(&[TRANSMISSION_TALLY]).await?;
        Ok(())
    }
}
