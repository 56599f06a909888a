//! PC thread and RCP execution control
//!
//! A loaded program has to be aborted before it can be killed, and killed
//! before the slot accepts another program. Public operations start with a
//! handshake so commands are never typed into a half-finished dialog.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::protocol::{
    self, Slot, ThreadMask, LINE_BREAK, MOTORS_DISABLED, NO_WORK_DETECTED, PROGRAM_ABORTED,
    PROGRAM_COMPLETED, PROGRAM_HELD, PROGRAM_IN_USE, PROG_IS_ACTIVE, PROG_NOT_EXIST,
    TEACH_LOCK_ON, TEACH_MODE_ON, THREAD_IS_BUSY, VAR_NOT_DEFINED,
};
use crate::session::{reply_text, Session};
use crate::upload::validate_name;
use crate::{KHIError, Result};

const TERMINAL_MARKERS: [&[u8]; 4] = [
    PROGRAM_COMPLETED,
    PROGRAM_ABORTED,
    PROGRAM_HELD,
    NO_WORK_DETECTED,
];

/// How an RCP run ended, or that it was left running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RcpOutcome {
    /// Not waited for
    Started,
    Completed,
    Aborted,
}

impl Session {
    /// Runs `program` in PC thread `thread`.
    ///
    /// Every thread holding the same program, and the target thread if it is
    /// occupied, is aborted and killed first.
    pub async fn pc_execute(&mut self, program: &str, thread: u8) -> Result<()> {
        let target = ThreadMask::single(thread)?;
        let program = runnable_name(program)?;
        let program = program.as_str();
        self.handshake().await?;

        let states = self.get_pc_status(ThreadMask::ALL).await?;
        let conflicts = states
            .iter()
            .filter(|s| s.name == program || (target.contains(s.thread_num) && s.is_loaded()))
            .fold(ThreadMask::empty(), |mask, s| mask.with(s.thread_num));
        if !conflicts.is_empty() {
            debug!("Clearing threads {:?} before PCEXE", conflicts.threads().collect::<Vec<_>>());
            self.abort_threads(conflicts).await?;
            self.kill_threads(conflicts).await?;
        }

        info!("Executing {} in PC thread {}", program, thread);
        let reply = self.command(&protocol::pc_execute(thread, program)).await?;
        if protocol::contains(&reply, PROG_NOT_EXIST) {
            Err(KHIError::ProgNotExist(program.to_string()))
        } else if protocol::contains(&reply, PROGRAM_IN_USE) {
            Err(KHIError::ProgRunning(program.to_string()))
        } else if protocol::contains(&reply, THREAD_IS_BUSY) {
            Err(KHIError::ThreadBusy(thread))
        } else {
            Ok(())
        }
    }

    /// Aborts the programs in the masked threads; stopped threads are left as they are
    pub async fn pc_abort(&mut self, mask: ThreadMask) -> Result<()> {
        self.handshake().await?;
        self.abort_threads(mask).await
    }

    /// Lets the programs in the masked threads finish their current cycle
    pub async fn pc_end(&mut self, mask: ThreadMask) -> Result<()> {
        self.handshake().await?;
        for thread in mask.threads() {
            info!("Ending PC thread {}", thread);
            self.command(&protocol::pc_end(thread)).await?;
        }
        Ok(())
    }

    /// Unloads aborted programs from the masked threads.
    ///
    /// Fails with `ProgActive` on the first thread that is still running.
    pub async fn pc_kill(&mut self, mask: ThreadMask) -> Result<()> {
        self.handshake().await?;
        self.kill_threads(mask).await
    }

    /// Runs `program` as the robot control program.
    ///
    /// Requires REPEAT mode. With `blocking` the call waits for the run to end,
    /// bounded by the session's execution timeout.
    pub async fn rcp_execute(&mut self, program: &str, blocking: bool) -> Result<RcpOutcome> {
        let program = runnable_name(program)?;
        let program = program.as_str();
        self.handshake().await?;

        let state = self.get_rcp_status().await?;
        if !state.repeat_mode {
            return Err(KHIError::TeachMode);
        }
        if state.is_loaded() {
            if state.running {
                self.abort_rcp_slot().await?;
            }
            self.kill_rcp_slot().await?;
        }

        info!("Executing {} as robot control program", program);
        let reply = self.command(&protocol::execute(program)).await?;
        if protocol::contains(&reply, PROG_NOT_EXIST) {
            return Err(KHIError::ProgNotExist(program.to_string()));
        } else if protocol::contains(&reply, TEACH_MODE_ON) {
            return Err(KHIError::TeachMode);
        } else if protocol::contains(&reply, TEACH_LOCK_ON) {
            return Err(KHIError::TeachLock);
        } else if protocol::contains(&reply, MOTORS_DISABLED) {
            return Err(KHIError::MotorsOff);
        } else if protocol::contains(&reply, VAR_NOT_DEFINED) {
            return Err(KHIError::VarNotDefined(program.to_string()));
        }

        if !blocking {
            return Ok(RcpOutcome::Started);
        }
        self.await_rcp_end(program, &reply).await
    }

    pub async fn rcp_abort(&mut self) -> Result<()> {
        self.handshake().await?;
        self.abort_rcp_slot().await
    }

    /// Unloads the robot control program; fails with `ProgActive` while it runs
    pub async fn kill_rcp(&mut self) -> Result<()> {
        self.handshake().await?;
        self.kill_rcp_slot().await
    }

    pub async fn rcp_hold(&mut self) -> Result<()> {
        self.handshake().await?;
        info!("Holding robot control program");
        self.command("HOLD").await?;
        Ok(())
    }

    /// Resumes a held robot control program
    pub async fn rcp_continue(&mut self, blocking: bool) -> Result<RcpOutcome> {
        self.handshake().await?;
        let program = self.get_rcp_status().await?.name;

        info!("Continuing robot control program {}", program);
        let reply = self.command("CONTINUE").await?;
        if !blocking {
            return Ok(RcpOutcome::Started);
        }
        self.await_rcp_end(&program, &reply).await
    }

    /// Aborts and kills every copy of `program`, in the RCP slot and in PC threads
    pub(crate) async fn release_program(&mut self, program: &str) -> Result<()> {
        let rcp = self.get_rcp_status().await?;
        if rcp.name == program {
            if rcp.running {
                self.abort_rcp_slot().await?;
            }
            self.kill_rcp_slot().await?;
        }

        let threads = self.get_pc_status(ThreadMask::ALL).await?;
        let (loaded, running) = threads.iter().filter(|s| s.name == program).fold(
            (ThreadMask::empty(), ThreadMask::empty()),
            |(loaded, running), s| {
                let running = if s.running { running.with(s.thread_num) } else { running };
                (loaded.with(s.thread_num), running)
            },
        );
        if !running.is_empty() {
            self.abort_threads(running).await?;
        }
        if !loaded.is_empty() {
            self.kill_threads(loaded).await?;
        }
        Ok(())
    }

    async fn abort_threads(&mut self, mask: ThreadMask) -> Result<()> {
        for thread in mask.threads() {
            info!("Aborting PC thread {}", thread);
            self.command(&protocol::pc_abort(thread)).await?;
        }
        Ok(())
    }

    async fn kill_threads(&mut self, mask: ThreadMask) -> Result<()> {
        for thread in mask.threads() {
            info!("Killing PC thread {}", thread);
            let reply = self.confirmed_command(&protocol::pc_kill(thread)).await?;
            if protocol::contains(&reply, PROG_IS_ACTIVE) {
                return Err(KHIError::ProgActive(Slot::Pc(thread)));
            }
        }
        Ok(())
    }

    async fn abort_rcp_slot(&mut self) -> Result<()> {
        info!("Aborting robot control program");
        self.command("ABORT").await?;
        Ok(())
    }

    async fn kill_rcp_slot(&mut self) -> Result<()> {
        info!("Killing robot control program");
        let reply = self.confirmed_command("KILL").await?;
        if protocol::contains(&reply, PROG_IS_ACTIVE) {
            return Err(KHIError::ProgActive(Slot::Rcp));
        }
        Ok(())
    }

    /// Waits for a terminal marker unless `reply` already holds one
    async fn await_rcp_end(&mut self, program: &str, reply: &[u8]) -> Result<RcpOutcome> {
        let reply = if TERMINAL_MARKERS.iter().any(|m| protocol::contains(reply, m)) {
            reply.to_vec()
        } else {
            let timeout = self.options().execution_timeout;
            let mut reply = self.wait_for_with(timeout, &TERMINAL_MARKERS).await?;
            // rest of the status line
            reply.extend(self.wait_for(&[LINE_BREAK]).await?);
            reply
        };
        rcp_outcome(program, &reply)
    }
}

/// Reply line carrying `marker`, for diagnostics
fn status_line(reply: &[u8], marker: &[u8]) -> String {
    let text = reply_text(reply);
    let marker = reply_text(marker);
    text.split("\r\n")
        .find(|line| line.contains(marker.as_str()))
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| marker.clone())
}

fn rcp_outcome(program: &str, reply: &[u8]) -> Result<RcpOutcome> {
    if protocol::contains(reply, PROGRAM_COMPLETED) {
        info!("Program {} completed", program);
        Ok(RcpOutcome::Completed)
    } else if protocol::contains(reply, PROGRAM_ABORTED) {
        info!("Program {} aborted", program);
        Ok(RcpOutcome::Aborted)
    } else if protocol::contains(reply, PROGRAM_HELD) {
        Err(KHIError::ProgHeld {
            program: program.to_string(),
            status: status_line(reply, PROGRAM_HELD),
        })
    } else if protocol::contains(reply, NO_WORK_DETECTED) {
        Err(KHIError::ProgFaulted {
            program: program.to_string(),
            status: status_line(reply, NO_WORK_DETECTED),
        })
    } else {
        Err(KHIError::Protocol(format!(
            "No terminal state in reply for {}: {}",
            program,
            reply_text(reply).trim()
        )))
    }
}

/// A blank name would match every empty thread
fn runnable_name(program: &str) -> Result<String> {
    validate_name(program).map_err(|_| KHIError::ProgNotExist(program.to_string()))
}
