//! Program thread and controller state
//!
//! Every query builds fresh snapshot values; nothing here is cached or shared
//! between queries.
//!
//! The program line of a status block is the first line after the
//! `Program name  Priority  Step No.` header. Controller firmware revisions
//! are not guaranteed to lay this block out identically, so unparsable values
//! fall back to defaults with a warning instead of failing the query.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::{self, ThreadMask, PC_THREADS};
use crate::session::{reply_text, Session};
use crate::Result;

/// Reply bodies no longer than this carry no status block
const MIN_STATUS_REPLY: usize = 10;
const NO_PROGRAM: &str = "No program is running.";
const PROGRAM_HEADER: &str = "Program name";

/// Snapshot of one PC program thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_num: u8,
    /// Empty when no program is loaded
    pub name: String,
    pub running: bool,
    /// -1 when no program is loaded
    pub step_num: i32,
    pub completed_cycles: i32,
    /// -1 for infinite
    pub remaining_cycles: i32,
}

impl ThreadState {
    pub fn empty(thread_num: u8) -> Self {
        Self {
            thread_num,
            name: String::new(),
            running: false,
            step_num: -1,
            completed_cycles: 0,
            remaining_cycles: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Snapshot of the robot control program slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcpState {
    pub name: String,
    pub running: bool,
    pub step_num: i32,
    /// The controller only reports motor power when it is off
    pub motor_on: bool,
    pub repeat_mode: bool,
    pub cycle_start: bool,
    pub monitor_speed: Option<f64>,
    pub program_speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub stepper_status: Option<String>,
    pub completed_cycles: i32,
    pub remaining_cycles: i32,
}

impl Default for RcpState {
    fn default() -> Self {
        Self {
            name: String::new(),
            running: false,
            step_num: -1,
            motor_on: true,
            repeat_mode: false,
            cycle_start: false,
            monitor_speed: None,
            program_speed: None,
            accuracy: None,
            stepper_status: None,
            completed_cycles: 0,
            remaining_cycles: 0,
        }
    }
}

impl RcpState {
    pub fn is_loaded(&self) -> bool {
        !self.name.is_empty()
    }
}

/// System switches relevant to motion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub power: bool,
    pub cycle_start: bool,
    pub rgso: bool,
    pub error: bool,
    pub repeat: bool,
    pub run: bool,
    pub error_description: Option<String>,
}

/// Program name, step, cycle counters shared by PCSTATUS and STATUS replies
#[derive(Debug, Default)]
struct ProgramBlock {
    name: String,
    step_num: i32,
    completed_cycles: i32,
    remaining_cycles: i32,
}

/// Non-empty reply lines without the command echo and the trailing prompt
fn body_lines(raw: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = raw
        .split("\r\n")
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.last().map(|line| line.trim() == ">").unwrap_or(false) {
        lines.pop();
    }
    let echoed = lines.first().map(|line| {
        let line = line.trim_start();
        line.starts_with("PCSTATUS") || line.starts_with("STATUS")
    });
    if echoed.unwrap_or(false) {
        lines.remove(0);
    }
    lines
}

fn has_status_data(lines: &[&str]) -> bool {
    lines.iter().map(|line| line.len()).sum::<usize>() > MIN_STATUS_REPLY
}

fn parse_program_block(lines: &[&str]) -> ProgramBlock {
    let mut block = ProgramBlock {
        step_num: -1,
        ..ProgramBlock::default()
    };

    for line in lines {
        if line.contains("Completed cycles:") {
            block.completed_cycles = parse_cycles(line);
        } else if line.contains("Remaining cycles:") {
            block.remaining_cycles = parse_cycles(line);
        }
    }

    if lines.iter().any(|line| line.contains(NO_PROGRAM)) {
        return block;
    }
    let program_line = match lines
        .iter()
        .position(|line| line.contains(PROGRAM_HEADER))
        .and_then(|header| lines.get(header + 1))
    {
        Some(line) => *line,
        None => return block,
    };
    let tokens: Vec<&str> = program_line.split_whitespace().collect();
    if let Some(name) = tokens.first() {
        block.name = name.to_string();
        block.step_num = match tokens.get(2).and_then(|s| s.parse().ok()) {
            Some(step) => step,
            None => {
                warn!("Cannot read step number from status line: {}", program_line.trim());
                -1
            }
        };
    }
    block
}

fn parse_cycles(line: &str) -> i32 {
    if line.contains("Infinite") {
        return -1;
    }
    line.split_whitespace()
        .last()
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| {
            warn!("Cannot read cycle count from status line: {}", line.trim());
            0
        })
}

/// First number after '=' on a status line
fn parse_setting(line: &str) -> Option<f64> {
    line.split_once('=')
        .and_then(|(_, values)| values.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Parses a `PCSTATUS n:` reply
pub fn parse_thread_status(thread_num: u8, raw: &str) -> ThreadState {
    let lines = body_lines(raw);
    if !has_status_data(&lines) {
        return ThreadState::empty(thread_num);
    }
    let block = parse_program_block(&lines);
    if block.name.is_empty() {
        return ThreadState {
            completed_cycles: block.completed_cycles,
            remaining_cycles: block.remaining_cycles,
            ..ThreadState::empty(thread_num)
        };
    }

    let running = lines
        .iter()
        .find(|line| line.contains("PC status:"))
        .map(|line| !line.contains("not running"))
        .unwrap_or(false);

    ThreadState {
        thread_num,
        name: block.name,
        running,
        step_num: block.step_num,
        completed_cycles: block.completed_cycles,
        remaining_cycles: block.remaining_cycles,
    }
}

/// Parses a `STATUS` reply
pub fn parse_rcp_status(raw: &str) -> RcpState {
    let mut state = RcpState::default();
    let lines = body_lines(raw);
    if !has_status_data(&lines) {
        return state;
    }

    let mut stepper_running = false;
    for line in &lines {
        if line.contains("Motor power") {
            state.motor_on = !line.contains("OFF");
        } else if line.contains("REPEAT mode") {
            state.repeat_mode = true;
            state.cycle_start = line.contains("CYCLE START ON");
        } else if line.contains("TEACH mode") {
            state.repeat_mode = false;
        } else if line.contains("CYCLE START ON") {
            state.cycle_start = true;
        } else if line.contains("Monitor speed(%)") {
            state.monitor_speed = parse_setting(line);
        } else if line.contains("Program speed(%)") {
            state.program_speed = parse_setting(line);
        } else if line.contains("Accu.[mm]") {
            state.accuracy = parse_setting(line);
        } else if let Some((_, status)) = line.split_once("Stepper status:") {
            let status = status.trim().trim_end_matches('.').to_string();
            stepper_running = status.contains("running") && !status.contains("not running");
            state.stepper_status = Some(status);
        }
    }

    let block = parse_program_block(&lines);
    state.completed_cycles = block.completed_cycles;
    state.remaining_cycles = block.remaining_cycles;
    if !block.name.is_empty() {
        state.running = state.cycle_start || stepper_running;
        state.name = block.name;
        state.step_num = block.step_num;
    }
    state
}

impl Session {
    /// Queries the threads in `mask` in ascending order.
    ///
    /// Threads outside the mask are reported as empty. A reply that never
    /// reaches the prompt fails with [`Timeout`](crate::KHIError::Timeout), a transport-class
    /// error like `Connection`, and leaves the session unusable.
    pub async fn get_pc_status(&mut self, mask: ThreadMask) -> Result<[ThreadState; 5]> {
        let mut states: [ThreadState; PC_THREADS as usize] =
            std::array::from_fn(|i| ThreadState::empty(i as u8 + 1));

        for thread in mask.threads() {
            let reply = self.command(&protocol::pc_status(thread)).await?;
            states[thread as usize - 1] = parse_thread_status(thread, &reply_text(&reply));
        }
        Ok(states)
    }

    /// Queries the RCP slot.
    ///
    /// As with [`Session::get_pc_status`], a reply cut off before the prompt
    /// surfaces as [`Timeout`](crate::KHIError::Timeout) rather than `Connection`.
    pub async fn get_rcp_status(&mut self) -> Result<RcpState> {
        let reply = self.command("STATUS").await?;
        Ok(parse_rcp_status(&reply_text(&reply)))
    }

    /// Reads the motion switches and, when ERROR is on, the error text
    pub async fn robot_state(&mut self) -> Result<RobotState> {
        let mut state = RobotState {
            power: self.get_switch("POWER").await?,
            cycle_start: self.get_switch("CS").await?,
            rgso: self.get_switch("RGSO").await?,
            error: self.get_switch("ERROR").await?,
            repeat: self.get_switch("REPEAT").await?,
            run: self.get_switch("RUN").await?,
            error_description: None,
        };
        if state.error {
            state.error_description = self.error_description().await?;
        }
        Ok(state)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Captured controller status replies

    pub fn pc_running(thread: u8, name: &str, step: i32) -> String {
        format!(
            "PCSTATUS {thread}:\r\nPC status:  Program is running\r\nExecution cycles\r\n   Completed cycles: 3\r\n   Remaining cycles: Infinite\r\nProgram name   Priority  Step No.\r\n {name}    0    {step}   WHILE TRUE DO\r\n>"
        )
    }

    pub fn pc_loaded(thread: u8, name: &str) -> String {
        format!(
            "PCSTATUS {thread}:\r\nPC status:  Program is not running\r\nExecution cycles\r\n   Completed cycles: 1\r\n   Remaining cycles: 0\r\nProgram name   Priority  Step No.\r\n {name}    0    1   TWAIT 0.1\r\n>"
        )
    }

    pub fn pc_empty(thread: u8) -> String {
        format!("PCSTATUS {thread}:\r\nPC status:  Program is not running\r\nNo program is running.\r\n>")
    }

    /// Body of a PCSTATUS reply, without echo and prompt
    pub fn body(reply: &str) -> String {
        let start = reply.find("\r\n").map(|i| i + 2).unwrap_or(0);
        reply[start..reply.len() - 1].to_string()
    }

    pub const RCP_REPEAT_RUNNING: &str = "STATUS\r\n Monitor speed(%) =    10.0\r\n Program speed(%) ALWAYS =   100.0    10.0\r\n ALWAYS Accu.[mm] =     1.0\r\nREPEAT mode  CYCLE START ON\r\nStepper status:  Program is running.\r\nExecution cycles\r\n   Completed cycles: 0\r\n   Remaining cycles: 1\r\nProgram name   Priority  Step No.\r\n kep               1       4   LMOVE #a\r\n>";

    pub const RCP_REPEAT_IDLE: &str = "STATUS\r\n Monitor speed(%) =    10.0\r\n Program speed(%) ALWAYS =   100.0    10.0\r\n ALWAYS Accu.[mm] =     1.0\r\nREPEAT mode\r\nStepper status:  Program is not running.\r\nNo program is running.\r\n>";

    pub const RCP_TEACH_MOTORS_OFF: &str = "STATUS\r\nMotor power OFF\r\nTEACH mode\r\nStepper status:  Program is not running.\r\nNo program is running.\r\n>";
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::protocol::pack_threads;
    use crate::session::test_support::{logged_in_mock, session};
    use crate::transport::mock::MockTransport;

    #[test]
    fn test_parse_running_thread() {
        let state = parse_thread_status(2, &pc_running(2, "posmon.pc", 7));
        assert_eq!(state.thread_num, 2);
        assert_eq!(state.name, "posmon.pc");
        assert!(state.running);
        assert_eq!(state.step_num, 7);
        assert_eq!(state.completed_cycles, 3);
        assert_eq!(state.remaining_cycles, -1);
    }

    #[test]
    fn test_parse_loaded_idle_thread() {
        let state = parse_thread_status(1, &pc_loaded(1, "kep"));
        assert_eq!(state.name, "kep");
        assert!(!state.running);
        assert_eq!(state.step_num, 1);
    }

    #[test]
    fn test_empty_thread_invariant() {
        for raw in [pc_empty(3), String::from(">"), String::new()] {
            let state = parse_thread_status(3, &raw);
            assert_eq!(state.name, "");
            assert!(!state.running);
            assert_eq!(state.step_num, -1);
        }
    }

    #[test]
    fn test_echo_only_thread_reply_is_empty() {
        let state = parse_thread_status(3, "PCSTATUS 3:\r\n>");
        assert_eq!(state, ThreadState::empty(3));
    }

    #[test]
    fn test_program_line_follows_header() {
        // status lines without the program header carry no program
        let raw = "PCSTATUS 4:\r\nPC status:  Program is not running\r\nExecution cycles\r\n   Completed cycles: 2\r\n>";
        let state = parse_thread_status(4, raw);
        assert_eq!(state.name, "");
        assert_eq!(state.step_num, -1);
        assert_eq!(state.completed_cycles, 2);
    }

    #[test]
    fn test_rcp_mode_line_is_not_a_program() {
        let state = parse_rcp_status("STATUS\r\nREPEAT mode\r\n>");
        assert_eq!(state.name, "");
        assert!(!state.is_loaded());
        assert!(!state.running);
        assert!(state.repeat_mode);
        assert_eq!(state.step_num, -1);
    }

    #[test]
    fn test_parse_rcp_running() {
        let state = parse_rcp_status(RCP_REPEAT_RUNNING);
        assert_eq!(state.name, "kep");
        assert!(state.running);
        assert!(state.repeat_mode);
        assert!(state.motor_on);
        assert_eq!(state.step_num, 4);
        assert_eq!(state.monitor_speed, Some(10.0));
        assert_eq!(state.program_speed, Some(100.0));
        assert_eq!(state.accuracy, Some(1.0));
        assert_eq!(state.remaining_cycles, 1);
        assert_eq!(state.stepper_status.as_deref(), Some("Program is running"));
    }

    #[test]
    fn test_parse_rcp_idle_and_teach() {
        let idle = parse_rcp_status(RCP_REPEAT_IDLE);
        assert!(idle.repeat_mode);
        assert!(!idle.running);
        assert_eq!(idle.name, "");

        let teach = parse_rcp_status(RCP_TEACH_MOTORS_OFF);
        assert!(!teach.repeat_mode);
        assert!(!teach.motor_on);
        assert_eq!(teach.monitor_speed, None);
    }

    #[test]
    fn test_short_rcp_reply_is_default() {
        assert_eq!(parse_rcp_status("STATUS\r\n>"), RcpState::default());
    }

    #[tokio::test]
    async fn test_pc_status_queries_masked_threads_in_order() {
        let mock = logged_in_mock()
            .command("PCSTATUS 2:", &body(&pc_loaded(2, "kep")))
            .command("PCSTATUS 4:", &body(&pc_running(4, "posmon.pc", 2)));
        let log = mock.sent_log();
        let mut session = session(mock).await;

        let mask = pack_threads(&[4, 2]).unwrap();
        let states = session.get_pc_status(mask).await.unwrap();

        assert_eq!(
            MockTransport::render(&log)[1..],
            ["PCSTATUS 2:\n", "PCSTATUS 4:\n"]
        );
        let loaded: Vec<u8> = states
            .iter()
            .filter(|s| s.is_loaded())
            .map(|s| s.thread_num)
            .collect();
        assert_eq!(loaded.len() as u32, mask.count());
        assert_eq!(loaded, vec![2, 4]);
        for (i, state) in states.iter().enumerate() {
            assert_eq!(state.thread_num as usize, i + 1);
        }
    }

    #[tokio::test]
    async fn test_cut_off_status_reply_times_out() {
        let mock = logged_in_mock().expect(b"PCSTATUS 1:\n", b"PCSTATUS 1:\r\nPC status:");
        let mut session = session(mock).await;

        let err = session.get_pc_status(ThreadMask::ALL).await.unwrap_err();
        assert!(matches!(err, crate::KHIError::Timeout { .. }));
        assert!(err.is_transport());
        assert!(!session.is_usable());
    }

    #[tokio::test]
    async fn test_robot_state_reads_error_description() {
        let mock = logged_in_mock()
            .command("SWITCH POWER", " POWER   ON\r\n")
            .command("SWITCH CS", " CS   OFF\r\n")
            .command("SWITCH RGSO", " RGSO   OFF\r\n")
            .command("SWITCH ERROR", " ERROR   ON\r\n")
            .command("SWITCH REPEAT", " REPEAT   ON\r\n")
            .command("SWITCH RUN", " RUN   ON\r\n")
            .command("type $ERROR(ERROR)", "(E0102) Emergency stop\r\n");
        let mut session = session(mock).await;

        let state = session.robot_state().await.unwrap();
        assert!(state.power && state.error && state.repeat && state.run);
        assert!(!state.cycle_start && !state.rgso);
        assert_eq!(
            state.error_description.as_deref(),
            Some("(E0102) Emergency stop")
        );
    }
}
